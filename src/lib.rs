//! Sushiamo print bridge: the desktop worker that claims print jobs from the
//! cloud queue, renders them for kitchen and fiscal printers on the local
//! network, and acknowledges every outcome back to the backend.
//!
//! The desktop shell hosts this crate: it supplies the user-data directory,
//! forwards the webapp session, and consumes the state/log broadcast streams.

pub mod config;
pub mod discovery;
pub mod errors;
pub mod escpos;
pub mod fpmate;
pub mod jobs;
pub mod routes;
pub mod session;
pub mod state;
pub mod supabase;
pub mod transport;
pub mod worker;

pub use config::{AgentConfig, AgentConfigPatch, BackendSettings, SessionSnapshot, StateStore};
pub use errors::{BridgeError, Result};
pub use state::{LogLevel, LogRow, PublicState};
pub use worker::{PrintWorker, RtTestRequest};
