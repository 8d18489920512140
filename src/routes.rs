use crate::errors::{BridgeError, Result};
use crate::jobs::{loose_string, loose_u64, normalized_department, KitchenJob};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const RAW_TCP_DEFAULT_PORT: u16 = 9100;

/// A printer as configured in the restaurant settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivePrinter {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub enabled: bool,
    pub departments: Vec<String>,
}

impl LivePrinter {
    fn is_usable(&self) -> bool {
        self.enabled && !self.host.trim().is_empty()
    }
}

/// Live printer table from `restaurants.settings.printing`, indexed for the
/// resolution chain.
#[derive(Debug, Clone, Default)]
pub struct LiveRoutes {
    by_id: HashMap<String, LivePrinter>,
    by_department: HashMap<String, String>,
    default_printer_id: Option<String>,
}

impl LiveRoutes {
    /// Accepts either the whole `settings` object or the `printing` object.
    pub fn from_settings(settings: &Value) -> LiveRoutes {
        let printing = settings.get("printing").unwrap_or(settings);

        let mut routes = LiveRoutes {
            default_printer_id: printing
                .get("default_printer_id")
                .and_then(loose_string)
                .filter(|id| !id.is_empty()),
            ..Default::default()
        };

        let Some(rows) = printing.get("printers").and_then(|v| v.as_array()) else {
            return routes;
        };

        for row in rows {
            let Some(printer) = printer_from_row(row) else {
                continue;
            };
            // First enabled printer wins a department slot.
            if printer.is_usable() {
                for department in &printer.departments {
                    routes
                        .by_department
                        .entry(normalized_department(department))
                        .or_insert_with(|| printer.id.clone());
                }
            }
            routes.by_id.insert(printer.id.clone(), printer);
        }

        routes
    }

    pub fn printer(&self, id: &str) -> Option<&LivePrinter> {
        self.by_id.get(id)
    }

    pub fn department_printer(&self, department: &str) -> Option<&LivePrinter> {
        self.by_department
            .get(&normalized_department(department))
            .and_then(|id| self.by_id.get(id))
    }

    pub fn default_printer(&self) -> Option<&LivePrinter> {
        self.default_printer_id
            .as_deref()
            .and_then(|id| self.by_id.get(id))
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

fn printer_from_row(row: &Value) -> Option<LivePrinter> {
    let id = row.get("id").and_then(loose_string)?;
    Some(LivePrinter {
        name: row
            .get("name")
            .and_then(loose_string)
            .unwrap_or_else(|| id.clone()),
        id,
        host: row
            .get("host")
            .and_then(loose_string)
            .map(|h| h.trim().to_string())
            .unwrap_or_default(),
        port: sanitize_printer_port(row.get("port").and_then(loose_u64).map(|p| p as i64)),
        enabled: row.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false),
        departments: row
            .get("departments")
            .and_then(|v| v.as_array())
            .map(|rows| rows.iter().filter_map(loose_string).collect())
            .unwrap_or_default(),
    })
}

/// Out-of-range or missing ports collapse to the raw-TCP default.
pub fn sanitize_printer_port(raw: Option<i64>) -> u16 {
    match raw {
        Some(port) if (1..=65_535).contains(&port) => port as u16,
        _ => RAW_TCP_DEFAULT_PORT,
    }
}

/// Where a kitchen ticket physically goes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintTarget {
    pub id: Option<String>,
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl PrintTarget {
    fn from_live(printer: &LivePrinter) -> PrintTarget {
        PrintTarget {
            id: Some(printer.id.clone()),
            name: printer.name.clone(),
            host: printer.host.clone(),
            port: printer.port,
        }
    }
}

/// Resolution order: snapshot id against the live table, then the job's
/// department, then the restaurant default, then the snapshot's inline host.
pub fn resolve_kitchen_target(job: &KitchenJob, routes: &LiveRoutes) -> Result<PrintTarget> {
    if let Some(snapshot_id) = job
        .route
        .as_ref()
        .and_then(|r| r.get("id"))
        .and_then(loose_string)
    {
        if let Some(printer) = routes.printer(&snapshot_id) {
            if printer.is_usable() {
                return Ok(PrintTarget::from_live(printer));
            }
        }
    }

    if let Some(printer) = routes.department_printer(&job.department) {
        if printer.is_usable() {
            return Ok(PrintTarget::from_live(printer));
        }
    }

    if let Some(printer) = routes.default_printer() {
        if printer.is_usable() {
            return Ok(PrintTarget::from_live(printer));
        }
    }

    if let Some(route) = &job.route {
        if let Some(host) = route
            .get("host")
            .and_then(loose_string)
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
        {
            return Ok(PrintTarget {
                id: route.get("id").and_then(loose_string),
                name: route
                    .get("name")
                    .and_then(loose_string)
                    .unwrap_or_else(|| host.clone()),
                port: sanitize_printer_port(route.get("port").and_then(loose_u64).map(|p| p as i64)),
                host,
            });
        }
    }

    Err(BridgeError::NoPrinterHost)
}
