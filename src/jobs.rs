use crate::errors::{BridgeError, Result};
use serde_json::Value;

/// One claimed kitchen ticket job. `payload` stays a permissive bag; the
/// typed view is produced by [`KitchenJob::ticket`].
#[derive(Debug, Clone)]
pub struct KitchenJob {
    pub id: String,
    pub department: String,
    pub payload: Value,
    pub route: Option<Value>,
    pub created_at: Option<String>,
}

/// One claimed fiscal (RT) receipt job.
#[derive(Debug, Clone)]
pub struct FiscalJob {
    pub id: String,
    pub payload: Value,
    pub created_at: Option<String>,
}

/// One claimed non-fiscal courtesy receipt job.
#[derive(Debug, Clone)]
pub struct NonFiscalJob {
    pub id: String,
    pub payload: Value,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TicketItem {
    pub name: String,
    pub quantity: u32,
    pub notes: Option<String>,
}

/// Typed kitchen ticket content, ready for rendering.
#[derive(Debug, Clone)]
pub struct KitchenTicket {
    pub restaurant_name: String,
    pub department_label: String,
    pub table_number: String,
    pub order_number: String,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    pub items: Vec<TicketItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethod {
    Cash,
    Card,
}

impl PaymentMethod {
    pub fn parse(raw: &str) -> PaymentMethod {
        match raw.trim().to_lowercase().as_str() {
            "card" | "carta" | "electronic" | "elettronico" | "pos" => PaymentMethod::Card,
            _ => PaymentMethod::Cash,
        }
    }
}

/// Route to a fiscal device, embedded in fiscal/non-fiscal payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct RtRoute {
    pub host: String,
    pub port: u16,
    pub brand: String,
    pub api_path: String,
}

pub const RT_DEFAULT_PORT: u16 = 8008;
pub const FPMATE_API_PATH: &str = "/cgi-bin/fpmate.cgi";

impl RtRoute {
    pub fn from_value(value: &Value) -> Option<RtRoute> {
        let host = loose_string(value.get("host")?)?;
        if host.trim().is_empty() {
            return None;
        }
        let brand = value
            .get("brand")
            .and_then(loose_string)
            .unwrap_or_else(|| "epson".to_string())
            .to_lowercase();
        let api_path = value
            .get("api_path")
            .and_then(loose_string)
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| default_api_path(&brand).to_string());
        let port = value
            .get("port")
            .and_then(loose_u64)
            .filter(|p| (1..=65_535).contains(p))
            .map(|p| p as u16)
            .unwrap_or(RT_DEFAULT_PORT);

        Some(RtRoute {
            host: host.trim().to_string(),
            port,
            brand,
            api_path,
        })
    }
}

pub fn default_api_path(brand: &str) -> &'static str {
    if brand.eq_ignore_ascii_case("epson") {
        FPMATE_API_PATH
    } else {
        "/"
    }
}

/// Fiscal receipt content extracted from a fiscal job payload.
#[derive(Debug, Clone)]
pub struct FiscalReceipt {
    pub table_number: String,
    pub total_amount: f64,
    pub payment: PaymentMethod,
}

/// Non-fiscal courtesy receipt content.
#[derive(Debug, Clone)]
pub struct CourtesyReceipt {
    pub restaurant_name: String,
    pub table_number: String,
    pub ayce: f64,
    pub coperto: f64,
    pub extra: f64,
    pub total: f64,
    pub payment: PaymentMethod,
}

impl KitchenJob {
    pub fn from_row(row: &Value) -> Result<KitchenJob> {
        Ok(KitchenJob {
            id: require_id(row)?,
            department: row
                .get("department")
                .and_then(loose_string)
                .unwrap_or_default(),
            payload: row.get("payload").cloned().unwrap_or(Value::Null),
            route: row.get("route").filter(|v| !v.is_null()).cloned(),
            created_at: row.get("created_at").and_then(loose_string),
        })
    }

    pub fn ticket(&self) -> KitchenTicket {
        let payload = &self.payload;
        let items = payload
            .get("items")
            .and_then(|v| v.as_array())
            .map(|rows| rows.iter().filter_map(ticket_item).collect())
            .unwrap_or_default();

        KitchenTicket {
            restaurant_name: payload
                .get("restaurant_name")
                .and_then(loose_string)
                .unwrap_or_default(),
            department_label: normalized_department(&self.department),
            table_number: payload
                .get("table_number")
                .and_then(loose_string)
                .unwrap_or_default(),
            order_number: payload
                .get("order_number")
                .and_then(loose_string)
                .unwrap_or_default(),
            created_at: payload
                .get("created_at")
                .and_then(loose_string)
                .and_then(|raw| {
                    chrono::DateTime::parse_from_rfc3339(&raw)
                        .ok()
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                }),
            items,
        }
    }
}

fn ticket_item(row: &Value) -> Option<TicketItem> {
    let name = row.get("name").and_then(loose_string)?;
    Some(TicketItem {
        name,
        quantity: row
            .get("quantity")
            .and_then(loose_u64)
            .map(|q| q.min(u32::MAX as u64) as u32)
            .filter(|q| *q > 0)
            .unwrap_or(1),
        notes: row
            .get("notes")
            .and_then(loose_string)
            .filter(|n| !n.trim().is_empty()),
    })
}

impl FiscalJob {
    pub fn from_row(row: &Value) -> Result<FiscalJob> {
        Ok(FiscalJob {
            id: require_id(row)?,
            payload: row.get("payload").cloned().unwrap_or(Value::Null),
            created_at: row.get("created_at").and_then(loose_string),
        })
    }

    /// The route normally rides inside the payload; some queue writers put it
    /// on the row instead, so both spots are accepted (payload wins).
    pub fn route(&self, row_route: Option<&Value>) -> Option<RtRoute> {
        self.payload
            .get("route")
            .and_then(RtRoute::from_value)
            .or_else(|| row_route.and_then(RtRoute::from_value))
    }

    pub fn receipt(&self) -> FiscalReceipt {
        FiscalReceipt {
            table_number: self
                .payload
                .get("table_number")
                .and_then(loose_string)
                .unwrap_or_default(),
            total_amount: self
                .payload
                .get("total_amount")
                .and_then(loose_f64)
                .unwrap_or(0.0),
            payment: self
                .payload
                .get("payment_method")
                .and_then(loose_string)
                .map(|m| PaymentMethod::parse(&m))
                .unwrap_or(PaymentMethod::Cash),
        }
    }
}

impl NonFiscalJob {
    pub fn from_row(row: &Value) -> Result<NonFiscalJob> {
        Ok(NonFiscalJob {
            id: require_id(row)?,
            payload: row.get("payload").cloned().unwrap_or(Value::Null),
            created_at: row.get("created_at").and_then(loose_string),
        })
    }

    pub fn route(&self) -> Option<RtRoute> {
        self.payload.get("route").and_then(RtRoute::from_value)
    }

    pub fn receipt(&self) -> CourtesyReceipt {
        let amount = |keys: &[&str]| -> f64 {
            keys.iter()
                .find_map(|k| self.payload.get(*k).and_then(loose_f64))
                .unwrap_or(0.0)
        };

        CourtesyReceipt {
            restaurant_name: self
                .payload
                .get("restaurant_name")
                .and_then(loose_string)
                .unwrap_or_default(),
            table_number: self
                .payload
                .get("table_number")
                .and_then(loose_string)
                .unwrap_or_default(),
            ayce: amount(&["ayce_amount", "ayce"]),
            coperto: amount(&["coperto_amount", "coperto", "cover_amount"]),
            extra: amount(&["extra_amount", "extra"]),
            total: amount(&["total_amount", "total"]),
            payment: self
                .payload
                .get("payment_method")
                .and_then(loose_string)
                .map(|m| PaymentMethod::parse(&m))
                .unwrap_or(PaymentMethod::Cash),
        }
    }
}

/// Routing and header key for kitchen jobs; the floor default is the kitchen.
pub fn normalized_department(raw: &str) -> String {
    let trimmed = raw.trim().to_lowercase();
    if trimmed.is_empty() {
        "cucina".to_string()
    } else {
        trimmed
    }
}

fn require_id(row: &Value) -> Result<String> {
    row.get("id")
        .and_then(loose_string)
        .ok_or_else(|| BridgeError::Payload("Missing job id".to_string()))
}

/// Strings arrive as strings or numbers depending on the queue writer.
pub fn loose_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn loose_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

pub fn loose_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
