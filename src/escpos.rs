use crate::jobs::{CourtesyReceipt, KitchenTicket, PaymentMethod};

/// ESC/POS command bytes
const ESC: u8 = 0x1b;
const GS: u8 = 0x1d;
const LF: u8 = 0x0a;

/// Font B at character spacing 2 gives 42 usable columns on 80mm paper.
pub const TICKET_WIDTH: usize = 42;
const NOTE_WIDTH: usize = 40;
const FEED_BEFORE_CUT: u8 = 7;

/// How a text line is emphasized on paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineClass {
    /// Bold off, normal size (`GS ! 0x00`)
    Plain,
    /// Bold on, normal size; fits a full 42-column row
    Strong,
    /// Bold on, double width and height (`GS ! 0x11`)
    Big,
}

#[derive(Debug, Clone)]
struct TicketLine {
    class: LineClass,
    text: String,
}

impl TicketLine {
    fn plain(text: impl Into<String>) -> Self {
        Self { class: LineClass::Plain, text: text.into() }
    }

    fn strong(text: impl Into<String>) -> Self {
        Self { class: LineClass::Strong, text: text.into() }
    }

    fn big(text: impl Into<String>) -> Self {
        Self { class: LineClass::Big, text: text.into() }
    }
}

/// ESC/POS command builder, restricted to what the tickets need.
pub struct EscPosBuilder {
    buffer: Vec<u8>,
}

impl EscPosBuilder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn build(self) -> Vec<u8> {
        self.buffer
    }

    /// ESC @ - reset the printer
    pub fn initialize(&mut self) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x40]);
        self
    }

    /// ESC M n - font select (Font B = compressed)
    pub fn font_b(&mut self) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x4d, 0x01]);
        self
    }

    /// ESC SP n - right-side character spacing
    pub fn char_spacing(&mut self, n: u8) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x20, n]);
        self
    }

    /// ESC E n
    pub fn bold(&mut self, enabled: bool) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x45, if enabled { 1 } else { 0 }]);
        self
    }

    /// GS ! n - width/height multiplier byte
    pub fn size(&mut self, n: u8) -> &mut Self {
        self.buffer.extend_from_slice(&[GS, 0x21, n]);
        self
    }

    pub fn text(&mut self, text: &str) -> &mut Self {
        self.buffer.extend_from_slice(text.as_bytes());
        self
    }

    pub fn line_feed(&mut self) -> &mut Self {
        self.buffer.push(LF);
        self
    }

    /// ESC d n then GS V 0 - feed past the tear bar and cut
    pub fn feed_and_cut(&mut self, lines: u8) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x64, lines]);
        self.buffer.extend_from_slice(&[GS, 0x56, 0x00]);
        self
    }
}

impl Default for EscPosBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn render_lines(lines: &[TicketLine]) -> Vec<u8> {
    let mut builder = EscPosBuilder::new();
    builder.initialize().font_b().char_spacing(2);

    for line in lines {
        match line.class {
            LineClass::Big => builder.bold(true).size(0x11),
            LineClass::Strong => builder.bold(true).size(0x00),
            LineClass::Plain => builder.bold(false).size(0x00),
        };
        builder.text(&line.text).line_feed();
    }

    builder.feed_and_cut(FEED_BEFORE_CUT);
    builder.build()
}

/// Render a kitchen comanda. Deterministic for a given ticket: the timestamp
/// comes from the job payload, never from the clock.
pub fn render_kitchen_ticket(ticket: &KitchenTicket) -> Vec<u8> {
    render_lines(&kitchen_ticket_lines(ticket))
}

fn kitchen_ticket_lines(ticket: &KitchenTicket) -> Vec<TicketLine> {
    let mut lines = Vec::new();

    lines.push(TicketLine::plain(format!(
        "COMANDA {} #{}",
        ticket.department_label.to_uppercase(),
        ticket.order_number
    )));
    lines.push(TicketLine::big(format!(
        "TAVOLO: {}",
        ticket.table_number.to_uppercase()
    )));

    if let Some(at) = ticket.created_at {
        use chrono::{Datelike, Timelike};
        lines.push(TicketLine::plain(format!(
            "DATA: {}/{}/{} {:02}:{:02}",
            at.year(),
            at.month(),
            at.day(),
            at.hour(),
            at.minute()
        )));
    }

    lines.push(TicketLine::plain("-".repeat(TICKET_WIDTH)));

    for item in &ticket.items {
        let item_text = format!("{}x {}", item.quantity, prettify_dish_name(&item.name));
        for segment in wrap_text(&item_text, TICKET_WIDTH) {
            lines.push(TicketLine::big(segment));
        }
        if let Some(notes) = &item.notes {
            for segment in wrap_text(&format!("Nota: {}", notes), NOTE_WIDTH) {
                lines.push(TicketLine::plain(format!(" {}", segment)));
            }
        }
    }

    lines.push(TicketLine::plain(format!("-- {} --", ticket.restaurant_name)));
    lines
}

/// Render the non-fiscal courtesy receipt.
pub fn render_courtesy_receipt(receipt: &CourtesyReceipt) -> Vec<u8> {
    render_lines(&courtesy_receipt_lines(receipt))
}

fn courtesy_receipt_lines(receipt: &CourtesyReceipt) -> Vec<TicketLine> {
    let frame = "=".repeat(TICKET_WIDTH);
    let mut lines = Vec::new();

    lines.push(TicketLine::plain(frame.clone()));
    lines.push(TicketLine::plain(center_text(&receipt.restaurant_name)));
    lines.push(TicketLine::plain(frame.clone()));

    if !receipt.table_number.trim().is_empty() {
        lines.push(TicketLine::plain(format!("Tavolo {}", receipt.table_number)));
    }

    for (label, amount) in [
        ("AYCE", receipt.ayce),
        ("Coperto", receipt.coperto),
        ("Extra", receipt.extra),
    ] {
        if amount > 0.0 {
            lines.push(TicketLine::plain(amount_row(label, amount)));
        }
    }

    lines.push(TicketLine::plain("-".repeat(TICKET_WIDTH)));
    lines.push(TicketLine::strong(amount_row("TOTALE", receipt.total)));
    lines.push(TicketLine::plain(match receipt.payment {
        PaymentMethod::Cash => "Contanti",
        PaymentMethod::Card => "Carta",
    }));
    lines.push(TicketLine::plain(frame));
    lines.push(TicketLine::plain(center_text("Grazie per la visita!")));
    lines.push(TicketLine::plain(center_text("*** NON FISCALE ***")));
    lines
}

/// Label on the left, `€ X,YY` flush right.
fn amount_row(label: &str, amount: f64) -> String {
    let value = format_eur(amount);
    let padding = TICKET_WIDTH.saturating_sub(label.chars().count() + value.chars().count());
    format!("{}{}{}", label, " ".repeat(padding.max(1)), value)
}

/// Comma-decimal euro amount, absolute value.
pub fn format_eur(amount: f64) -> String {
    format!("€ {:.2}", amount.abs()).replace('.', ",")
}

fn center_text(text: &str) -> String {
    let len = text.chars().count();
    if len >= TICKET_WIDTH {
        return text.to_string();
    }
    format!("{}{}", " ".repeat((TICKET_WIDTH - len) / 2), text)
}

/// Kitchen staff type names in every case imaginable. Mixed-case names are
/// kept as typed; single-case names (ALL CAPS or all lower) get title-cased
/// per whitespace-separated token.
pub fn prettify_dish_name(name: &str) -> String {
    let has_lower = name.chars().any(|c| c.is_lowercase());
    let has_upper = name.chars().any(|c| c.is_uppercase());
    if has_lower && has_upper {
        return name.to_string();
    }

    name.split_whitespace()
        .map(title_case_token)
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case_token(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => {
            first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
        }
        None => String::new(),
    }
}

/// Greedy word wrap; words longer than the width are hard-split.
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let mut word = word.to_string();
        while word.chars().count() > width {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let head: String = word.chars().take(width).collect();
            word = word.chars().skip(width).collect();
            lines.push(head);
        }

        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };

        if needed > width && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }

    if !current.is_empty() {
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::TicketItem;

    fn ticket() -> KitchenTicket {
        KitchenTicket {
            restaurant_name: "Aoyama".into(),
            department_label: "cucina".into(),
            table_number: "7".into(),
            order_number: "42".into(),
            created_at: Some(
                chrono::DateTime::parse_from_rfc3339("2024-01-15T12:30:00Z")
                    .unwrap()
                    .with_timezone(&chrono::Utc),
            ),
            items: vec![
                TicketItem {
                    name: "TUNA ROLL".into(),
                    quantity: 2,
                    notes: None,
                },
                TicketItem {
                    name: "salmon nigiri".into(),
                    quantity: 1,
                    notes: Some("no wasabi".into()),
                },
            ],
        }
    }

    fn text_of(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).to_string()
    }

    #[test]
    fn test_kitchen_ticket_framing() {
        let bytes = render_kitchen_ticket(&ticket());
        // ESC @, ESC M 1, ESC SP 2
        assert_eq!(&bytes[..8], &[0x1b, 0x40, 0x1b, 0x4d, 0x01, 0x1b, 0x20, 0x02]);
        // ESC d 7, GS V 0
        assert_eq!(&bytes[bytes.len() - 6..], &[0x1b, 0x64, 0x07, 0x1d, 0x56, 0x00]);
    }

    #[test]
    fn test_kitchen_ticket_text() {
        let text = text_of(&render_kitchen_ticket(&ticket()));
        assert!(text.contains("COMANDA CUCINA #42"));
        assert!(text.contains("TAVOLO: 7"));
        assert!(text.contains("DATA: 2024/1/15 12:30"));
        assert!(text.contains("2x Tuna Roll"));
        assert!(text.contains("1x Salmon Nigiri"));
        assert!(text.contains(" Nota: no wasabi"));
        assert!(text.contains("-- Aoyama --"));
        assert!(text.contains(&"-".repeat(42)));
    }

    #[test]
    fn test_item_lines_are_emphasized() {
        let bytes = render_kitchen_ticket(&ticket());
        let text = text_of(&bytes);
        // Bold + 2x2 immediately before the TAVOLO line
        let needle = [0x1b, 0x45, 0x01, 0x1d, 0x21, 0x11];
        let tavolo_at = text.find("TAVOLO: 7").unwrap();
        assert_eq!(&bytes[tavolo_at - 6..tavolo_at], &needle);
        let item_at = text.find("2x Tuna Roll").unwrap();
        assert_eq!(&bytes[item_at - 6..item_at], &needle);
        // Plain for the rule line
        let rule_at = text.find(&"-".repeat(42)).unwrap();
        assert_eq!(&bytes[rule_at - 6..rule_at], &[0x1b, 0x45, 0x00, 0x1d, 0x21, 0x00]);
    }

    #[test]
    fn test_render_is_deterministic() {
        assert_eq!(render_kitchen_ticket(&ticket()), render_kitchen_ticket(&ticket()));
    }

    #[test]
    fn test_prettify_dish_name() {
        assert_eq!(prettify_dish_name("TUNA ROLL"), "Tuna Roll");
        assert_eq!(prettify_dish_name("salmon nigiri"), "Salmon Nigiri");
        assert_eq!(prettify_dish_name("Sake Maki speciale"), "Sake Maki speciale");
    }

    #[test]
    fn test_wrap_text_width() {
        let wrapped = wrap_text("uno due tre quattro cinque sei sette otto nove dieci", 12);
        assert!(wrapped.iter().all(|l| l.chars().count() <= 12));
        assert_eq!(wrapped.join(" "), "uno due tre quattro cinque sei sette otto nove dieci");

        let long = wrap_text("superlongwordwithoutanybreaks", 10);
        assert!(long.len() >= 3);
        assert!(long.iter().all(|l| l.chars().count() <= 10));
    }

    #[test]
    fn test_courtesy_receipt_rows() {
        let receipt = CourtesyReceipt {
            restaurant_name: "Aoyama".into(),
            table_number: "5".into(),
            ayce: 25.0,
            coperto: 2.0,
            extra: 0.0,
            total: 27.0,
            payment: PaymentMethod::Card,
        };
        let text = text_of(&render_courtesy_receipt(&receipt));

        assert!(text.contains("€ 25,00"));
        assert!(text.contains("€ 2,00"));
        assert!(!text.contains("Extra"));
        assert!(text.contains("TOTALE"));
        assert!(text.contains("Carta"));
        assert!(text.contains("Grazie per la visita!"));
        assert!(text.contains("*** NON FISCALE ***"));
        assert!(text.contains(&"=".repeat(42)));
    }

    #[test]
    fn test_amount_row_right_aligned() {
        let row = amount_row("AYCE", 25.0);
        assert_eq!(row.chars().count(), 42);
        assert!(row.starts_with("AYCE"));
        assert!(row.ends_with("€ 25,00"));
    }

    #[test]
    fn test_format_eur_absolute_comma() {
        assert_eq!(format_eur(12.34), "€ 12,34");
        assert_eq!(format_eur(-3.5), "€ 3,50");
        assert_eq!(format_eur(0.0), "€ 0,00");
    }
}
