//! Epson FPMate XML documents for RT fiscal devices.

use crate::jobs::{FiscalReceipt, PaymentMethod};

/// Totals travel as integer cents; the device refuses a zero amount.
pub fn amount_cents(amount: f64) -> u64 {
    let cents = (amount.abs() * 100.0).round() as u64;
    cents.max(1)
}

/// Escape the five XML special characters for attribute values.
pub fn escape_xml(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// One complete fiscal receipt: a single line item for the table total and a
/// matching payment row.
pub fn fiscal_receipt_document(receipt: &FiscalReceipt) -> String {
    let cents = amount_cents(receipt.total_amount);
    let description = escape_xml(&format!("Sushiamo Tavolo {}", receipt.table_number));
    let payment_label = match receipt.payment {
        PaymentMethod::Card => "ELETTRONICO",
        PaymentMethod::Cash => "CONTANTI",
    };

    format!(
        r#"<FPMessage>
  <beginFiscalReceipt operator="1" />
  <printRecItem operator="1" description="{description}" price="{cents}" quantity="1" department="1" vatCode="1" />
  <printRecTotal operator="1" description="{payment_label}" payment="{cents}" />
  <endFiscalReceipt operator="1" />
</FPMessage>"#
    )
}

/// Connectivity test: prints a short non-fiscal slip, no fiscal memory write.
pub fn test_document() -> String {
    r#"<FPMessage>
  <beginNonFiscal operator="1" />
  <printNormal operator="1" font="1" data="Sushiamo - test collegamento" />
  <printNormal operator="1" font="1" data="Se leggi questo, il collegamento funziona" />
  <endNonFiscal operator="1" />
</FPMessage>"#
        .to_string()
}
