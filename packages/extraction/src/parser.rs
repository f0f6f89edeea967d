//! Tolerant parser for LLM invoice replies.
//!
//! Providers are prompted for strict JSON but drift in practice: markdown
//! fences around the object, alternate field casings, locale-formatted
//! numbers, regional date orders. This module accepts all of that and
//! normalizes to the canonical [`InvoiceRecord`] shape (dot-decimal
//! numbers, ISO dates).

use serde_json::Value;

use crate::error::{ExtractionError, Result};
use crate::types::invoice::{InvoiceRecord, LineItem};

/// Parse a raw LLM reply into an invoice record.
pub fn parse_invoice(provider: &'static str, reply: &str) -> Result<InvoiceRecord> {
    let json = extract_json_object(reply).ok_or_else(|| ExtractionError::UnparseableReply {
        provider,
        reason: "no JSON object in reply".to_string(),
    })?;

    let value: Value =
        serde_json::from_str(&json).map_err(|e| ExtractionError::UnparseableReply {
            provider,
            reason: format!("invalid JSON: {e}"),
        })?;

    let obj = value
        .as_object()
        .ok_or_else(|| ExtractionError::UnparseableReply {
            provider,
            reason: "reply is not a JSON object".to_string(),
        })?;

    let line_items = field(obj, &["lineItems", "items", "lines"])
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_line_item).collect())
        .unwrap_or_default();

    Ok(InvoiceRecord {
        invoice_number: string_field(obj, &["invoiceNumber", "invoiceNo", "number"]),
        invoice_date: date_field(obj, &["invoiceDate", "date"]),
        vendor_name: string_field(obj, &["vendorName", "vendor", "supplier", "supplierName"]),
        currency: currency_field(obj),
        subtotal: amount_field(obj, &["subtotal", "subTotal", "net", "netAmount"]),
        tax: amount_field(obj, &["tax", "vat", "taxAmount", "vatAmount"]),
        total: amount_field(obj, &["total", "totalAmount", "grandTotal", "amountDue"]),
        due_date: {
            let d = date_field(obj, &["dueDate", "paymentDue"]);
            (!d.is_empty()).then_some(d)
        },
        line_items,
        notes: {
            let n = string_field(obj, &["notes", "remarks", "comment"]);
            (!n.is_empty()).then_some(n)
        },
    })
}

fn parse_line_item(value: &Value) -> Option<LineItem> {
    let obj = value.as_object()?;
    Some(LineItem {
        description: string_field(obj, &["description", "item", "name", "label"]),
        quantity: amount_field(obj, &["quantity", "qty", "amount"]),
        unit_price: amount_field(obj, &["unitPrice", "price", "rate"]),
        line_total: amount_field(obj, &["lineTotal", "total", "sum"]),
    })
}

/// Cut the first balanced `{ … }` span out of the reply, skipping markdown
/// fences and prose around it.
fn extract_json_object(reply: &str) -> Option<String> {
    let start = reply.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in reply[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(reply[start..=start + offset].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Case- and separator-insensitive field lookup: `invoice_number`,
/// `InvoiceNumber` and `invoice-number` all match the `invoiceNumber`
/// alias.
fn field<'a>(obj: &'a serde_json::Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    for alias in aliases {
        let want = fold_key(alias);
        if let Some((_, v)) = obj.iter().find(|(k, _)| fold_key(k) == want) {
            return Some(v);
        }
    }
    None
}

fn fold_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn string_field(obj: &serde_json::Map<String, Value>, aliases: &[&str]) -> String {
    match field(obj, aliases) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn amount_field(obj: &serde_json::Map<String, Value>, aliases: &[&str]) -> f64 {
    match field(obj, aliases) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => parse_amount(s).unwrap_or(0.0),
        _ => 0.0,
    }
}

fn date_field(obj: &serde_json::Map<String, Value>, aliases: &[&str]) -> String {
    match field(obj, aliases) {
        Some(Value::String(s)) => normalize_date(s).unwrap_or_default(),
        _ => String::new(),
    }
}

fn currency_field(obj: &serde_json::Map<String, Value>) -> String {
    let raw = string_field(obj, &["currency", "currencyCode"]);
    match raw.trim() {
        "" => "EUR".to_string(),
        "€" => "EUR".to_string(),
        "$" => "USD".to_string(),
        "£" => "GBP".to_string(),
        code => code.to_ascii_uppercase(),
    }
}

/// Parse a numeric string with currency symbols, thousands separators and
/// comma or dot decimals into a dot-decimal number.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let has_dot = cleaned.contains('.');
    let has_comma = cleaned.contains(',');

    let normalized = match (has_dot, has_comma) {
        // Both present: the later separator is the decimal mark.
        (true, true) => {
            if cleaned.rfind('.') > cleaned.rfind(',') {
                cleaned.replace(',', "")
            } else {
                cleaned.replace('.', "").replace(',', ".")
            }
        }
        (false, true) => disambiguate_single_separator(&cleaned, ','),
        (true, false) => disambiguate_single_separator(&cleaned, '.'),
        (false, false) => cleaned,
    };

    normalized.parse().ok()
}

/// One separator kind present: decimal mark when it occurs once with one or
/// two trailing digits, thousands separator otherwise.
fn disambiguate_single_separator(s: &str, sep: char) -> String {
    let occurrences = s.matches(sep).count();
    let trailing = s.rsplit(sep).next().map(str::len).unwrap_or(0);

    if occurrences == 1 && (1..=2).contains(&trailing) {
        s.replace(sep, ".")
    } else {
        s.replace(sep, "")
    }
}

/// Normalize a date string to ISO `yyyy-mm-dd`.
///
/// Accepts `y-m-d`, `d-m-y` and `d/m/y` (also with `.` separators) and
/// two-digit years.
pub fn normalize_date(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let parts: Vec<&str> = trimmed
        .split(['-', '/', '.'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() != 3 {
        return None;
    }

    let nums: Vec<u32> = parts.iter().map(|p| p.parse().ok()).collect::<Option<_>>()?;

    let (year, month, day) = if parts[0].len() == 4 {
        // y-m-d
        (nums[0], nums[1], nums[2])
    } else {
        // d-m-y / d/m/y
        let year = if parts[2].len() == 2 {
            2000 + nums[2]
        } else {
            nums[2]
        };
        (year, nums[1], nums[0])
    };

    if year < 1900 {
        return None;
    }
    let date = chrono::NaiveDate::from_ymd_opt(year as i32, month, day)?;
    Some(date.format("%Y-%m-%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_reply() {
        let reply = r#"{
            "invoiceNumber": "INV-001",
            "invoiceDate": "2024-03-01",
            "vendorName": "Acme GmbH",
            "currency": "EUR",
            "subtotal": 100.0,
            "tax": 19.0,
            "total": 119.0,
            "lineItems": [
                {"description": "Widgets", "quantity": 4, "unitPrice": 25, "lineTotal": 100}
            ]
        }"#;
        let record = parse_invoice("stub", reply).unwrap();
        assert_eq!(record.invoice_number, "INV-001");
        assert_eq!(record.line_items.len(), 1);
        assert_eq!(record.line_items[0].unit_price, 25.0);
    }

    #[test]
    fn accepts_markdown_fenced_reply() {
        let reply = "Here you go:\n```json\n{\"invoice_number\": \"A-9\", \"total\": \"10,00\"}\n```";
        let record = parse_invoice("stub", reply).unwrap();
        assert_eq!(record.invoice_number, "A-9");
        assert_eq!(record.total, 10.0);
    }

    #[test]
    fn accepts_alternate_casings_and_aliases() {
        let reply = r#"{"Invoice_Number": "X", "supplier": "Y", "grand_total": "5"}"#;
        let record = parse_invoice("stub", reply).unwrap();
        assert_eq!(record.invoice_number, "X");
        assert_eq!(record.vendor_name, "Y");
        assert_eq!(record.total, 5.0);
    }

    #[test]
    fn rejects_reply_without_json() {
        let err = parse_invoice("stub", "sorry, I cannot help").unwrap_err();
        assert!(matches!(err, ExtractionError::UnparseableReply { .. }));
    }

    #[test]
    fn currency_defaults_and_symbols() {
        let record = parse_invoice("stub", r#"{"invoiceNumber":"1"}"#).unwrap();
        assert_eq!(record.currency, "EUR");
        let record = parse_invoice("stub", r#"{"currency":"$"}"#).unwrap();
        assert_eq!(record.currency, "USD");
        let record = parse_invoice("stub", r#"{"currency":"usd"}"#).unwrap();
        assert_eq!(record.currency, "USD");
    }

    #[test]
    fn amount_parsing_handles_locales() {
        assert_eq!(parse_amount("1.234,56"), Some(1234.56));
        assert_eq!(parse_amount("1,234.56"), Some(1234.56));
        assert_eq!(parse_amount("119,00"), Some(119.0));
        assert_eq!(parse_amount("119.00"), Some(119.0));
        assert_eq!(parse_amount("1,234"), Some(1234.0));
        assert_eq!(parse_amount("1.234"), Some(1234.0));
        assert_eq!(parse_amount("€ 42"), Some(42.0));
        assert_eq!(parse_amount("-7,5"), Some(-7.5));
        assert_eq!(parse_amount("EUR"), None);
    }

    #[test]
    fn date_normalization_accepts_regional_orders() {
        assert_eq!(normalize_date("2024-03-01"), Some("2024-03-01".to_string()));
        assert_eq!(normalize_date("01/03/2024"), Some("2024-03-01".to_string()));
        assert_eq!(normalize_date("1-3-2024"), Some("2024-03-01".to_string()));
        assert_eq!(normalize_date("01.03.24"), Some("2024-03-01".to_string()));
        assert_eq!(normalize_date("not a date"), None);
        assert_eq!(normalize_date("99/99/2024"), None);
    }
}
