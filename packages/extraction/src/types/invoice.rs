//! The extracted invoice record: the result payload of a processing job.

use serde::{Deserialize, Serialize};

/// One line item of an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub line_total: f64,
}

/// A structured invoice record extracted from one PDF.
///
/// Numeric fields are dot-decimal numbers; dates are ISO `yyyy-mm-dd`.
/// The tolerant parser in [`crate::parser`] is the only intended producer;
/// it accepts alternate field casings and locale-formatted numbers and
/// normalizes them into this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceRecord {
    pub invoice_number: String,
    pub invoice_date: String,
    pub vendor_name: String,
    pub currency: String,
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    pub line_items: Vec<LineItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl InvoiceRecord {
    /// All required header fields are populated: invoice number, date,
    /// vendor and the three totals. A zero-rated invoice counts its tax
    /// as present when the subtotal carries the whole total.
    pub fn is_structurally_valid(&self) -> bool {
        !self.invoice_number.is_empty()
            && !self.invoice_date.is_empty()
            && !self.vendor_name.is_empty()
            && self.subtotal != 0.0
            && self.total != 0.0
            && (self.tax != 0.0 || self.subtotal == self.total)
    }

    /// Fraction of expected fields that carry a value, in [0, 1].
    pub fn coverage(&self) -> f64 {
        let mut populated = 0u32;
        let mut expected = 0u32;

        for present in [
            !self.invoice_number.is_empty(),
            !self.invoice_date.is_empty(),
            !self.vendor_name.is_empty(),
            !self.currency.is_empty(),
            self.subtotal != 0.0,
            self.tax != 0.0 || self.subtotal == self.total,
            self.total != 0.0,
            self.due_date.is_some(),
            !self.line_items.is_empty(),
        ] {
            expected += 1;
            if present {
                populated += 1;
            }
        }

        f64::from(populated) / f64::from(expected)
    }
}
