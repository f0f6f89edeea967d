//! Confidence scoring for extracted invoice records.

use crate::types::invoice::InvoiceRecord;

/// Relative tolerance for the arithmetic-consistency check.
const ARITHMETIC_EPSILON: f64 = 0.01;

const WEIGHT_OCR: f64 = 0.4;
const WEIGHT_STRUCTURE: f64 = 0.3;
const WEIGHT_ARITHMETIC: f64 = 0.2;
const WEIGHT_COVERAGE: f64 = 0.1;

/// Score a record in [0, 1] from four signals: OCR quality, structural
/// validity, arithmetic consistency and field coverage.
///
/// `ocr_quality` is the fraction of high-confidence characters when the
/// OCR tier reports per-word confidences; pass `None` otherwise and the
/// signal defaults to 1.0.
pub fn score(record: &InvoiceRecord, ocr_quality: Option<f64>) -> f64 {
    let ocr = ocr_quality.unwrap_or(1.0).clamp(0.0, 1.0);
    let structure = if record.is_structurally_valid() { 1.0 } else { 0.0 };
    let arithmetic = if is_arithmetically_consistent(record) { 1.0 } else { 0.0 };
    let coverage = record.coverage();

    let weighted = WEIGHT_OCR * ocr
        + WEIGHT_STRUCTURE * structure
        + WEIGHT_ARITHMETIC * arithmetic
        + WEIGHT_COVERAGE * coverage;

    weighted.clamp(0.0, 1.0)
}

fn is_arithmetically_consistent(record: &InvoiceRecord) -> bool {
    let expected = record.subtotal + record.tax;
    if record.total == 0.0 {
        return expected == 0.0;
    }
    (expected - record.total).abs() <= ARITHMETIC_EPSILON * record.total.abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::invoice::LineItem;

    fn record() -> InvoiceRecord {
        InvoiceRecord {
            invoice_number: "INV-001".to_string(),
            invoice_date: "2024-03-01".to_string(),
            vendor_name: "Acme".to_string(),
            currency: "EUR".to_string(),
            subtotal: 100.0,
            tax: 19.0,
            total: 119.0,
            due_date: Some("2024-03-31".to_string()),
            line_items: vec![LineItem::default()],
            notes: None,
        }
    }

    #[test]
    fn perfect_record_scores_one() {
        assert_eq!(score(&record(), Some(1.0)), 1.0);
    }

    #[test]
    fn absent_ocr_quality_defaults_to_full_signal() {
        assert_eq!(score(&record(), None), score(&record(), Some(1.0)));
    }

    #[test]
    fn inconsistent_totals_drop_the_arithmetic_signal() {
        let mut r = record();
        r.total = 140.0;
        let s = score(&r, Some(1.0));
        assert!(s < 0.81, "got {s}");
        assert!(s > 0.7, "got {s}");
    }

    #[test]
    fn rounding_noise_within_epsilon_is_consistent() {
        let mut r = record();
        r.total = 119.5; // within 1% of 119
        assert!(is_arithmetically_consistent(&r));
    }

    #[test]
    fn score_is_clamped() {
        let r = InvoiceRecord::default();
        let s = score(&r, Some(0.0));
        assert!((0.0..=1.0).contains(&s));
    }
}
