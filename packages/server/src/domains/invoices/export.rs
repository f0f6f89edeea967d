//! CSV export of completed jobs: one row per line item, invoice header
//! fields repeated on every row of the same invoice.

use anyhow::Result;

use super::job::Job;

pub const CSV_CONTENT_TYPE: &str = "text/csv; charset=utf-8";

const COLUMNS: [&str; 15] = [
    "invoiceNumber",
    "invoiceDate",
    "vendorName",
    "currency",
    "subtotal",
    "tax",
    "total",
    "dueDate",
    "lineItemIndex",
    "description",
    "quantity",
    "unitPrice",
    "lineTotal",
    "confidenceScore",
    "filename",
];

/// The header line, terminated.
pub fn csv_header() -> String {
    let mut line = COLUMNS.join(",");
    line.push('\n');
    line
}

fn fmt_number(value: f64) -> String {
    // Dot-decimal, no scientific notation for the magnitudes invoices see.
    if value == value.trunc() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// All CSV rows for one completed job, terminated. Jobs without a result
/// produce no rows; a result without line items produces one row with the
/// line-item columns empty so the invoice still appears in the export.
pub fn job_rows(job: &Job) -> Result<String> {
    let Some(record) = &job.result_json else {
        return Ok(String::new());
    };

    let confidence = job
        .confidence_score
        .map(fmt_number)
        .unwrap_or_default();

    let header_fields = [
        record.invoice_number.clone(),
        record.invoice_date.clone(),
        record.vendor_name.clone(),
        record.currency.clone(),
        fmt_number(record.subtotal),
        fmt_number(record.tax),
        fmt_number(record.total),
        record.due_date.clone().unwrap_or_default(),
    ];

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    if record.line_items.is_empty() {
        let mut row: Vec<String> = header_fields.to_vec();
        row.extend((0..5).map(|_| String::new()));
        row.push(confidence.clone());
        row.push(job.filename.clone());
        writer.write_record(&row)?;
    } else {
        for (index, item) in record.line_items.iter().enumerate() {
            let mut row: Vec<String> = header_fields.to_vec();
            row.push((index + 1).to_string());
            row.push(item.description.clone());
            row.push(fmt_number(item.quantity));
            row.push(fmt_number(item.unit_price));
            row.push(fmt_number(item.line_total));
            row.push(confidence.clone());
            row.push(job.filename.clone());
            writer.write_record(&row)?;
        }
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("csv flush failed: {e}"))?;
    Ok(String::from_utf8(bytes)?)
}

/// Whole-document export, used by tests; the route streams header and
/// per-job chunks instead.
pub fn session_csv(jobs: &[Job]) -> Result<String> {
    let mut out = csv_header();
    for job in jobs {
        out.push_str(&job_rows(job)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::invoices::job::JobStatus;
    use chrono::{TimeZone, Utc};
    use extraction::{InvoiceRecord, LineItem};
    use uuid::Uuid;

    fn done_job(record: InvoiceRecord) -> Job {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut job = Job::builder()
            .id(Uuid::new_v4())
            .session_id(Uuid::new_v4())
            .filename("A.pdf")
            .size_bytes(100u64)
            .page_count(2u32)
            .blob_path("uploads/s/j.pdf")
            .created_at(now)
            .updated_at(now)
            .build();
        job.status = JobStatus::Done;
        job.result_json = Some(record);
        job.confidence_score = Some(0.9);
        job
    }

    fn record() -> InvoiceRecord {
        InvoiceRecord {
            invoice_number: "INV-001".to_string(),
            invoice_date: "2024-03-01".to_string(),
            vendor_name: "Acme GmbH".to_string(),
            currency: "EUR".to_string(),
            subtotal: 100.0,
            tax: 19.0,
            total: 119.0,
            due_date: Some("2024-03-31".to_string()),
            line_items: vec![
                LineItem {
                    description: "Widgets".to_string(),
                    quantity: 4.0,
                    unit_price: 25.0,
                    line_total: 100.0,
                },
                LineItem {
                    description: "Shipping".to_string(),
                    quantity: 1.0,
                    unit_price: 0.0,
                    line_total: 0.0,
                },
            ],
            notes: None,
        }
    }

    #[test]
    fn header_matches_the_column_contract() {
        assert!(csv_header().starts_with("invoiceNumber,invoiceDate,vendorName,currency"));
        assert!(csv_header().trim_end().ends_with("confidenceScore,filename"));
    }

    #[test]
    fn one_row_per_line_item_with_repeated_header_fields() {
        let csv = session_csv(&[done_job(record())]).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);

        assert!(lines[1].starts_with("INV-001,2024-03-01,Acme GmbH,EUR,100,19,119,2024-03-31,1,Widgets,4,25,100,0.9,A.pdf"));
        assert!(lines[2].starts_with("INV-001,2024-03-01,Acme GmbH,EUR,100,19,119,2024-03-31,2,Shipping,"));
        assert!(lines[2].ends_with("A.pdf"));
    }

    #[test]
    fn no_line_items_still_exports_one_row() {
        let mut r = record();
        r.line_items.clear();
        let csv = session_csv(&[done_job(r)]).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains(",,,,,"));
        assert!(lines[1].ends_with("0.9,A.pdf"));
    }

    #[test]
    fn fields_with_commas_are_quoted() {
        let mut r = record();
        r.vendor_name = "Acme, Inc.".to_string();
        let csv = session_csv(&[done_job(r)]).unwrap();
        assert!(csv.contains("\"Acme, Inc.\""));
    }
}
