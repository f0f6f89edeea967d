//! LLM prompts for invoice extraction.
//!
//! Prompts are versioned; the active version is pinned in configuration so
//! stored results stay comparable across deployments.

/// Current prompt version shipped with this crate.
pub const PROMPT_VERSION: &str = "v2";

/// System prompt for the extraction call.
pub const EXTRACT_SYSTEM_PROMPT: &str = "You are an invoice data extraction engine. \
You receive OCR text of one invoice and reply with a single JSON object, no prose, \
no markdown fences.";

/// Prompt for extracting a structured invoice record from OCR text.
const EXTRACT_PROMPT: &str = r#"Extract the invoice fields from the document text below.

Output JSON:
{
    "invoiceNumber": "invoice identifier as printed",
    "invoiceDate": "yyyy-mm-dd",
    "vendorName": "issuing company name",
    "currency": "ISO 4217 code, EUR if unstated",
    "subtotal": 0.0,
    "tax": 0.0,
    "total": 0.0,
    "dueDate": "yyyy-mm-dd or omit if unstated",
    "lineItems": [
        {"description": "...", "quantity": 0.0, "unitPrice": 0.0, "lineTotal": 0.0}
    ],
    "notes": "payment terms or remarks, omit if none"
}

Use null or omit fields you cannot find. Never invent values.

Document text:
{content}"#;

/// Render the extraction prompt for a document.
///
/// Unknown versions fall back to the current template; the version string
/// still reaches the provider for traceability.
pub fn extract_prompt(text: &str, prompt_version: &str) -> String {
    let body = EXTRACT_PROMPT.replace("{content}", text);
    format!("[prompt {prompt_version}]\n{body}")
}
