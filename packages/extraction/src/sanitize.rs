//! OCR text sanitizer.
//!
//! Pure text cleanup between OCR and the LLM call: whitespace
//! normalization, optional per-page zone stripping, noise-line removal and
//! whole-line truncation. No I/O.

use std::sync::OnceLock;

use regex::Regex;

/// Sanitizer settings.
#[derive(Debug, Clone)]
pub struct SanitizeConfig {
    /// Upper bound on output length; truncation never splits a line.
    pub max_chars: usize,
    /// Lines dropped from the top of every page.
    pub strip_top: usize,
    /// Lines dropped from the bottom of every page.
    pub strip_bottom: usize,
}

impl Default for SanitizeConfig {
    fn default() -> Self {
        Self {
            max_chars: 20_000,
            strip_top: 0,
            strip_bottom: 0,
        }
    }
}

/// Lines that are page furniture rather than content.
fn noise_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // "Page 3", "page 3 of 12", "Seite 4", "3 / 12"
            r"(?i)^\s*(page|seite|pagina|página)\s*\d+(\s*(of|/|von)\s*\d+)?\s*$",
            r"^\s*\d+\s*/\s*\d+\s*$",
            // bare page number, possibly dash-framed: "- 3 -"
            r"^\s*-?\s*\d{1,4}\s*-?\s*$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect()
    })
}

fn is_noise(line: &str) -> bool {
    noise_patterns().iter().any(|re| re.is_match(line))
}

/// Sanitize raw OCR text for LLM consumption.
///
/// `page_count` drives the per-page zone strip when the text carries no
/// form-feed page separators; with separators present they win.
pub fn sanitize(raw: &str, page_count: u32, config: &SanitizeConfig) -> String {
    let pages = split_pages(raw, page_count);

    let mut lines: Vec<String> = Vec::new();
    for page in pages {
        let page_lines: Vec<String> = page
            .lines()
            .map(|l| normalize_whitespace(l))
            .collect();

        let top = config.strip_top.min(page_lines.len());
        let bottom = config
            .strip_bottom
            .min(page_lines.len().saturating_sub(top));
        let kept = &page_lines[top..page_lines.len() - bottom];

        for line in kept {
            if line.is_empty() || is_noise(line) {
                continue;
            }
            lines.push(line.clone());
        }
    }

    truncate_whole_lines(&lines, config.max_chars)
}

/// Collapse runs of spaces and tabs; line breaks are preserved by the
/// caller splitting on them first.
fn normalize_whitespace(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split into pages on form feed; without separators, divide lines evenly
/// across the known page count so zone stripping still applies per page.
fn split_pages(raw: &str, page_count: u32) -> Vec<String> {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");

    if normalized.contains('\u{c}') {
        return normalized.split('\u{c}').map(str::to_string).collect();
    }

    let pages = page_count.max(1) as usize;
    if pages == 1 {
        return vec![normalized];
    }

    let lines: Vec<&str> = normalized.lines().collect();
    let per_page = lines.len().div_ceil(pages);
    if per_page == 0 {
        return vec![normalized];
    }

    lines
        .chunks(per_page)
        .map(|chunk| chunk.join("\n"))
        .collect()
}

fn truncate_whole_lines(lines: &[String], max_chars: usize) -> String {
    let mut out = String::new();
    for line in lines {
        // +1 for the joining newline
        let added = line.len() + usize::from(!out.is_empty());
        if out.len() + added > max_chars {
            break;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_inline_whitespace_but_keeps_line_breaks() {
        let out = sanitize("Total:\t  119,00  EUR\nDue   soon", 1, &SanitizeConfig::default());
        assert_eq!(out, "Total: 119,00 EUR\nDue soon");
    }

    #[test]
    fn drops_page_number_noise() {
        let raw = "Invoice INV-1\nPage 1 of 2\n- 2 -\nAmount 10";
        let out = sanitize(raw, 1, &SanitizeConfig::default());
        assert_eq!(out, "Invoice INV-1\nAmount 10");
    }

    #[test]
    fn strips_configured_zones_per_page() {
        let config = SanitizeConfig {
            strip_top: 1,
            strip_bottom: 1,
            ..SanitizeConfig::default()
        };
        let raw = "header\u{c}body\nfooter";
        // First page is only a header line, second page loses its footer.
        let out = sanitize(raw, 2, &config);
        assert_eq!(out, "");

        let raw = "header\nkeep me\nfooter\u{c}header\nalso keep\nfooter";
        let out = sanitize(raw, 2, &config);
        assert_eq!(out, "keep me\nalso keep");
    }

    #[test]
    fn splits_pages_evenly_without_form_feeds() {
        let config = SanitizeConfig {
            strip_top: 1,
            ..SanitizeConfig::default()
        };
        let raw = "h1\na\nh2\nb";
        let out = sanitize(raw, 2, &config);
        assert_eq!(out, "a\nb");
    }

    #[test]
    fn truncates_on_line_boundaries() {
        let config = SanitizeConfig {
            max_chars: 11,
            ..SanitizeConfig::default()
        };
        let out = sanitize("first\nsecond\nthird", 1, &config);
        // "first\nsecond" would be 12 chars; only the first line fits.
        assert_eq!(out, "first");
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(sanitize("", 1, &SanitizeConfig::default()), "");
    }
}
