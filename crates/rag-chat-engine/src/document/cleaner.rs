use once_cell::sync::Lazy;
use regex::Regex;

static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static SPACE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r" {3,}").unwrap());
static CONTROL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").unwrap());

/// Whitespace and control-character normalization applied to every
/// loaded document before chunking. Idempotent.
pub struct TextCleaner;

impl TextCleaner {
    pub fn clean(text: &str) -> String {
        let text = text.replace("\r\n", "\n");
        let text = text.replace('\t', " ");
        let text = BLANK_LINES.replace_all(&text, "\n\n");
        let text = SPACE_RUNS.replace_all(&text, " ");
        let text = CONTROL_CHARS.replace_all(&text, "");
        text.trim().to_string()
    }
}
