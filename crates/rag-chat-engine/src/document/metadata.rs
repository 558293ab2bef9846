use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::path::Path;
use unicode_segmentation::UnicodeSegmentation;

use crate::database::SourceType;

static H1: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#\s+(.+)$").unwrap());
static HEADINGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+.+$").unwrap());

/// Lightweight structural metadata attached to every chunk of a document.
pub struct MetadataExtractor;

impl MetadataExtractor {
    pub fn extract(text: &str, source_uri: &str, source_type: SourceType) -> Value {
        let mut metadata = json!({
            "source_type": source_type.as_str(),
            "source_uri": source_uri,
            "char_count": text.chars().count(),
            "word_count": text.unicode_words().count(),
            "heading_count": HEADINGS.find_iter(text).count(),
        });

        if let Some(obj) = metadata.as_object_mut() {
            match source_type {
                SourceType::Markdown => {
                    if let Some(caps) = H1.captures(text) {
                        obj.insert("title".into(), json!(caps[1].trim()));
                    }
                }
                SourceType::Pdf => {
                    let path = Path::new(source_uri);
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        obj.insert("title".into(), json!(prettify_stem(stem)));
                    }
                    if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
                        obj.insert("filename".into(), json!(name));
                    }
                }
                SourceType::Web => {}
            }
        }

        metadata
    }
}

/// "dryer-manual_v2" -> "Dryer Manual V2"
fn prettify_stem(stem: &str) -> String {
    stem.replace(['-', '_'], " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
