use std::path::Path;
use std::time::Duration;

use pulldown_cmark::{Event, HeadingLevel, Parser, Tag, TagEnd};
use scraper::{ElementRef, Html, Selector};
use serde_json::json;
use tracing::debug;

use crate::config::IngestionConfig;
use crate::database::SourceType;
use crate::document::safety::{validate_file_path, validate_url};
use crate::utils::error::EngineError;

const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub text: String,
    pub metadata: serde_json::Value,
    pub source_uri: String,
}

/// One loader per source type, resolved at ingestion time. Closed set:
/// no runtime registration.
pub enum SourceLoader {
    Markdown(MarkdownLoader),
    Pdf(PdfLoader),
    Web(WebLoader),
}

impl SourceLoader {
    pub fn for_source_type(source_type: SourceType, config: &IngestionConfig) -> Self {
        match source_type {
            SourceType::Markdown => SourceLoader::Markdown(MarkdownLoader {
                allowed_base_dir: config.allowed_base_dir.clone(),
            }),
            SourceType::Pdf => SourceLoader::Pdf(PdfLoader {
                allowed_base_dir: config.allowed_base_dir.clone(),
            }),
            SourceType::Web => SourceLoader::Web(WebLoader::new()),
        }
    }

    pub async fn load(&self, source_uri: &str) -> Result<Vec<LoadedDocument>, EngineError> {
        match self {
            SourceLoader::Markdown(loader) => loader.load(source_uri).await,
            SourceLoader::Pdf(loader) => loader.load(source_uri).await,
            SourceLoader::Web(loader) => loader.load(source_uri).await,
        }
    }
}

pub struct MarkdownLoader {
    allowed_base_dir: String,
}

impl MarkdownLoader {
    pub async fn load(&self, source_uri: &str) -> Result<Vec<LoadedDocument>, EngineError> {
        let path = validate_file_path(source_uri, &self.allowed_base_dir)?;
        let text = tokio::fs::read_to_string(&path).await?;

        let title = first_h1(&text).unwrap_or_else(|| file_stem(&path));
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        Ok(vec![LoadedDocument {
            text,
            metadata: json!({
                "title": title,
                "source_type": "markdown",
                "filename": filename,
            }),
            source_uri: source_uri.to_string(),
        }])
    }
}

/// First level-1 heading, read off the CommonMark event stream.
fn first_h1(text: &str) -> Option<String> {
    let mut in_h1 = false;
    let mut title = String::new();

    for event in Parser::new(text) {
        match event {
            Event::Start(Tag::Heading {
                level: HeadingLevel::H1,
                ..
            }) => in_h1 = true,
            Event::End(TagEnd::Heading(HeadingLevel::H1)) => {
                let trimmed = title.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
                in_h1 = false;
                title.clear();
            }
            Event::Text(t) | Event::Code(t) if in_h1 => title.push_str(&t),
            _ => {}
        }
    }

    None
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document")
        .to_string()
}

pub struct PdfLoader {
    allowed_base_dir: String,
}

impl PdfLoader {
    pub async fn load(&self, source_uri: &str) -> Result<Vec<LoadedDocument>, EngineError> {
        let path = validate_file_path(source_uri, &self.allowed_base_dir)?;
        let title = file_stem(&path);
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        // lopdf parsing is CPU-bound; keep it off the async executor.
        let (text, page_count) = tokio::task::spawn_blocking(move || extract_pdf_text(&path))
            .await
            .map_err(|e| EngineError::Ingestion(format!("pdf task panicked: {e}")))??;

        Ok(vec![LoadedDocument {
            text,
            metadata: json!({
                "title": title,
                "source_type": "pdf",
                "filename": filename,
                "page_count": page_count,
            }),
            source_uri: source_uri.to_string(),
        }])
    }
}

fn extract_pdf_text(path: &Path) -> Result<(String, usize), EngineError> {
    let doc = lopdf::Document::load(path)
        .map_err(|e| EngineError::Ingestion(format!("failed to parse PDF: {e}")))?;

    let pages = doc.get_pages();
    let page_count = pages.len();

    let mut blocks = Vec::new();
    for page_num in pages.keys() {
        if let Ok(text) = doc.extract_text(&[*page_num]) {
            let trimmed = text.trim().to_string();
            if !trimmed.is_empty() {
                blocks.push(trimmed);
            }
        }
    }

    Ok((blocks.join("\n\n"), page_count.max(1)))
}

pub struct WebLoader {
    client: reqwest::Client,
}

impl WebLoader {
    pub fn new() -> Self {
        Self {
            // Redirects are followed manually so each hop can be
            // revalidated against the SSRF denylist.
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    pub async fn load(&self, source_uri: &str) -> Result<Vec<LoadedDocument>, EngineError> {
        let mut url = validate_url(source_uri).await?;

        let mut body = None;
        for hop in 0..MAX_REDIRECTS {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| EngineError::provider("web", e))?;

            if response.status().is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        EngineError::provider("web", "redirect without Location header")
                    })?;

                let next = url
                    .join(location)
                    .map_err(|e| EngineError::provider("web", e))?;
                debug!(hop, from = %url, to = %next, "following_redirect");
                url = validate_url(next.as_str()).await?;
                continue;
            }

            let response = response
                .error_for_status()
                .map_err(|e| EngineError::provider("web", e))?;
            body = Some(
                response
                    .text()
                    .await
                    .map_err(|e| EngineError::provider("web", e))?,
            );
            break;
        }

        let body = body.ok_or_else(|| {
            EngineError::SsrfViolation(format!(
                "too many redirects (>{MAX_REDIRECTS}) for {source_uri}"
            ))
        })?;

        let (title, text) = parse_html(&body, source_uri);

        Ok(vec![LoadedDocument {
            text,
            metadata: json!({
                "title": title,
                "source_type": "web",
                "url": source_uri,
            }),
            source_uri: source_uri.to_string(),
        }])
    }
}

impl Default for WebLoader {
    fn default() -> Self {
        Self::new()
    }
}

const SKIPPED_TAGS: [&str; 5] = ["script", "style", "nav", "footer", "header"];

fn parse_html(body: &str, source_uri: &str) -> (String, String) {
    let html = Html::parse_document(body);

    let title_selector = Selector::parse("title").expect("static selector");
    let title = html
        .select(&title_selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| source_uri.to_string());

    let mut text = String::new();
    collect_text(html.root_element(), &mut text);

    (title, text.trim().to_string())
}

fn collect_text(element: ElementRef, out: &mut String) {
    if SKIPPED_TAGS.contains(&element.value().name()) {
        return;
    }

    for node in element.children() {
        if let Some(text) = node.value().as_text() {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                out.push_str(trimmed);
                out.push('\n');
            }
        } else if let Some(child) = ElementRef::wrap(node) {
            collect_text(child, out);
        }
    }
}
