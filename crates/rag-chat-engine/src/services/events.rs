use std::pin::Pin;

use futures::{Stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use crate::providers::Usage;

static SENTENCE_ENDINGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]\s+").unwrap());

/// Maximum source snippet length carried on the wire.
pub const SOURCE_TEXT_LIMIT: usize = 300;

#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub title: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub score: f32,
}

impl SourceRef {
    /// Wire form: text clipped to the snippet limit.
    pub fn truncated(&self) -> SourceRef {
        SourceRef {
            title: self.title.clone(),
            text: self.text.chars().take(SOURCE_TEXT_LIMIT).collect(),
            url: self.url.clone(),
            score: self.score,
        }
    }
}

/// Typed event stream of one query run. Ordering is strict: `metadata`
/// first, `sources` before `done`, `done` last on success; at most one
/// `error` may replace the tail.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ChatEvent {
    Metadata {
        session_id: Uuid,
        confidence_tier: String,
        message_id: Uuid,
    },
    Delta {
        content: String,
    },
    Sources(Vec<SourceRef>),
    Sentence {
        text: String,
    },
    Done {
        usage: Usage,
    },
    Error {
        detail: String,
    },
}

pub type ChatEventStream = Pin<Box<dyn Stream<Item = ChatEvent> + Send>>;

/// Sentence-buffered variant layered over a delta stream: tokens are
/// accumulated and flushed as whole sentences. A token straddling a
/// terminator flushes on the token boundary, not the character boundary.
pub fn sentence_stream<S>(inner: S) -> impl Stream<Item = ChatEvent>
where
    S: Stream<Item = ChatEvent>,
{
    async_stream::stream! {
        let mut buffer = String::new();
        futures::pin_mut!(inner);

        while let Some(event) = inner.next().await {
            match event {
                ChatEvent::Delta { content } => {
                    buffer.push_str(&content);
                    while let Some(found) = SENTENCE_ENDINGS.find(&buffer) {
                        let end = found.end();
                        let sentence = buffer[..end].trim().to_string();
                        buffer = buffer[end..].to_string();
                        if !sentence.is_empty() {
                            yield ChatEvent::Sentence { text: sentence };
                        }
                    }
                }
                event @ (ChatEvent::Sources(_)
                | ChatEvent::Done { .. }
                | ChatEvent::Error { .. }) => {
                    let residue = buffer.trim().to_string();
                    if !residue.is_empty() {
                        yield ChatEvent::Sentence { text: residue };
                    }
                    buffer.clear();
                    yield event;
                }
                passthrough => yield passthrough,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn delta(content: &str) -> ChatEvent {
        ChatEvent::Delta {
            content: content.to_string(),
        }
    }

    async fn run(events: Vec<ChatEvent>) -> Vec<ChatEvent> {
        sentence_stream(stream::iter(events)).collect().await
    }

    fn sentences(events: &[ChatEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Sentence { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn buffers_deltas_into_sentences() {
        let out = run(vec![
            delta("Hello wor"),
            delta("ld. Next"),
            delta(" part! tail"),
            ChatEvent::Done {
                usage: Usage::default(),
            },
        ])
        .await;

        assert_eq!(
            sentences(&out),
            vec!["Hello world.", "Next part!", "tail"]
        );
        assert!(matches!(out.last(), Some(ChatEvent::Done { .. })));
    }

    #[tokio::test]
    async fn flushes_residue_before_sources() {
        let out = run(vec![
            delta("No terminator here"),
            ChatEvent::Sources(Vec::new()),
            ChatEvent::Done {
                usage: Usage::default(),
            },
        ])
        .await;

        assert_eq!(sentences(&out), vec!["No terminator here"]);
        // Residue precedes the sources event.
        assert!(matches!(out[0], ChatEvent::Sentence { .. }));
        assert!(matches!(out[1], ChatEvent::Sources(_)));
    }

    #[tokio::test]
    async fn metadata_passes_through_unchanged() {
        let out = run(vec![
            ChatEvent::Metadata {
                session_id: Uuid::new_v4(),
                confidence_tier: "ANSWER".into(),
                message_id: Uuid::new_v4(),
            },
            delta("One. "),
            ChatEvent::Done {
                usage: Usage::default(),
            },
        ])
        .await;

        assert!(matches!(out[0], ChatEvent::Metadata { .. }));
        assert_eq!(sentences(&out), vec!["One."]);
    }

    #[tokio::test]
    async fn flushes_residue_before_error() {
        let out = run(vec![
            delta("partial answer"),
            ChatEvent::Error {
                detail: "boom".into(),
            },
        ])
        .await;

        assert_eq!(sentences(&out), vec!["partial answer"]);
        assert!(matches!(out.last(), Some(ChatEvent::Error { .. })));
    }

    #[test]
    fn event_wire_format() {
        let event = ChatEvent::Delta {
            content: "hi".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "delta");
        assert_eq!(json["data"]["content"], "hi");

        let sources = ChatEvent::Sources(vec![SourceRef {
            title: "Manual".into(),
            text: "t".into(),
            url: None,
            score: 0.9,
        }]);
        let json = serde_json::to_value(&sources).unwrap();
        assert_eq!(json["event"], "sources");
        assert!(json["data"].is_array());
        assert!(json["data"][0].get("url").is_none());
    }

    #[test]
    fn source_truncation_clips_text() {
        let source = SourceRef {
            title: "Manual".into(),
            text: "x".repeat(500),
            url: Some("http://docs".into()),
            score: 0.8,
        };
        assert_eq!(source.truncated().text.chars().count(), SOURCE_TEXT_LIMIT);
    }
}
