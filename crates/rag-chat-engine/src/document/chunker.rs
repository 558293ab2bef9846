use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub struct Chunk {
    pub text: String,
    pub index: usize,
    pub metadata: Value,
}

/// Fixed-size chunker with overlap. Windows snap to paragraph breaks,
/// then sentence terminators, before falling back to a hard cut. All
/// offsets are character offsets into the cleaned text.
pub struct TextChunker {
    chunk_size: usize,
    overlap: usize,
}

const SENTENCE_BREAKS: [&str; 4] = [". ", ".\n", "! ", "? "];

impl TextChunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size,
            overlap,
        }
    }

    pub fn chunk(&self, text: &str, metadata: &Value) -> Vec<Chunk> {
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();

        let mut chunks = Vec::new();
        let mut start = 0usize;
        let mut idx = 0usize;

        while start < len {
            let mut end = (start + self.chunk_size).min(len);

            if start + self.chunk_size < len {
                let lo = start + self.chunk_size / 2;

                // Paragraph break first, then sentence terminators.
                let para_hi = (start + self.chunk_size + 100).min(len);
                if let Some(pos) = rfind(&chars, "\n\n", lo, para_hi) {
                    end = pos;
                } else {
                    let sent_hi = (start + self.chunk_size + 50).min(len);
                    for sep in SENTENCE_BREAKS {
                        if let Some(pos) = rfind(&chars, sep, lo, sent_hi) {
                            end = pos + sep.chars().count();
                            break;
                        }
                    }
                }
            }

            let window: String = chars[start..end].iter().collect();
            let trimmed = window.trim();
            if !trimmed.is_empty() {
                let mut chunk_meta = metadata.clone();
                if let Some(obj) = chunk_meta.as_object_mut() {
                    obj.insert("char_start".into(), json!(start));
                    obj.insert("char_end".into(), json!(end));
                }
                chunks.push(Chunk {
                    text: trimmed.to_string(),
                    index: idx,
                    metadata: chunk_meta,
                });
                idx += 1;
            }

            let next = end.saturating_sub(self.overlap);
            // Guard against a non-advancing window when the snapped stride
            // is shorter than the overlap.
            start = if next > start { next } else { end };
        }

        chunks
    }
}

/// Highest position `p >= lo` with `p + pattern_len <= hi` where the
/// pattern occurs in the char slice.
fn rfind(chars: &[char], pattern: &str, lo: usize, hi: usize) -> Option<usize> {
    let pat: Vec<char> = pattern.chars().collect();
    if pat.is_empty() || hi > chars.len() || lo + pat.len() > hi {
        return None;
    }

    let mut p = hi - pat.len();
    loop {
        if chars[p..p + pat.len()] == pat[..] {
            return Some(p);
        }
        if p == lo {
            return None;
        }
        p -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> Value {
        json!({})
    }

    #[test]
    fn short_text_single_chunk() {
        let chunker = TextChunker::new(500, 50);
        let chunks = chunker.chunk("Hello world", &meta());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello world");
        assert_eq!(chunks[0].index, 0);
    }

    #[test]
    fn long_text_produces_multiple_chunks() {
        let chunker = TextChunker::new(100, 20);
        let text = "A ".repeat(200);
        let chunks = chunker.chunk(&text, &meta());
        assert!(chunks.len() > 1);
    }

    #[test]
    fn chunks_have_sequential_indices() {
        let chunker = TextChunker::new(50, 10);
        let text = "word ".repeat(100);
        let chunks = chunker.chunk(&text, &meta());
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }

    #[test]
    fn metadata_propagated_with_offsets() {
        let chunker = TextChunker::new(500, 50);
        let chunks = chunker.chunk("Hello", &json!({"source": "test"}));
        assert_eq!(chunks[0].metadata["source"], "test");
        assert_eq!(chunks[0].metadata["char_start"], 0);
        assert_eq!(chunks[0].metadata["char_end"], 5);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        let chunker = TextChunker::new(100, 10);
        assert!(chunker.chunk("", &meta()).is_empty());
    }

    #[test]
    fn snaps_to_paragraph_break() {
        // Paragraph break inside [size/2, size + 100] wins over hard cut.
        let first = "x".repeat(80);
        let second = "y".repeat(200);
        let text = format!("{first}\n\n{second}");
        let chunker = TextChunker::new(100, 10);
        let chunks = chunker.chunk(&text, &meta());
        assert_eq!(chunks[0].text, first);
        assert_eq!(chunks[0].metadata["char_end"], 80);
    }

    #[test]
    fn snaps_to_sentence_break() {
        let text = format!("{}. {}", "a".repeat(70), "b".repeat(200));
        let chunker = TextChunker::new(100, 10);
        let chunks = chunker.chunk(&text, &meta());
        assert_eq!(chunks[0].text, format!("{}.", "a".repeat(70)));
    }

    #[test]
    fn ranges_form_a_covering_partition() {
        let text = "alpha beta gamma delta ".repeat(60);
        let chunker = TextChunker::new(120, 30);
        let chunks = chunker.chunk(&text, &meta());
        assert!(!chunks.is_empty());

        let starts: Vec<usize> = chunks
            .iter()
            .map(|c| c.metadata["char_start"].as_u64().unwrap() as usize)
            .collect();
        let ends: Vec<usize> = chunks
            .iter()
            .map(|c| c.metadata["char_end"].as_u64().unwrap() as usize)
            .collect();

        assert_eq!(starts[0], 0);
        assert_eq!(*ends.last().unwrap(), text.chars().count());
        for i in 1..chunks.len() {
            assert!(starts[i] <= ends[i - 1], "gap between chunks {} and {}", i - 1, i);
        }
    }

    #[test]
    fn multibyte_text_is_not_split_mid_character() {
        let text = "héllo wörld détente ".repeat(30);
        let chunker = TextChunker::new(64, 16);
        let chunks = chunker.chunk(&text, &meta());
        assert!(chunks.len() > 1);
        // Reassembly through char offsets must round-trip.
        let chars: Vec<char> = text.chars().collect();
        for chunk in &chunks {
            let s = chunk.metadata["char_start"].as_u64().unwrap() as usize;
            let e = chunk.metadata["char_end"].as_u64().unwrap() as usize;
            let window: String = chars[s..e].iter().collect();
            assert_eq!(window.trim(), chunk.text);
        }
    }

    #[test]
    fn terminates_when_overlap_exceeds_snapped_stride() {
        let text = format!("{}\n\n{}", "a".repeat(60), "b".repeat(500));
        let chunker = TextChunker::new(100, 90);
        let chunks = chunker.chunk(&text, &meta());
        assert!(!chunks.is_empty());
    }
}
