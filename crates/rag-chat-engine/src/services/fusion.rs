use std::collections::HashMap;

use uuid::Uuid;

use crate::providers::SearchHit;

#[derive(Debug, Clone)]
pub struct FusedHit {
    pub chunk_id: Uuid,
    pub text: String,
    pub score: f32,
    pub metadata: serde_json::Value,
    pub rrf_score: f64,
}

/// Reciprocal Rank Fusion over any number of ranked lists. An id
/// appearing in several lists accumulates 1 / (k + rank + 1) from each;
/// ties break by first appearance across the inputs.
pub fn reciprocal_rank_fusion(result_lists: Vec<Vec<SearchHit>>, k: usize) -> Vec<FusedHit> {
    let mut scores: HashMap<Uuid, f64> = HashMap::new();
    let mut items: HashMap<Uuid, SearchHit> = HashMap::new();
    let mut first_seen: Vec<Uuid> = Vec::new();

    for list in result_lists {
        for (rank, item) in list.into_iter().enumerate() {
            let entry = scores.entry(item.chunk_id).or_insert_with(|| {
                first_seen.push(item.chunk_id);
                0.0
            });
            *entry += 1.0 / (k as f64 + rank as f64 + 1.0);
            items.insert(item.chunk_id, item);
        }
    }

    let mut ordered = first_seen;
    // Stable sort keeps first-appearance order for equal scores.
    ordered.sort_by(|a, b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    ordered
        .into_iter()
        .map(|id| {
            let item = items.remove(&id).expect("id seen in at least one list");
            FusedHit {
                chunk_id: id,
                text: item.text,
                score: item.score,
                metadata: item.metadata,
                rrf_score: scores[&id],
            }
        })
        .collect()
}
