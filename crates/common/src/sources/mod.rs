//! Citation source resolution

use crate::types::{RetrievedChunk, Source};
use std::collections::HashMap;

/// Deduplicate chunks by exact URL and rank the survivors
///
/// The highest-scoring chunk wins for each URL. Output is sorted by
/// descending relevance; ties keep the order in which URLs were first seen.
pub fn resolve(chunks: &[RetrievedChunk]) -> Vec<Source> {
    let mut sources: Vec<Source> = Vec::with_capacity(chunks.len());
    let mut positions: HashMap<&str, usize> = HashMap::with_capacity(chunks.len());

    for chunk in chunks {
        match positions.get(chunk.source_url.as_str()) {
            Some(&pos) => {
                let existing = &mut sources[pos];
                if chunk.relevance_score > existing.relevance_score {
                    existing.relevance_score = chunk.relevance_score;
                    existing.title = title_of(chunk);
                }
            }
            None => {
                positions.insert(chunk.source_url.as_str(), sources.len());
                sources.push(Source {
                    url: chunk.source_url.clone(),
                    title: title_of(chunk),
                    relevance_score: chunk.relevance_score,
                });
            }
        }
    }

    // sort_by is stable, which preserves first-seen order on ties
    sources.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
    sources
}

fn title_of(chunk: &RetrievedChunk) -> Option<String> {
    Some(chunk.title.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}
