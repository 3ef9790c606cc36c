//! Local fuzzy search over a fully materialized item list.
//!
//! This is a fallback for small, completely loaded lists. It never merges
//! with the server-side paginated query: callers either page through the
//! remote source or search a list they already hold in full.

use crate::item::Item;
use std::sync::Arc;

/// Searchable item fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchField {
    Title,
    Prompt,
    Keywords,
}

/// Field weights and match tightness.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub weights: Vec<(SearchField, f64)>,
    /// Largest accepted distance in `0.0..=1.0`; `0.0` demands exact matches.
    pub threshold: f64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            weights: vec![
                (SearchField::Title, 0.5),
                (SearchField::Prompt, 0.3),
                (SearchField::Keywords, 0.2),
            ],
            threshold: 0.4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Position of the item in the indexed list.
    pub index: usize,
    /// Weighted relevance, higher is better.
    pub score: f64,
}

/// Ranked fuzzy matching over a local list.
pub trait LocalSearch {
    fn search(&self, query: &str) -> Vec<SearchHit>;
}

/// Fuzzy index bound to one list instance.
#[derive(Debug, Clone)]
pub struct FuzzyIndex {
    items: Arc<[Item]>,
    options: SearchOptions,
    documents: Vec<Vec<(SearchField, String)>>,
}

impl FuzzyIndex {
    pub fn build(items: Arc<[Item]>, options: SearchOptions) -> Self {
        let documents = items.iter().map(|item| document(item, &options)).collect();
        Self {
            items,
            options,
            documents,
        }
    }

    /// Whether this index was built from exactly this list instance.
    pub fn is_built_from(&self, items: &Arc<[Item]>) -> bool {
        Arc::ptr_eq(&self.items, items)
    }

    /// Rebuild when the underlying list reference changed.
    pub fn refresh(self, items: &Arc<[Item]>) -> Self {
        if self.is_built_from(items) {
            self
        } else {
            Self::build(Arc::clone(items), self.options)
        }
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    fn weight(&self, field: SearchField) -> f64 {
        self.options
            .weights
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, w)| *w)
            .unwrap_or(0.0)
    }
}

impl LocalSearch for FuzzyIndex {
    fn search(&self, query: &str) -> Vec<SearchHit> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Vec::new();
        }
        let min_similarity = 1.0 - self.options.threshold.clamp(0.0, 1.0);

        let mut hits: Vec<SearchHit> = self
            .documents
            .iter()
            .enumerate()
            .filter_map(|(index, fields)| {
                let mut best = 0.0f64;
                let mut score = 0.0f64;
                for (field, text) in fields {
                    let sim = similarity(&query, text);
                    best = best.max(sim);
                    score += sim * self.weight(*field);
                }
                (best >= min_similarity).then_some(SearchHit { index, score })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.index.cmp(&b.index))
        });
        hits
    }
}

fn document(item: &Item, options: &SearchOptions) -> Vec<(SearchField, String)> {
    options
        .weights
        .iter()
        .map(|(field, _)| {
            let text = match field {
                SearchField::Title => item.title.clone(),
                SearchField::Prompt => item.prompt.clone().unwrap_or_default(),
                SearchField::Keywords => item.keywords.join(" "),
            };
            (*field, text.to_lowercase())
        })
        .collect()
}

fn similarity(query: &str, text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    if text.contains(query) {
        return 1.0;
    }
    text.split_whitespace()
        .map(|token| strsim::normalized_damerau_levenshtein(query, token))
        .fold(strsim::normalized_damerau_levenshtein(query, text), f64::max)
}
