//! Search over one container's store.
//!
//! # Modes
//!
//! | Mode | Candidates | Score |
//! |------|------------|-------|
//! | `semantic` | cosine k-NN of the query embedding | cosine similarity |
//! | `keyword` | term matches for each query variant | min-max normalized match score |
//! | `hybrid` | both | `(1 - α) × keyword + α × semantic`, each min-max normalized |
//!
//! Keyword and hybrid modes also search the variants produced by
//! [`expand_query`] (lowercased, stop words removed) and keep a chunk's
//! best score across variants.
//!
//! # Algorithm
//!
//! 1. Reject an empty container with [`FolioError::EmptyIndex`].
//! 2. Embed the query in query mode (semantic and hybrid only).
//! 3. Fetch `k × multiplier` candidate chunks per candidate list.
//! 4. Keep the best chunk per document (or up to `max_chunks_per_doc`
//!    chunks in multi-chunk mode). A document's score is its best chunk's
//!    score.
//! 5. If deduplication left fewer than `k` results and the store had more
//!    to give, double the fetch and repeat.
//! 6. Return at most `k` results, best first.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use crate::embedding::Embedder;
use crate::error::{EmbeddingError, FolioError, Result};
use crate::models::{ChunkHit, SearchResult};
use crate::store::{rank_hits, VectorStore};

/// Retrieval tuning, decoupled from application config.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Over-fetch factor applied before per-document deduplication.
    pub candidate_multiplier: usize,
    /// Chunk cap per document in multi-chunk mode.
    pub max_chunks_per_doc: usize,
    /// Semantic weight in hybrid mode.
    pub hybrid_alpha: f32,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            candidate_multiplier: 4,
            max_chunks_per_doc: 3,
            hybrid_alpha: 0.6,
        }
    }
}

/// Retrieval mode of a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Semantic,
    Keyword,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Semantic => "semantic",
            SearchMode::Keyword => "keyword",
            SearchMode::Hybrid => "hybrid",
        }
    }

    fn uses_vectors(&self) -> bool {
        !matches!(self, SearchMode::Keyword)
    }

    fn uses_keywords(&self) -> bool {
        !matches!(self, SearchMode::Semantic)
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(SearchMode::Semantic),
            "keyword" => Ok(SearchMode::Keyword),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(format!(
                "unknown search mode: {other}. Use semantic, keyword, or hybrid."
            )),
        }
    }
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub mode: SearchMode,
    /// Return several chunks per document instead of the best one.
    pub multi_chunk: bool,
    /// Only consider documents under this path.
    pub prefix: Option<PathBuf>,
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "shall", "can", "to",
    "of", "in", "for", "on", "with", "at", "by", "from", "as", "into", "about", "between",
    "through", "during", "and", "but", "or", "nor", "not", "so", "yet", "it", "its", "this",
    "that", "these", "those", "i", "me", "my", "we", "our", "you", "your", "he", "she", "they",
    "them", "their", "what", "which", "who", "whom", "how", "when", "where", "why",
];

/// Keyword variants of a query: the query itself, its lowercase form if
/// different, and its non-stop-words when at least two remain and some
/// were dropped.
pub fn expand_query(query: &str) -> Vec<String> {
    let mut variants = vec![query.to_string()];

    let lower = query.to_lowercase();
    if lower != query {
        variants.push(lower.clone());
    }

    let words: Vec<&str> = lower.split_whitespace().collect();
    let keywords: Vec<&str> = words
        .iter()
        .copied()
        .filter(|w| !STOP_WORDS.contains(w))
        .collect();
    if keywords.len() >= 2 && keywords.len() < words.len() {
        variants.push(keywords.join(" "));
    }

    variants
}

/// Embeds queries and ranks a store's chunks against them.
pub struct SearchEngine {
    embedder: Arc<dyn Embedder>,
    params: SearchParams,
}

impl SearchEngine {
    pub fn new(embedder: Arc<dyn Embedder>, params: SearchParams) -> Self {
        Self { embedder, params }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Run `query` against `store`, which belongs to `container`.
    ///
    /// An empty or whitespace-only query returns no results without
    /// calling the embedder. A container with no documents is an error; a
    /// populated container with no matches is an empty result.
    pub async fn search(
        &self,
        container: &str,
        store: &dyn VectorStore,
        query: &str,
        k: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let count = store
            .document_count()
            .await
            .map_err(|e| FolioError::from_store(container, e))?;
        if count == 0 {
            return Err(FolioError::EmptyIndex(container.to_string()));
        }

        let query_vec = if opts.mode.uses_vectors() {
            Some(self.embed_query(container, store, query).await?)
        } else {
            None
        };
        let variants = if opts.mode.uses_keywords() {
            expand_query(query)
        } else {
            Vec::new()
        };

        let (per_doc, multiplier) = if opts.multi_chunk {
            (
                self.params.max_chunks_per_doc.max(1),
                self.params.max_chunks_per_doc.max(1),
            )
        } else {
            (1, self.params.candidate_multiplier.max(1))
        };

        let mut fetch = k.saturating_mul(multiplier);
        loop {
            let (hits, exhausted) = self
                .candidates(container, store, query_vec.as_deref(), &variants, fetch, opts)
                .await?;
            let results = collapse(hits, per_doc, k);

            debug!(
                container,
                mode = %opts.mode,
                fetch,
                results = results.len(),
                "search candidates collapsed"
            );

            if results.len() >= k || exhausted {
                return Ok(results);
            }
            fetch = fetch.saturating_mul(2);
        }
    }

    async fn embed_query(
        &self,
        container: &str,
        store: &dyn VectorStore,
        query: &str,
    ) -> Result<Vec<f32>> {
        let query_vec = self.embedder.embed_query(query).await?;
        if let Some(dims) = store
            .dims()
            .await
            .map_err(|e| FolioError::from_store(container, e))?
        {
            if dims != query_vec.len() {
                return Err(EmbeddingError::Dimension {
                    expected: dims,
                    actual: query_vec.len(),
                }
                .into());
            }
        }
        Ok(query_vec)
    }

    /// Ranked candidate chunks for one fetch size, and whether every
    /// candidate list came back short (the store has nothing more).
    async fn candidates(
        &self,
        container: &str,
        store: &dyn VectorStore,
        query_vec: Option<&[f32]>,
        variants: &[String],
        fetch: usize,
        opts: &SearchOptions,
    ) -> Result<(Vec<ChunkHit>, bool)> {
        let prefix = opts.prefix.as_deref();
        let mut exhausted = true;

        let mut vector = match query_vec {
            Some(v) => store
                .nearest_k(v, fetch, prefix)
                .await
                .map_err(|e| FolioError::from_store(container, e))?,
            None => Vec::new(),
        };
        if query_vec.is_some() && vector.len() >= fetch {
            exhausted = false;
        }

        let mut keyword: Vec<ChunkHit> = Vec::new();
        let mut seen: HashMap<(PathBuf, i64), usize> = HashMap::new();
        for variant in variants {
            let hits = store
                .keyword_k(variant, fetch, prefix)
                .await
                .map_err(|e| FolioError::from_store(container, e))?;
            if hits.len() >= fetch {
                exhausted = false;
            }
            for hit in hits {
                let key = (hit.path.clone(), hit.chunk_index);
                if let Some(&i) = seen.get(&key) {
                    if hit.score > keyword[i].score {
                        keyword[i] = hit;
                    }
                } else {
                    seen.insert(key, keyword.len());
                    keyword.push(hit);
                }
            }
        }

        let hits = match opts.mode {
            SearchMode::Semantic => vector,
            SearchMode::Keyword => {
                normalize_scores(&mut keyword);
                rank_hits(&mut keyword);
                keyword
            }
            SearchMode::Hybrid => {
                normalize_scores(&mut vector);
                normalize_scores(&mut keyword);
                let mut hits = hybrid_merge(vector, keyword, self.params.hybrid_alpha);
                rank_hits(&mut hits);
                hits
            }
        };
        Ok((hits, exhausted))
    }
}

/// Min-max normalize scores to `[0.0, 1.0]`. Equal scores become `1.0`.
pub fn normalize_scores(hits: &mut [ChunkHit]) {
    let min = hits.iter().map(|h| h.score).fold(f32::INFINITY, f32::min);
    let max = hits.iter().map(|h| h.score).fold(f32::NEG_INFINITY, f32::max);
    for hit in hits.iter_mut() {
        hit.score = if (max - min).abs() < f32::EPSILON {
            1.0
        } else {
            (hit.score - min) / (max - min)
        };
    }
}

/// Combine normalized candidate lists per chunk:
/// `(1 - alpha) × keyword + alpha × semantic`, absent scores counting as 0.
fn hybrid_merge(vector: Vec<ChunkHit>, keyword: Vec<ChunkHit>, alpha: f32) -> Vec<ChunkHit> {
    let alpha = alpha.clamp(0.0, 1.0);
    let mut merged: Vec<ChunkHit> = Vec::with_capacity(vector.len() + keyword.len());
    let mut index: HashMap<(PathBuf, i64), usize> = HashMap::new();

    for mut hit in vector {
        hit.score *= alpha;
        index.insert((hit.path.clone(), hit.chunk_index), merged.len());
        merged.push(hit);
    }
    for mut hit in keyword {
        let weighted = (1.0 - alpha) * hit.score;
        match index.get(&(hit.path.clone(), hit.chunk_index)) {
            Some(&i) => merged[i].score += weighted,
            None => {
                hit.score = weighted;
                merged.push(hit);
            }
        }
    }
    merged
}

/// Keep at most `per_doc` hits per path from already-ranked `hits`,
/// stopping at `k` results.
fn collapse(hits: Vec<ChunkHit>, per_doc: usize, k: usize) -> Vec<SearchResult> {
    let mut seen: HashMap<PathBuf, usize> = HashMap::new();
    let mut results = Vec::with_capacity(k.min(hits.len()));
    for hit in hits {
        let n = seen.entry(hit.path.clone()).or_insert(0);
        if *n >= per_doc {
            continue;
        }
        *n += 1;
        results.push(SearchResult::from(hit));
        if results.len() == k {
            break;
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_with_overlap, make_chunk};
    use crate::embedding::HashEmbedder;
    use crate::models::{DocumentRecord, DocumentStatus, Fingerprint};
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embedder that maps the whole query to a fixed vector.
    struct FixedEmbedder {
        vector: Vec<f32>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            self.vector.len()
        }
        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.vector.clone())
        }
    }

    fn fixed(vector: Vec<f32>) -> Arc<FixedEmbedder> {
        Arc::new(FixedEmbedder {
            vector,
            calls: AtomicUsize::new(0),
        })
    }

    async fn put(store: &InMemoryStore, path: &str, chunks: &[(&str, Vec<f32>)]) {
        let text: String = chunks.iter().map(|(t, _)| format!("{}\n", t)).collect();
        let spans = chunk_with_overlap(&text, 2, 0);
        assert_eq!(spans.len(), chunks.len(), "one span per line");
        let stored: Vec<_> = spans
            .iter()
            .zip(chunks)
            .map(|(s, (_, v))| make_chunk(Path::new(path), s, v.clone()))
            .collect();
        let doc = DocumentRecord {
            path: PathBuf::from(path),
            fingerprint: Some(Fingerprint {
                content_hash: path.to_string(),
                size: 1,
                mtime_ns: 1,
            }),
            status: DocumentStatus::Indexed,
            error: None,
            chunk_ids: Vec::new(),
            indexed_at: 1,
            model: "fixed".to_string(),
        };
        store.upsert(&doc, &stored).await.unwrap();
    }

    async fn put_text(store: &InMemoryStore, path: &str, text: &str, vector: Vec<f32>) {
        let spans = chunk_with_overlap(text, 800, 0);
        let chunk = make_chunk(Path::new(path), &spans[0], vector);
        let doc = DocumentRecord {
            path: PathBuf::from(path),
            fingerprint: None,
            status: DocumentStatus::Indexed,
            error: None,
            chunk_ids: Vec::new(),
            indexed_at: 1,
            model: "fixed".to_string(),
        };
        store.upsert(&doc, &[chunk]).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_container_is_error() {
        let store = InMemoryStore::new();
        let engine = SearchEngine::new(fixed(vec![1.0, 0.0]), SearchParams::default());
        let err = engine
            .search("Default", &store, "anything", 5, &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FolioError::EmptyIndex(ref c) if c == "Default"));
    }

    #[tokio::test]
    async fn test_blank_query_skips_embedder() {
        let store = InMemoryStore::new();
        let embedder = fixed(vec![1.0, 0.0]);
        let engine = SearchEngine::new(embedder.clone(), SearchParams::default());
        let results = engine
            .search("Default", &store, "   ", 5, &SearchOptions::default())
            .await
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dedup_keeps_best_chunk_per_document() {
        let store = InMemoryStore::new();
        put(&store, "/d/a", &[("a", vec![1.0, 0.0]), ("b", vec![0.6, 0.8])]).await;
        put(&store, "/d/b", &[("c", vec![0.8, 0.6])]).await;

        let engine = SearchEngine::new(fixed(vec![1.0, 0.0]), SearchParams::default());
        let results = engine
            .search("Default", &store, "q", 10, &SearchOptions::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].path, PathBuf::from("/d/a"));
        assert_eq!(results[0].chunk_index, 0);
        assert!((results[0].score - 1.0).abs() < 1e-6);
        assert_eq!(results[1].path, PathBuf::from("/d/b"));
    }

    #[tokio::test]
    async fn test_multi_chunk_returns_several_per_document() {
        let store = InMemoryStore::new();
        put(&store, "/d/a", &[("a", vec![1.0, 0.0]), ("b", vec![0.6, 0.8])]).await;
        put(&store, "/d/b", &[("c", vec![0.8, 0.6])]).await;

        let engine = SearchEngine::new(fixed(vec![1.0, 0.0]), SearchParams::default());
        let opts = SearchOptions {
            multi_chunk: true,
            ..SearchOptions::default()
        };
        let results = engine.search("Default", &store, "q", 10, &opts).await.unwrap();
        let scores: Vec<f32> = results.iter().map(|r| r.score).collect();
        assert_eq!(results.len(), 3);
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    }

    #[tokio::test]
    async fn test_refetches_when_one_document_dominates() {
        let store = InMemoryStore::new();
        let many: Vec<(&str, Vec<f32>)> = (0..12).map(|_| ("x", vec![1.0, 0.0])).collect();
        put(&store, "/d/big", &many).await;
        put(&store, "/d/small", &[("y", vec![0.0, 1.0])]).await;

        let params = SearchParams {
            candidate_multiplier: 1,
            ..SearchParams::default()
        };
        let engine = SearchEngine::new(fixed(vec![1.0, 0.0]), params);
        let results = engine
            .search("Default", &store, "q", 2, &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].path, PathBuf::from("/d/small"));
    }

    #[tokio::test]
    async fn test_prefix_isolation() {
        let store = InMemoryStore::new();
        put(&store, "/x/p1/a", &[("a", vec![0.5, 0.5])]).await;
        put(&store, "/x/p10/b", &[("b", vec![1.0, 0.0])]).await;

        let engine = SearchEngine::new(fixed(vec![1.0, 0.0]), SearchParams::default());
        let opts = SearchOptions {
            prefix: Some(PathBuf::from("/x/p1")),
            ..SearchOptions::default()
        };
        let results = engine.search("Default", &store, "q", 5, &opts).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, PathBuf::from("/x/p1/a"));
    }

    #[tokio::test]
    async fn test_query_dimension_mismatch() {
        let store = InMemoryStore::new();
        put(&store, "/d/a", &[("a", vec![1.0, 0.0])]).await;
        let engine = SearchEngine::new(Arc::new(HashEmbedder::new(8)), SearchParams::default());
        let err = engine
            .search("Default", &store, "q", 5, &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FolioError::Embedding(EmbeddingError::Dimension {
                expected: 2,
                actual: 8
            })
        ));
    }

    #[tokio::test]
    async fn test_huge_k_returns_what_exists() {
        let store = InMemoryStore::new();
        put(&store, "/d/a", &[("a", vec![1.0, 0.0])]).await;
        put(&store, "/d/b", &[("b", vec![0.0, 1.0])]).await;

        let engine = SearchEngine::new(fixed(vec![1.0, 0.0]), SearchParams::default());
        for mode in [SearchMode::Semantic, SearchMode::Keyword, SearchMode::Hybrid] {
            let opts = SearchOptions {
                mode,
                multi_chunk: true,
                ..SearchOptions::default()
            };
            let results = engine
                .search("Default", &store, "a b", usize::MAX / 4, &opts)
                .await
                .unwrap();
            assert_eq!(results.len(), 2, "{mode}");
        }
        let results = engine
            .search("Default", &store, "q", usize::MAX, &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_keyword_mode_skips_embedder() {
        let store = InMemoryStore::new();
        put_text(&store, "/d/a", "quarterly budget review", vec![1.0, 0.0]).await;
        put_text(&store, "/d/b", "budget", vec![1.0, 0.0]).await;
        put_text(&store, "/d/c", "holiday photos", vec![1.0, 0.0]).await;

        let embedder = fixed(vec![1.0, 0.0]);
        let engine = SearchEngine::new(embedder.clone(), SearchParams::default());
        let opts = SearchOptions {
            mode: SearchMode::Keyword,
            ..SearchOptions::default()
        };
        let results = engine
            .search("Default", &store, "Budget Review", 10, &opts)
            .await
            .unwrap();

        let paths: Vec<PathBuf> = results.iter().map(|r| r.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("/d/a"), PathBuf::from("/d/b")]);
        assert!((results[0].score - 1.0).abs() < 1e-6);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hybrid_weights_keyword_against_semantic() {
        let store = InMemoryStore::new();
        put_text(&store, "/d/apple", "apple pie recipe", vec![0.0, 1.0]).await;
        put_text(&store, "/d/banana", "banana bread", vec![1.0, 0.0]).await;

        let semantic = SearchEngine::new(fixed(vec![1.0, 0.0]), SearchParams::default());
        let results = semantic
            .search("Default", &store, "apple", 2, &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results[0].path, PathBuf::from("/d/banana"));

        let opts = SearchOptions {
            mode: SearchMode::Hybrid,
            ..SearchOptions::default()
        };
        let vector_heavy = SearchEngine::new(fixed(vec![1.0, 0.0]), SearchParams::default());
        let results = vector_heavy
            .search("Default", &store, "apple", 2, &opts)
            .await
            .unwrap();
        assert_eq!(results[0].path, PathBuf::from("/d/banana"));
        assert!((results[0].score - 0.6).abs() < 1e-6);
        assert!((results[1].score - 0.4).abs() < 1e-6);

        let params = SearchParams {
            hybrid_alpha: 0.3,
            ..SearchParams::default()
        };
        let keyword_heavy = SearchEngine::new(fixed(vec![1.0, 0.0]), params);
        let results = keyword_heavy
            .search("Default", &store, "apple", 2, &opts)
            .await
            .unwrap();
        assert_eq!(results[0].path, PathBuf::from("/d/apple"));
    }

    #[tokio::test]
    async fn test_keyword_uses_expanded_variants() {
        let store = InMemoryStore::new();
        put_text(&store, "/d/a", "implement search", vec![1.0, 0.0]).await;
        let engine = SearchEngine::new(fixed(vec![1.0, 0.0]), SearchParams::default());
        let opts = SearchOptions {
            mode: SearchMode::Keyword,
            ..SearchOptions::default()
        };
        let results = engine
            .search("Default", &store, "how to implement search", 5, &opts)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_expand_query() {
        assert_eq!(expand_query("Hello World"), vec!["Hello World", "hello world"]);
        assert_eq!(expand_query("hello"), vec!["hello"]);
        assert_eq!(
            expand_query("how to implement search"),
            vec!["how to implement search", "implement search"]
        );
    }

    #[test]
    fn test_search_mode_parse() {
        assert_eq!("hybrid".parse::<SearchMode>(), Ok(SearchMode::Hybrid));
        assert_eq!(SearchMode::default(), SearchMode::Semantic);
        assert!("fuzzy".parse::<SearchMode>().is_err());
    }

    #[test]
    fn test_normalize_scores() {
        let mut hits: Vec<ChunkHit> = [3.0, 1.0, 2.0]
            .iter()
            .map(|s| ChunkHit {
                path: PathBuf::from("/x"),
                chunk_index: 0,
                start: 0,
                end: 0,
                text: String::new(),
                score: *s,
                indexed_at: 0,
            })
            .collect();
        normalize_scores(&mut hits);
        let scores: Vec<f32> = hits.iter().map(|h| h.score).collect();
        assert_eq!(scores, vec![1.0, 0.0, 0.5]);
    }
}
