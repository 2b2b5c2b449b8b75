//! Hybrid retriever: one embedding pass, multi-namespace vector search,
//! namespace boosting, deduplication, lexical reranking, a context budget,
//! and join-back enrichment of structured-row candidates. Structured facts
//! reach the generator only as prose, never as raw rows.

pub mod boost;
pub mod rerank;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingModel;
use crate::relational::RelationalStore;
use crate::types::{ContextChunk, ContextOrigin, Namespace, RetrievalCandidate};
use crate::vector::{MetadataFilter, VectorStore};

use boost::boost;
use rerank::{normalize, Bm25Scorer};

/// Normalized form used for duplicate detection: lowercase, non-word
/// characters collapsed to single spaces.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            for lc in c.to_lowercase() {
                out.push(lc);
            }
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

/// The router's retrieval seam: a question plus a relational store for
/// enrichment, out comes budgeted context.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(
        &self,
        question: &str,
        store: &Arc<dyn RelationalStore>,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ContextChunk>>;
}

pub struct HybridRetriever {
    embedder: Arc<dyn EmbeddingModel>,
    vector_store: Arc<dyn VectorStore>,
    namespaces: Vec<Namespace>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingModel>,
        vector_store: Arc<dyn VectorStore>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            vector_store,
            namespaces: vec![Namespace::CourseRows, Namespace::Pdf, Namespace::Generated],
            config,
        }
    }

    /// Override the namespaces queried (defaults to rows + PDF + generated).
    pub fn with_namespaces(mut self, namespaces: Vec<Namespace>) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Retrieve budgeted context strings for the question. An empty result
    /// is a valid outcome, not an error — the caller decides the message.
    pub async fn retrieve(
        &self,
        question: &str,
        store: &Arc<dyn RelationalStore>,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ContextChunk>> {
        let (chunks, _) = self
            .retrieve_with_provenance(question, store, filter)
            .await?;
        Ok(chunks)
    }

    /// Same pipeline, returning the selected candidates alongside the
    /// context for callers that need provenance.
    pub async fn retrieve_with_provenance(
        &self,
        question: &str,
        store: &Arc<dyn RelationalStore>,
        filter: Option<&MetadataFilter>,
    ) -> Result<(Vec<ContextChunk>, Vec<RetrievalCandidate>)> {
        let query_vector = self.embedder.embed_query(question).await?;

        let mut candidates = self.query_namespaces(question, &query_vector, filter).await;
        if candidates.is_empty() {
            tracing::info!(question = question, "Vector store returned no candidates");
            return Ok((Vec::new(), Vec::new()));
        }

        // Ordering after boosting defines the "original rank" tie-breaker.
        candidates.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let deduped = self.deduplicate(candidates);
        if deduped.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let selected = self.rerank(question, deduped);
        self.assemble_context(store, selected).await
    }

    /// Query every configured namespace with the shared embedding; a
    /// failing namespace is skipped, not fatal.
    async fn query_namespaces(
        &self,
        question: &str,
        query_vector: &[f32],
        filter: Option<&MetadataFilter>,
    ) -> Vec<RetrievalCandidate> {
        let mut candidates = Vec::new();
        for &namespace in &self.namespaces {
            let matches = match self
                .vector_store
                .query(
                    namespace,
                    query_vector,
                    self.config.per_namespace_top_k,
                    filter,
                )
                .await
            {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(
                        namespace = namespace.as_str(),
                        error = %e,
                        "Namespace query failed, continuing without it"
                    );
                    continue;
                }
            };

            let multiplier = boost(question, namespace, &self.config.boosts);
            tracing::debug!(
                namespace = namespace.as_str(),
                hits = matches.len(),
                boost = multiplier,
                "Namespace candidates"
            );

            for m in matches {
                candidates.push(RetrievalCandidate {
                    id: m.id,
                    namespace,
                    raw_score: m.score,
                    rerank_score: m.score * multiplier,
                    metadata: m.metadata,
                    text: m.text,
                });
            }
        }
        candidates
    }

    /// Drop near-empty chunks and candidates whose normalized text was
    /// already seen.
    fn deduplicate(&self, candidates: Vec<RetrievalCandidate>) -> Vec<RetrievalCandidate> {
        let mut seen: HashSet<String> = HashSet::new();
        let before = candidates.len();
        let kept: Vec<RetrievalCandidate> = candidates
            .into_iter()
            .filter(|c| {
                let normalized = normalize_text(&c.text);
                if normalized.len() < self.config.min_chunk_chars {
                    return false;
                }
                seen.insert(normalized)
            })
            .collect();
        tracing::debug!(before = before, after = kept.len(), "Deduplication");
        kept
    }

    /// Blend the boosted vector score with the lexical BM25 score and keep
    /// the top candidates. Ties go to the candidate closer to the original
    /// embedding ranking.
    fn rerank(&self, question: &str, candidates: Vec<RetrievalCandidate>) -> Vec<RetrievalCandidate> {
        let texts: Vec<&str> = candidates.iter().map(|c| c.text.as_str()).collect();
        let lexical = Bm25Scorer::new(&texts).score_all(question);

        let vector_scores: Vec<f32> = candidates.iter().map(|c| c.rerank_score).collect();
        let vector_norm = normalize(&vector_scores);
        let lexical_norm = normalize(&lexical);

        let alpha = self.config.rerank_alpha;
        let mut ranked: Vec<(usize, RetrievalCandidate)> = candidates
            .into_iter()
            .enumerate()
            .map(|(rank, mut c)| {
                c.rerank_score = (1.0 - alpha) * vector_norm[rank] + alpha * lexical_norm[rank];
                (rank, c)
            })
            .collect();

        ranked.sort_by(|(rank_a, a), (rank_b, b)| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(rank_a.cmp(rank_b))
        });
        ranked.truncate(self.config.rerank_top_k);
        ranked.into_iter().map(|(_, c)| c).collect()
    }

    /// Enrich the selected candidates and accumulate them under the word
    /// and chunk budget. Stops at the first chunk that would overflow.
    async fn assemble_context(
        &self,
        store: &Arc<dyn RelationalStore>,
        selected: Vec<RetrievalCandidate>,
    ) -> Result<(Vec<ContextChunk>, Vec<RetrievalCandidate>)> {
        let mut chunks = Vec::new();
        let mut used = Vec::new();
        let mut words_used = 0usize;

        for candidate in selected {
            if chunks.len() >= self.config.max_context_chunks {
                break;
            }

            let chunk = self.enrich(store, &candidate).await;
            let words = chunk.text.split_whitespace().count();
            if words_used + words > self.config.max_context_words {
                tracing::debug!(
                    words_used = words_used,
                    next_chunk_words = words,
                    budget = self.config.max_context_words,
                    "Context budget reached"
                );
                break;
            }

            words_used += words;
            chunks.push(chunk);
            used.push(candidate);
        }

        tracing::info!(
            chunks = chunks.len(),
            words = words_used,
            "Context assembled"
        );
        Ok((chunks, used))
    }

    /// Structured-row candidates are resolved into prose via targeted join
    /// queries; document candidates keep their chunk text.
    async fn enrich(
        &self,
        store: &Arc<dyn RelationalStore>,
        candidate: &RetrievalCandidate,
    ) -> ContextChunk {
        if let (Some(table), Some(pk)) = (
            candidate.metadata.table_name.as_deref(),
            candidate.metadata.primary_key,
        ) {
            match self.resolve_row(store, table, pk).await {
                Ok(Some(prose)) => {
                    return ContextChunk {
                        text: prose,
                        origin: ContextOrigin::Database {
                            table: table.to_string(),
                        },
                    };
                }
                Ok(None) => {
                    tracing::warn!(table = table, pk = pk, "Row vanished, using chunk text");
                }
                Err(e) => {
                    tracing::warn!(table = table, pk = pk, error = %e, "Enrichment failed, using chunk text");
                }
            }
        }

        let origin = match candidate.namespace {
            Namespace::CourseRows => ContextOrigin::Database {
                table: candidate
                    .metadata
                    .table_name
                    .clone()
                    .unwrap_or_else(|| "sconosciuta".to_string()),
            },
            Namespace::Pdf => ContextOrigin::Document {
                file: candidate
                    .metadata
                    .source_file
                    .clone()
                    .unwrap_or_else(|| "documento".to_string()),
                page: candidate.metadata.page,
            },
            Namespace::Generated => ContextOrigin::Generated,
            Namespace::WebSearch => ContextOrigin::Web,
        };

        ContextChunk {
            text: candidate.text.clone(),
            origin,
        }
    }

    async fn resolve_row(
        &self,
        store: &Arc<dyn RelationalStore>,
        table: &str,
        pk: i64,
    ) -> Result<Option<String>> {
        let prose = match table {
            "corso" => store.course_profile(pk).await?.map(|p| p.to_string()),
            "docente" => store.professor_profile(pk).await?.map(|p| p.to_string()),
            "esame" => store.exam_profile(pk).await?.map(|p| p.to_string()),
            other => {
                tracing::warn!(table = other, "No enrichment join for table");
                None
            }
        };
        Ok(prose)
    }
}

#[async_trait]
impl Retriever for HybridRetriever {
    async fn retrieve(
        &self,
        question: &str,
        store: &Arc<dyn RelationalStore>,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ContextChunk>> {
        HybridRetriever::retrieve(self, question, store, filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoostConfig;
    use crate::relational::{
        CourseProfile, ExamProfile, ProfessorProfile, RelationalStore, SqlRow,
    };
    use crate::types::CandidateMetadata;
    use crate::vector::VectorMatch;
    use async_trait::async_trait;

    struct FakeEmbedder;

    #[async_trait]
    impl EmbeddingModel for FakeEmbedder {
        async fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0, 0.0])
        }
        fn dimension(&self) -> usize {
            3
        }
    }

    /// Returns canned matches per namespace.
    struct FakeVectorStore {
        matches: Vec<(Namespace, VectorMatch)>,
    }

    #[async_trait]
    impl VectorStore for FakeVectorStore {
        async fn query(
            &self,
            namespace: Namespace,
            _vector: &[f32],
            _top_k: usize,
            _filter: Option<&MetadataFilter>,
        ) -> Result<Vec<VectorMatch>> {
            Ok(self
                .matches
                .iter()
                .filter(|(ns, _)| *ns == namespace)
                .map(|(_, m)| m.clone())
                .collect())
        }
    }

    struct FakeRelationalStore;

    #[async_trait]
    impl RelationalStore for FakeRelationalStore {
        async fn get_schema(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn run_query(&self, _sql: &str) -> Result<Vec<SqlRow>> {
            Ok(Vec::new())
        }
        async fn course_profile(&self, pk: i64) -> Result<Option<CourseProfile>> {
            if pk == 1 {
                Ok(Some(CourseProfile {
                    name: "Basi di Dati".to_string(),
                    credits: 6,
                    professor: Some("Maria Rossi".to_string()),
                    exam_format: Some("scritto".to_string()),
                    semester: Some(1),
                }))
            } else {
                Ok(None)
            }
        }
        async fn professor_profile(&self, _pk: i64) -> Result<Option<ProfessorProfile>> {
            Ok(None)
        }
        async fn exam_profile(&self, _pk: i64) -> Result<Option<ExamProfile>> {
            Ok(None)
        }
        async fn rollback(&self) {}
        async fn close(&self) {}
    }

    fn doc_match(id: &str, score: f32, text: &str) -> VectorMatch {
        VectorMatch {
            id: id.to_string(),
            score,
            text: text.to_string(),
            metadata: CandidateMetadata {
                source_file: Some("regolamento.pdf".to_string()),
                page: Some(3),
                ..CandidateMetadata::default()
            },
        }
    }

    fn row_match(id: &str, score: f32, pk: i64) -> VectorMatch {
        VectorMatch {
            id: id.to_string(),
            score,
            text: "corso 1 | Basi di Dati | 6".to_string(),
            metadata: CandidateMetadata {
                table_name: Some("corso".to_string()),
                primary_key: Some(pk),
                ..CandidateMetadata::default()
            },
        }
    }

    fn retriever(matches: Vec<(Namespace, VectorMatch)>) -> HybridRetriever {
        HybridRetriever::new(
            Arc::new(FakeEmbedder),
            Arc::new(FakeVectorStore { matches }),
            RetrievalConfig::default(),
        )
    }

    fn store() -> Arc<dyn RelationalStore> {
        Arc::new(FakeRelationalStore)
    }

    #[tokio::test]
    async fn empty_vector_results_yield_empty_context() {
        let r = retriever(Vec::new());
        let chunks = r
            .retrieve("Quanti CFU vale Basi di Dati?", &store(), None)
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn duplicate_normalized_text_survives_once() {
        let text = "Il regolamento didattico prevede venti giorni di preavviso per ogni appello";
        let r = retriever(vec![
            (Namespace::Pdf, doc_match("a", 0.9, text)),
            (
                Namespace::Generated,
                doc_match("b", 0.8, "  IL regolamento didattico,, prevede venti giorni di preavviso per ogni appello!!"),
            ),
        ]);
        let chunks = r.retrieve("regolamento appello", &store(), None).await.unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn near_empty_chunks_are_dropped() {
        let r = retriever(vec![(Namespace::Pdf, doc_match("a", 0.9, "ok."))]);
        let chunks = r.retrieve("regolamento", &store(), None).await.unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn chunk_count_respects_budget() {
        let mut matches = Vec::new();
        for i in 0..20 {
            matches.push((
                Namespace::Pdf,
                doc_match(
                    &format!("doc{i}"),
                    0.9 - i as f32 * 0.01,
                    &format!("Capitolo {i} del regolamento didattico: disciplina gli appelli e le scadenze della sessione {i}."),
                ),
            ));
        }
        let r = retriever(matches);
        let chunks = r.retrieve("scadenze appelli", &store(), None).await.unwrap();
        assert!(chunks.len() <= 5);
    }

    #[tokio::test]
    async fn word_budget_stops_accumulation() {
        let long_text = "regolamento ".repeat(50) + "della sessione d'esame autunnale";
        let mut matches = Vec::new();
        for i in 0..10 {
            matches.push((
                Namespace::Pdf,
                doc_match(&format!("doc{i}"), 0.9, &format!("{long_text} parte {i}")),
            ));
        }
        let mut r = retriever(matches);
        r.config.max_context_words = 120;
        let chunks = r.retrieve("regolamento sessione", &store(), None).await.unwrap();
        let words: usize = chunks
            .iter()
            .map(|c| c.text.split_whitespace().count())
            .sum();
        assert!(words <= 120);
        assert!(chunks.len() < 10);
    }

    #[tokio::test]
    async fn structured_rows_become_prose() {
        let r = retriever(vec![(Namespace::CourseRows, row_match("r1", 0.9, 1))]);
        let chunks = r
            .retrieve("Quanti crediti vale il corso di Basi di Dati?", &store(), None)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("6 CFU"));
        assert!(chunks[0].text.contains("Maria Rossi"));
        // Never the raw exported row.
        assert!(!chunks[0].text.contains('|'));
    }

    #[tokio::test]
    async fn vanished_row_falls_back_to_chunk_text() {
        let r = retriever(vec![(Namespace::CourseRows, row_match("r1", 0.9, 999))]);
        let chunks = r
            .retrieve("Quanti crediti vale il corso di Basi di Dati?", &store(), None)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "corso 1 | Basi di Dati | 6");
    }

    #[tokio::test]
    async fn boost_prefers_cued_namespace_on_equal_scores() {
        let doc_text = "Il regolamento disciplina le scadenze degli appelli della sessione estiva";
        let row_text = "corso 1 | Basi di Dati | 6 | con molte altre parole di contorno qui";
        let r = retriever(vec![
            (Namespace::CourseRows, {
                let mut m = row_match("row", 0.8, 1);
                m.text = row_text.to_string();
                m
            }),
            (Namespace::Pdf, doc_match("doc", 0.8, doc_text)),
        ]);
        let (_, used) = r
            .retrieve_with_provenance("Dove trovo il regolamento sulle scadenze?", &store(), None)
            .await
            .unwrap();
        assert_eq!(used[0].namespace, Namespace::Pdf);
    }

    #[test]
    fn normalize_text_collapses_case_and_punctuation() {
        assert_eq!(
            normalize_text("  Quanti CFU?? vale,il corso  "),
            "quanti cfu vale il corso"
        );
    }
}
