//! The dispatcher: classify the question, try the Text-to-SQL path under
//! a bounded retry budget when the classifier is confident, otherwise (or
//! on exhaustion) answer via hybrid retrieval + generation. One relational
//! connection per invocation, released on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::classifier::{LexicalClassifier, QuestionClassifier};
use crate::config::{EngineConfig, RouterConfig};
use crate::embedding::RemoteEmbedder;
use crate::error::{EngineError, EngineResult};
use crate::llm::{GenerationOptions, Generator, OpenAiCompatGenerator};
use crate::prompt::PromptBuilder;
use crate::relational::{RelationalStore, SqlRow, SqliteStoreFactory, StoreFactory};
use crate::retrieval::{HybridRetriever, Retriever};
use crate::text2sql::{is_sql_safe, SqlConverter};
use crate::vector::RemoteVectorStore;
use crate::types::{
    Classification, QuestionLabel, RoutePath, RouterResult, StreamEvent, Timings,
};

/// Best-effort cooperative cancellation, checked between major steps.
/// External calls themselves are opaque and run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Why one Text-to-SQL attempt failed. Normal control flow, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptFailure {
    GeneratorError,
    Sentinel,
    Unsafe,
    EmptyRows,
    ExecutionError,
}

impl AttemptFailure {
    fn as_str(&self) -> &'static str {
        match self {
            AttemptFailure::GeneratorError => "generator_error",
            AttemptFailure::Sentinel => "sentinel",
            AttemptFailure::Unsafe => "unsafe_sql",
            AttemptFailure::EmptyRows => "empty_rows",
            AttemptFailure::ExecutionError => "execution_error",
        }
    }
}

/// Terminal state of the bounded attempt loop.
enum SqlOutcome {
    Answered { sql: String, rows: Vec<SqlRow> },
    Exhausted { last: AttemptFailure },
}

#[derive(Clone)]
pub struct QueryRouter {
    classifier: Arc<dyn QuestionClassifier>,
    converter: Arc<SqlConverter>,
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn Generator>,
    prompt_builder: PromptBuilder,
    store_factory: Arc<dyn StoreFactory>,
    config: RouterConfig,
    answer_options: GenerationOptions,
}

impl QueryRouter {
    pub fn new(
        classifier: Arc<dyn QuestionClassifier>,
        converter: Arc<SqlConverter>,
        retriever: Arc<dyn Retriever>,
        generator: Arc<dyn Generator>,
        store_factory: Arc<dyn StoreFactory>,
        config: RouterConfig,
        answer_options: GenerationOptions,
    ) -> Self {
        Self {
            classifier,
            converter,
            retriever,
            generator,
            prompt_builder: PromptBuilder::new(),
            store_factory,
            config,
            answer_options,
        }
    }

    /// Wire the production collaborators from configuration: remote
    /// generator and embedder, remote vector store, SQLite factory and
    /// the lexical classifier.
    pub fn from_config(config: &EngineConfig) -> anyhow::Result<Self> {
        let generator: Arc<dyn Generator> =
            Arc::new(OpenAiCompatGenerator::new(&config.generation)?);
        let embedder = Arc::new(RemoteEmbedder::new(
            config.embedding.endpoint.clone(),
            config.embedding.model.clone(),
            config.embedding.api_key.clone(),
            config.embedding.dimension,
        )?);
        let vector_store = Arc::new(RemoteVectorStore::new(
            config.vector_store.endpoint.clone(),
            config.vector_store.api_key.clone(),
        )?);
        let retriever = Arc::new(HybridRetriever::new(
            embedder,
            vector_store,
            config.retrieval.clone(),
        ));
        let converter = Arc::new(SqlConverter::new(
            generator.clone(),
            config.text2sql.clone(),
        ));
        let answer_options = GenerationOptions {
            max_tokens: config.generation.max_tokens,
            temperature: config.generation.temperature,
            stop: Vec::new(),
        };

        Ok(Self::new(
            Arc::new(LexicalClassifier::new()),
            converter,
            retriever,
            generator,
            Arc::new(SqliteStoreFactory::new(config.database.path.clone())),
            config.router.clone(),
            answer_options,
        ))
    }

    /// Answer a question, returning the full structured result.
    pub async fn answer(&self, question: &str) -> EngineResult<RouterResult> {
        self.answer_with_cancel(question, &CancelToken::new()).await
    }

    pub async fn answer_with_cancel(
        &self,
        question: &str,
        cancel: &CancelToken,
    ) -> EngineResult<RouterResult> {
        let total_start = Instant::now();
        let store = self
            .store_factory
            .open()
            .map_err(EngineError::SqlExecution)?;

        let result = self.dispatch(question, &store, cancel, total_start).await;

        // The one connection this invocation opened is released on every
        // path: success, fallback, cancellation or error.
        store.close().await;
        result
    }

    async fn dispatch(
        &self,
        question: &str,
        store: &Arc<dyn RelationalStore>,
        cancel: &CancelToken,
        total_start: Instant,
    ) -> EngineResult<RouterResult> {
        cancel.check()?;
        let classification = self.classify(question).await;
        cancel.check()?;

        let confident_simple = classification.label == QuestionLabel::Simple
            && classification.confidence >= self.config.confidence_threshold;

        if confident_simple {
            let sql_start = Instant::now();
            match self.try_text2sql(question, store, cancel).await? {
                SqlOutcome::Answered { sql, rows } => {
                    let retrieval_time = sql_start.elapsed().as_secs_f64();
                    cancel.check()?;

                    let gen_start = Instant::now();
                    let response = self
                        .converter
                        .narrate_rows(question, &rows)
                        .await
                        .map_err(EngineError::Generation)?;

                    tracing::info!(
                        chosen = "T2SQL",
                        rows = rows.len(),
                        sql = %sql,
                        "Question answered via Text-to-SQL"
                    );
                    return Ok(RouterResult {
                        response,
                        chosen: RoutePath::TextToSql,
                        ml_model: classification.label,
                        ml_confidence: classification.confidence,
                        query: Some(sql),
                        fallback: false,
                        timings: Timings {
                            retrieval_time,
                            generation_time: gen_start.elapsed().as_secs_f64(),
                            total_time: total_start.elapsed().as_secs_f64(),
                        },
                        context_used: 0,
                    });
                }
                SqlOutcome::Exhausted { last } => {
                    tracing::info!(
                        last_failure = last.as_str(),
                        attempts = self.config.max_sql_attempts,
                        "Text-to-SQL exhausted, falling back to retrieval"
                    );
                    return self
                        .answer_with_rag(question, store, cancel, classification, true, total_start)
                        .await;
                }
            }
        }

        self.answer_with_rag(question, store, cancel, classification, false, total_start)
            .await
    }

    /// Classifier failures never abort the request: default to the safer
    /// retrieval path with zero confidence.
    async fn classify(&self, question: &str) -> Classification {
        match self.classifier.classify(question).await {
            Ok(c) => {
                tracing::debug!(label = %c.label, confidence = c.confidence, "Classified");
                c
            }
            Err(e) => {
                tracing::warn!(error = %e, "Classifier failed, defaulting to complex");
                Classification {
                    label: QuestionLabel::Complex,
                    confidence: 0.0,
                }
            }
        }
    }

    /// Bounded NL→SQL attempt loop. Each iteration is one fresh generation;
    /// failures are counted, never re-executed.
    async fn try_text2sql(
        &self,
        question: &str,
        store: &Arc<dyn RelationalStore>,
        cancel: &CancelToken,
    ) -> EngineResult<SqlOutcome> {
        let schema = match store.get_schema().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "Schema introspection failed, skipping SQL path");
                return Ok(SqlOutcome::Exhausted {
                    last: AttemptFailure::ExecutionError,
                });
            }
        };
        let prompt = self.converter.prompt_for(question, &schema);

        let mut last = AttemptFailure::Sentinel;
        for attempt in 0..self.config.max_sql_attempts {
            cancel.check()?;

            let raw = match self.converter.query_llm(&prompt).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(attempt = attempt, error = %e, "SQL generation call failed");
                    last = AttemptFailure::GeneratorError;
                    continue;
                }
            };

            let cleaned = self.converter.clean(&raw);
            if cleaned == self.converter.sentinel() {
                tracing::debug!(attempt = attempt, "Generator declared question untranslatable");
                last = AttemptFailure::Sentinel;
                continue;
            }
            if !is_sql_safe(&cleaned) {
                tracing::warn!(attempt = attempt, sql = %cleaned, "Unsafe SQL rejected");
                last = AttemptFailure::Unsafe;
                continue;
            }

            match store.run_query(&cleaned).await {
                Ok(rows) if !rows.is_empty() => {
                    return Ok(SqlOutcome::Answered { sql: cleaned, rows });
                }
                Ok(_) => {
                    // Zero rows: retry with a fresh generation rather than
                    // answering "no such data" — the question may simply
                    // have been translated badly.
                    tracing::debug!(attempt = attempt, sql = %cleaned, "Query returned no rows");
                    last = AttemptFailure::EmptyRows;
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt, error = %e, "SQL execution failed");
                    store.rollback().await;
                    last = AttemptFailure::ExecutionError;
                }
            }
        }

        Ok(SqlOutcome::Exhausted { last })
    }

    async fn answer_with_rag(
        &self,
        question: &str,
        store: &Arc<dyn RelationalStore>,
        cancel: &CancelToken,
        classification: Classification,
        fallback: bool,
        total_start: Instant,
    ) -> EngineResult<RouterResult> {
        let retrieval_start = Instant::now();
        let context = match self.retriever.retrieve(question, store, None).await {
            Ok(c) => c,
            Err(e) => {
                // Retrieval failure degrades to the no-information answer
                // rather than a hard error.
                tracing::warn!(error = %e, "Retrieval failed, treating as empty context");
                Vec::new()
            }
        };
        let retrieval_time = retrieval_start.elapsed().as_secs_f64();
        cancel.check()?;

        if context.is_empty() {
            return Ok(RouterResult {
                response: self.config.no_information_message.clone(),
                chosen: RoutePath::Rag,
                ml_model: classification.label,
                ml_confidence: classification.confidence,
                query: None,
                fallback,
                timings: Timings {
                    retrieval_time,
                    generation_time: 0.0,
                    total_time: total_start.elapsed().as_secs_f64(),
                },
                context_used: 0,
            });
        }

        let prompt = self.prompt_builder.build(question, &context);
        let gen_start = Instant::now();
        let response = self
            .generator
            .generate(&prompt, &self.answer_options)
            .await
            .map_err(EngineError::Generation)?;

        tracing::info!(
            chosen = "RAG",
            fallback = fallback,
            context_chunks = context.len(),
            "Question answered via retrieval"
        );
        Ok(RouterResult {
            response,
            chosen: RoutePath::Rag,
            ml_model: classification.label,
            ml_confidence: classification.confidence,
            query: None,
            fallback,
            timings: Timings {
                retrieval_time,
                generation_time: gen_start.elapsed().as_secs_f64(),
                total_time: total_start.elapsed().as_secs_f64(),
            },
            context_used: context.len(),
        })
    }

    /// Streaming variant: identical routing, but the final generation is
    /// consumed token by token. Wire order: timing, tokens, end; an error
    /// event replaces any further events.
    pub fn answer_stream(&self, question: &str) -> AnswerStream {
        self.answer_stream_with_cancel(question, CancelToken::new())
    }

    pub fn answer_stream_with_cancel(&self, question: &str, cancel: CancelToken) -> AnswerStream {
        let (tx, rx) = mpsc::channel(100);
        let router = self.clone();
        let question = question.to_string();

        tokio::spawn(async move {
            router.stream_task(question, cancel, tx).await;
        });

        AnswerStream { receiver: rx }
    }

    async fn stream_task(&self, question: String, cancel: CancelToken, tx: mpsc::Sender<StreamEvent>) {
        let total_start = Instant::now();
        let store = match self.store_factory.open() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Could not open relational store for streaming");
                let _ = tx
                    .send(StreamEvent::Error {
                        error: EngineError::SqlExecution(e).to_string(),
                    })
                    .await;
                return;
            }
        };

        let outcome = self
            .stream_dispatch(&question, &store, &cancel, total_start, &tx)
            .await;
        store.close().await;

        if let Err(e) = outcome {
            let _ = tx.send(StreamEvent::Error { error: e.to_string() }).await;
        }
    }

    async fn stream_dispatch(
        &self,
        question: &str,
        store: &Arc<dyn RelationalStore>,
        cancel: &CancelToken,
        total_start: Instant,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> EngineResult<()> {
        cancel.check()?;
        let classification = self.classify(question).await;
        cancel.check()?;

        let confident_simple = classification.label == QuestionLabel::Simple
            && classification.confidence >= self.config.confidence_threshold;

        // Resolve the final generation prompt through the same decision
        // logic as the one-shot path.
        let (prompt, retrieval_time) = if confident_simple {
            let sql_start = Instant::now();
            match self.try_text2sql(question, store, cancel).await? {
                SqlOutcome::Answered { rows, .. } => {
                    let retrieval_time = sql_start.elapsed().as_secs_f64();
                    (
                        self.converter.narration_prompt(question, &rows),
                        retrieval_time,
                    )
                }
                SqlOutcome::Exhausted { .. } => {
                    match self.rag_prompt(question, store, cancel).await? {
                        Some((p, t)) => (p, t),
                        None => {
                            return self
                                .emit_canned(tx, total_start.elapsed().as_secs_f64())
                                .await;
                        }
                    }
                }
            }
        } else {
            match self.rag_prompt(question, store, cancel).await? {
                Some((p, t)) => (p, t),
                None => {
                    return self
                        .emit_canned(tx, total_start.elapsed().as_secs_f64())
                        .await;
                }
            }
        };

        cancel.check()?;
        let mut tokens = self
            .generator
            .generate_stream(&prompt, &self.answer_options)
            .await
            .map_err(EngineError::Generation)?;

        // Timing goes out before the first token; generation time is not
        // known yet and is reported as zero.
        let _ = tx
            .send(StreamEvent::Timing {
                retrieval_time,
                generation_time: 0.0,
                total_time: total_start.elapsed().as_secs_f64(),
            })
            .await;

        while let Some(token) = tokens.next().await {
            if tx.send(StreamEvent::Token { token }).await.is_err() {
                // Consumer went away; the generator task will notice too.
                return Ok(());
            }
        }
        let _ = tx.send(StreamEvent::End).await;
        Ok(())
    }

    async fn rag_prompt(
        &self,
        question: &str,
        store: &Arc<dyn RelationalStore>,
        cancel: &CancelToken,
    ) -> EngineResult<Option<(String, f64)>> {
        let retrieval_start = Instant::now();
        let context = match self.retriever.retrieve(question, store, None).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Retrieval failed, treating as empty context");
                Vec::new()
            }
        };
        let retrieval_time = retrieval_start.elapsed().as_secs_f64();
        cancel.check()?;

        if context.is_empty() {
            return Ok(None);
        }
        Ok(Some((
            self.prompt_builder.build(question, &context),
            retrieval_time,
        )))
    }

    async fn emit_canned(&self, tx: &mpsc::Sender<StreamEvent>, total: f64) -> EngineResult<()> {
        let _ = tx
            .send(StreamEvent::Timing {
                retrieval_time: total,
                generation_time: 0.0,
                total_time: total,
            })
            .await;
        let _ = tx
            .send(StreamEvent::Token {
                token: self.config.no_information_message.clone(),
            })
            .await;
        let _ = tx.send(StreamEvent::End).await;
        Ok(())
    }
}

/// Event sequence produced by the streaming answer path.
pub struct AnswerStream {
    receiver: mpsc::Receiver<StreamEvent>,
}

impl AnswerStream {
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }
}

impl Stream for AnswerStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Text2SqlConfig;
    use crate::llm::TokenStream;
    use crate::relational::{
        CourseProfile, ExamProfile, ProfessorProfile, SqlValue,
    };
    use crate::types::{ContextChunk, ContextOrigin};
    use crate::vector::MetadataFilter;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    struct FakeClassifier {
        label: QuestionLabel,
        confidence: f32,
        fail: bool,
    }

    #[async_trait]
    impl QuestionClassifier for FakeClassifier {
        async fn classify(&self, _q: &str) -> Result<Classification> {
            if self.fail {
                return Err(anyhow!("model unavailable"));
            }
            Ok(Classification {
                label: self.label,
                confidence: self.confidence,
            })
        }
    }

    /// Pops scripted responses; errors once the script is exhausted.
    struct ScriptedGenerator {
        responses: Mutex<VecDeque<Result<String, String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedGenerator {
        fn new(responses: Vec<Result<String, String>>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next_response(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.lock().pop_front() {
                Some(Ok(s)) => Ok(s),
                Some(Err(e)) => Err(anyhow!(e)),
                None => Err(anyhow!("script exhausted")),
            }
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, _prompt: &str, _options: &GenerationOptions) -> Result<String> {
            self.next_response()
        }

        async fn generate_stream(
            &self,
            _prompt: &str,
            _options: &GenerationOptions,
        ) -> Result<TokenStream> {
            let text = self.next_response()?;
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for word in text.split_inclusive(' ') {
                    if tx.send(word.to_string()).await.is_err() {
                        return;
                    }
                }
            });
            Ok(TokenStream::new(rx))
        }
    }

    /// Relational store counting closes; `run_query` answers from a map
    /// of known statements.
    struct CountingStore {
        closes: Arc<AtomicUsize>,
        rollbacks: Arc<AtomicUsize>,
        known: Vec<(String, Vec<SqlRow>)>,
    }

    #[async_trait]
    impl RelationalStore for CountingStore {
        async fn get_schema(&self) -> Result<String> {
            Ok("TABLE corso (nome TEXT, cfu INTEGER)".to_string())
        }
        async fn run_query(&self, sql: &str) -> Result<Vec<SqlRow>> {
            for (known_sql, rows) in &self.known {
                if known_sql == sql {
                    return Ok(rows.clone());
                }
            }
            Err(anyhow!("no such table"))
        }
        async fn course_profile(&self, _pk: i64) -> Result<Option<CourseProfile>> {
            Ok(None)
        }
        async fn professor_profile(&self, _pk: i64) -> Result<Option<ProfessorProfile>> {
            Ok(None)
        }
        async fn exam_profile(&self, _pk: i64) -> Result<Option<ExamProfile>> {
            Ok(None)
        }
        async fn rollback(&self) {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingFactory {
        store: Arc<CountingStore>,
    }

    impl StoreFactory for CountingFactory {
        fn open(&self) -> Result<Arc<dyn RelationalStore>> {
            Ok(self.store.clone())
        }
    }

    struct FakeRetriever {
        chunks: Vec<ContextChunk>,
        fail: bool,
    }

    #[async_trait]
    impl Retriever for FakeRetriever {
        async fn retrieve(
            &self,
            _question: &str,
            _store: &Arc<dyn RelationalStore>,
            _filter: Option<&MetadataFilter>,
        ) -> Result<Vec<ContextChunk>> {
            if self.fail {
                return Err(anyhow!("vector store unreachable"));
            }
            Ok(self.chunks.clone())
        }
    }

    struct Harness {
        router: QueryRouter,
        generator: Arc<ScriptedGenerator>,
        closes: Arc<AtomicUsize>,
    }

    fn cfu_row() -> SqlRow {
        SqlRow {
            columns: vec!["cfu".to_string()],
            values: vec![SqlValue::Integer(6)],
        }
    }

    fn context_chunk() -> ContextChunk {
        ContextChunk {
            text: "Il corso 'Basi di Dati' vale 6 CFU.".to_string(),
            origin: ContextOrigin::Generated,
        }
    }

    fn harness(
        label: QuestionLabel,
        confidence: f32,
        responses: Vec<Result<String, String>>,
        known: Vec<(String, Vec<SqlRow>)>,
        chunks: Vec<ContextChunk>,
    ) -> Harness {
        let generator = Arc::new(ScriptedGenerator::new(responses));
        let closes = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(CountingStore {
            closes: closes.clone(),
            rollbacks: Arc::new(AtomicUsize::new(0)),
            known,
        });

        let router = QueryRouter::new(
            Arc::new(FakeClassifier {
                label,
                confidence,
                fail: false,
            }),
            Arc::new(SqlConverter::new(generator.clone(), Text2SqlConfig::default())),
            Arc::new(FakeRetriever {
                chunks,
                fail: false,
            }),
            generator.clone(),
            Arc::new(CountingFactory { store }),
            RouterConfig::default(),
            GenerationOptions::default(),
        );

        Harness {
            router,
            generator,
            closes,
        }
    }

    const QUESTION: &str = "Quanti crediti vale il corso di Basi di Dati?";
    const GOOD_SQL: &str = "SELECT cfu FROM corso WHERE nome = 'Basi di Dati';";

    #[tokio::test]
    async fn confident_simple_question_answered_via_sql() {
        let h = harness(
            QuestionLabel::Simple,
            0.9,
            vec![
                Ok(GOOD_SQL.to_string()),
                Ok("Il corso di Basi di Dati vale 6 CFU.".to_string()),
            ],
            vec![(GOOD_SQL.to_string(), vec![cfu_row()])],
            vec![context_chunk()],
        );

        let result = h.router.answer(QUESTION).await.unwrap();
        assert_eq!(result.chosen, RoutePath::TextToSql);
        assert_eq!(result.query.as_deref(), Some(GOOD_SQL));
        assert!(result.response.contains('6'));
        assert!(!result.fallback);
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn low_confidence_skips_sql_entirely() {
        let h = harness(
            QuestionLabel::Simple,
            0.4,
            vec![Ok("Risposta dal contesto.".to_string())],
            vec![(GOOD_SQL.to_string(), vec![cfu_row()])],
            vec![context_chunk()],
        );

        let result = h.router.answer(QUESTION).await.unwrap();
        assert_eq!(result.chosen, RoutePath::Rag);
        assert!(!result.fallback);
        // Raw prediction stays observable even when overridden.
        assert_eq!(result.ml_model, QuestionLabel::Simple);
        assert!((result.ml_confidence - 0.4).abs() < 1e-6);
        // Only the answer generation ran, never the SQL prompt.
        assert_eq!(h.generator.call_count(), 1);
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsafe_sql_exhausts_attempts_then_falls_back() {
        let h = harness(
            QuestionLabel::Simple,
            0.95,
            vec![
                Ok("DROP TABLE corso;".to_string()),
                Ok("DROP TABLE corso;".to_string()),
                Ok("Risposta dal contesto documentale.".to_string()),
            ],
            Vec::new(),
            vec![context_chunk()],
        );

        let result = h.router.answer(QUESTION).await.unwrap();
        assert_eq!(result.chosen, RoutePath::Rag);
        assert!(result.fallback);
        assert!(result.query.is_none());
        // Exactly two SQL generations plus one answer generation.
        assert_eq!(h.generator.call_count(), 3);
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sentinel_counts_as_failed_attempt() {
        let h = harness(
            QuestionLabel::Simple,
            0.9,
            vec![
                Ok("INVALID_QUERY".to_string()),
                Ok(GOOD_SQL.to_string()),
                Ok("Il corso vale 6 CFU.".to_string()),
            ],
            vec![(GOOD_SQL.to_string(), vec![cfu_row()])],
            vec![context_chunk()],
        );

        let result = h.router.answer(QUESTION).await.unwrap();
        assert_eq!(result.chosen, RoutePath::TextToSql);
        assert_eq!(h.generator.call_count(), 3);
    }

    #[tokio::test]
    async fn empty_rows_trigger_fresh_generation() {
        let empty_sql = "SELECT cfu FROM corso WHERE nome = 'Inesistente';";
        let h = harness(
            QuestionLabel::Simple,
            0.9,
            vec![
                Ok(empty_sql.to_string()),
                Ok(GOOD_SQL.to_string()),
                Ok("Il corso vale 6 CFU.".to_string()),
            ],
            vec![
                (empty_sql.to_string(), Vec::new()),
                (GOOD_SQL.to_string(), vec![cfu_row()]),
            ],
            vec![context_chunk()],
        );

        let result = h.router.answer(QUESTION).await.unwrap();
        assert_eq!(result.chosen, RoutePath::TextToSql);
        assert_eq!(result.query.as_deref(), Some(GOOD_SQL));
    }

    #[tokio::test]
    async fn execution_error_rolls_back_and_retries() {
        let bad_sql = "SELECT cfu FROM tabella_sbagliata;";
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Ok(bad_sql.to_string()),
            Ok(GOOD_SQL.to_string()),
            Ok("Il corso vale 6 CFU.".to_string()),
        ]));
        let closes = Arc::new(AtomicUsize::new(0));
        let rollbacks = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(CountingStore {
            closes: closes.clone(),
            rollbacks: rollbacks.clone(),
            known: vec![(GOOD_SQL.to_string(), vec![cfu_row()])],
        });
        let router = QueryRouter::new(
            Arc::new(FakeClassifier {
                label: QuestionLabel::Simple,
                confidence: 0.9,
                fail: false,
            }),
            Arc::new(SqlConverter::new(generator.clone(), Text2SqlConfig::default())),
            Arc::new(FakeRetriever {
                chunks: vec![context_chunk()],
                fail: false,
            }),
            generator,
            Arc::new(CountingFactory { store }),
            RouterConfig::default(),
            GenerationOptions::default(),
        );

        let result = router.answer(QUESTION).await.unwrap();
        assert_eq!(result.chosen, RoutePath::TextToSql);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn classifier_failure_defaults_to_rag() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Ok(
            "Risposta dal contesto.".to_string()
        )]));
        let closes = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(CountingStore {
            closes: closes.clone(),
            rollbacks: Arc::new(AtomicUsize::new(0)),
            known: Vec::new(),
        });
        let router = QueryRouter::new(
            Arc::new(FakeClassifier {
                label: QuestionLabel::Simple,
                confidence: 0.99,
                fail: true,
            }),
            Arc::new(SqlConverter::new(generator.clone(), Text2SqlConfig::default())),
            Arc::new(FakeRetriever {
                chunks: vec![context_chunk()],
                fail: false,
            }),
            generator,
            Arc::new(CountingFactory { store }),
            RouterConfig::default(),
            GenerationOptions::default(),
        );

        let result = router.answer(QUESTION).await.unwrap();
        assert_eq!(result.chosen, RoutePath::Rag);
        assert_eq!(result.ml_model, QuestionLabel::Complex);
        assert_eq!(result.ml_confidence, 0.0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_context_yields_canned_answer() {
        let h = harness(
            QuestionLabel::Complex,
            0.9,
            vec![Ok("mai usato".to_string())],
            Vec::new(),
            Vec::new(),
        );

        let result = h.router.answer(QUESTION).await.unwrap();
        assert_eq!(result.chosen, RoutePath::Rag);
        assert_eq!(
            result.response,
            RouterConfig::default().no_information_message
        );
        assert_eq!(result.timings.generation_time, 0.0);
        assert_eq!(result.context_used, 0);
        // Generator never invoked on the canned path.
        assert_eq!(h.generator.call_count(), 0);
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retrieval_failure_degrades_to_canned_answer() {
        let generator = Arc::new(ScriptedGenerator::new(Vec::new()));
        let closes = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(CountingStore {
            closes: closes.clone(),
            rollbacks: Arc::new(AtomicUsize::new(0)),
            known: Vec::new(),
        });
        let router = QueryRouter::new(
            Arc::new(FakeClassifier {
                label: QuestionLabel::Complex,
                confidence: 0.9,
                fail: false,
            }),
            Arc::new(SqlConverter::new(generator.clone(), Text2SqlConfig::default())),
            Arc::new(FakeRetriever {
                chunks: Vec::new(),
                fail: true,
            }),
            generator,
            Arc::new(CountingFactory { store }),
            RouterConfig::default(),
            GenerationOptions::default(),
        );

        let result = router.answer(QUESTION).await.unwrap();
        assert_eq!(
            result.response,
            RouterConfig::default().no_information_message
        );
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn generation_error_still_closes_connection() {
        let h = harness(
            QuestionLabel::Complex,
            0.9,
            vec![Err("endpoint down".to_string())],
            Vec::new(),
            vec![context_chunk()],
        );

        let result = h.router.answer(QUESTION).await;
        assert!(matches!(result, Err(EngineError::Generation(_))));
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_request_closes_connection() {
        let h = harness(
            QuestionLabel::Simple,
            0.9,
            vec![Ok(GOOD_SQL.to_string())],
            vec![(GOOD_SQL.to_string(), vec![cfu_row()])],
            vec![context_chunk()],
        );

        let cancel = CancelToken::new();
        cancel.cancel();
        let result = h.router.answer_with_cancel(QUESTION, &cancel).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.generator.call_count(), 0);
    }

    #[tokio::test]
    async fn stream_emits_timing_tokens_end() {
        let h = harness(
            QuestionLabel::Complex,
            0.9,
            vec![Ok("Il corso vale 6 CFU.".to_string())],
            Vec::new(),
            vec![context_chunk()],
        );

        let mut stream = h.router.answer_stream(QUESTION);
        let first = stream.next().await.unwrap();
        assert!(matches!(first, StreamEvent::Timing { .. }));

        let mut text = String::new();
        let mut saw_end = false;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Token { token } => text.push_str(&token),
                StreamEvent::End => {
                    saw_end = true;
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(saw_end);
        assert_eq!(text, "Il corso vale 6 CFU.");
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stream_with_empty_context_sends_canned_token() {
        let h = harness(
            QuestionLabel::Complex,
            0.9,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );

        let mut stream = h.router.answer_stream(QUESTION);
        let events: Vec<StreamEvent> = {
            let mut v = Vec::new();
            while let Some(e) = stream.next().await {
                v.push(e);
            }
            v
        };
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], StreamEvent::Timing { .. }));
        match &events[1] {
            StreamEvent::Token { token } => {
                assert_eq!(token, &RouterConfig::default().no_information_message)
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(events[2], StreamEvent::End));
    }

    #[tokio::test]
    async fn stream_generation_error_emits_error_event() {
        let h = harness(
            QuestionLabel::Complex,
            0.9,
            vec![Err("endpoint down".to_string())],
            Vec::new(),
            vec![context_chunk()],
        );

        let mut stream = h.router.answer_stream(QUESTION);
        let first = stream.next().await.unwrap();
        assert!(matches!(first, StreamEvent::Error { .. }));
        // Error message stays generic, never the provider's text.
        if let StreamEvent::Error { error } = first {
            assert!(!error.contains("endpoint down"));
        }
    }
}
