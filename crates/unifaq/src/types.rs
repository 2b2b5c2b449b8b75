use serde::{Deserialize, Serialize};

/// Binary outcome of the question classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionLabel {
    /// Answerable with a single structured lookup (Text-to-SQL candidate).
    Simple,
    /// Needs document retrieval and synthesis.
    Complex,
}

impl std::fmt::Display for QuestionLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuestionLabel::Simple => write!(f, "simple"),
            QuestionLabel::Complex => write!(f, "complex"),
        }
    }
}

/// Classifier prediction: label plus the maximum class probability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Classification {
    pub label: QuestionLabel,
    pub confidence: f32,
}

/// Logical partition within the vector store, identifying candidate origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Exported relational rows (courses, professors, exams).
    CourseRows,
    /// Chunks extracted from PDF regulations and guides.
    Pdf,
    /// Generated FAQ documents.
    Generated,
    /// Stored web-search exports.
    WebSearch,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::CourseRows => "course_rows",
            Namespace::Pdf => "pdf",
            Namespace::Generated => "generated",
            Namespace::WebSearch => "web_search",
        }
    }

    /// True when the namespace content is prose documents rather than
    /// exported structured rows.
    pub fn is_document(&self) -> bool {
        !matches!(self, Namespace::CourseRows)
    }
}

/// Metadata attached to a vector match. Structured-row candidates carry
/// `table_name` + `primary_key` so they can be resolved against the
/// relational store; document candidates carry file/page/section info.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

/// One vector-store match, scored and namespaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub id: String,
    pub namespace: Namespace,
    /// Similarity score as returned by the vector store.
    pub raw_score: f32,
    /// Combined score after namespace boosting and lexical reranking.
    pub rerank_score: f32,
    pub metadata: CandidateMetadata,
    pub text: String,
}

/// Where a context chunk came from, for prompt attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContextOrigin {
    Database { table: String },
    Document { file: String, page: Option<u32> },
    Generated,
    Web,
}

impl ContextOrigin {
    pub fn label(&self) -> String {
        match self {
            ContextOrigin::Database { table } => format!("banca dati, tabella '{table}'"),
            ContextOrigin::Document { file, page: Some(p) } => {
                format!("documento '{file}', pagina {p}")
            }
            ContextOrigin::Document { file, page: None } => format!("documento '{file}'"),
            ContextOrigin::Generated => "documento informativo generato".to_string(),
            ContextOrigin::Web => "fonte web".to_string(),
        }
    }
}

/// A budgeted, attributed piece of context ready for prompt assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextChunk {
    pub text: String,
    pub origin: ContextOrigin,
}

/// Which pipeline produced the final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutePath {
    #[serde(rename = "T2SQL")]
    TextToSql,
    #[serde(rename = "RAG")]
    Rag,
}

/// Per-request timing breakdown, in seconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Timings {
    pub retrieval_time: f64,
    pub generation_time: f64,
    pub total_time: f64,
}

/// Terminal artifact of one router invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterResult {
    pub response: String,
    pub chosen: RoutePath,
    /// Raw classifier prediction, reported even when the confidence
    /// threshold overrode the path.
    pub ml_model: QuestionLabel,
    pub ml_confidence: f32,
    /// The executed SQL statement, present only on the Text-to-SQL path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// True when the Text-to-SQL path was attempted and exhausted before
    /// answering via retrieval.
    pub fallback: bool,
    #[serde(flatten)]
    pub timings: Timings,
    /// Number of context chunks handed to the generator (0 on T2SQL).
    pub context_used: usize,
}

/// Event emitted on the streaming answer path. Wire order: one `timing`,
/// zero or more `token`, one `end`; an `error` replaces any further events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Timing {
        retrieval_time: f64,
        generation_time: f64,
        total_time: f64,
    },
    Token {
        token: String,
    },
    End,
    Error {
        error: String,
    },
}
