//! University FAQ answering engine: questions are classified and routed
//! between a Text-to-SQL path over the course database and a hybrid
//! retrieval-augmented path over indexed documents, with confidence
//! gating and bounded fallback between the two.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod memory;
pub mod prompt;
pub mod relational;
pub mod retrieval;
pub mod router;
pub mod text2sql;
pub mod types;
pub mod vector;

// Re-export the primary surface for convenience.
pub use cache::ResponseCache;
pub use classifier::{LexicalClassifier, QuestionClassifier};
pub use config::EngineConfig;
pub use embedding::{EmbeddingModel, RemoteEmbedder};
pub use error::{EngineError, EngineResult};
pub use llm::{GenerationOptions, Generator, OpenAiCompatGenerator, TokenStream};
pub use memory::ConversationMemory;
pub use prompt::PromptBuilder;
pub use relational::{RelationalStore, SqliteStore, SqliteStoreFactory, StoreFactory};
pub use retrieval::{HybridRetriever, Retriever};
pub use router::{AnswerStream, CancelToken, QueryRouter};
pub use text2sql::SqlConverter;
pub use types::{
    Classification, ContextChunk, Namespace, QuestionLabel, RoutePath, RouterResult, StreamEvent,
};
pub use vector::{RemoteVectorStore, VectorStore};
