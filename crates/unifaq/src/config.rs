use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    pub router: RouterConfig,
    pub retrieval: RetrievalConfig,
    pub text2sql: Text2SqlConfig,
    pub generation: GenerationEndpointConfig,
    pub embedding: EmbeddingEndpointConfig,
    pub vector_store: VectorStoreConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Below this classifier confidence the question is routed to RAG
    /// regardless of the predicted label.
    pub confidence_threshold: f32,
    /// Maximum NL→SQL generation attempts before falling back to RAG.
    pub max_sql_attempts: u32,
    /// Canned answer used when retrieval produces no context at all.
    pub no_information_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Candidates requested from each vector-store namespace.
    pub per_namespace_top_k: usize,
    /// Final chunk count after reranking.
    pub rerank_top_k: usize,
    /// Running word budget for the assembled context.
    pub max_context_words: usize,
    /// Hard cap on selected chunks, independent of the word budget.
    pub max_context_chunks: usize,
    /// Candidates shorter than this (normalized) are dropped as noise.
    pub min_chunk_chars: usize,
    /// Blend weight of the lexical rerank score against the boosted
    /// vector score (0.0 = vector only, 1.0 = lexical only).
    pub rerank_alpha: f32,
    pub boosts: BoostConfig,
}

/// Keyword lists driving the namespace prior. Configuration data, not
/// logic: swapping the lists changes the heuristic without code changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostConfig {
    /// Cues that the question targets regulations/documents.
    pub document_keywords: Vec<String>,
    /// Cues that the question targets structured course data.
    pub database_keywords: Vec<String>,
    /// Multiplier applied when a namespace matches the question's cues.
    pub boost_factor: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Text2SqlConfig {
    /// Literal the generator must return when a question is untranslatable.
    pub sentinel: String,
    /// Include few-shot NL→SQL examples in the prompt.
    pub few_shot_examples: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationEndpointConfig {
    /// OpenAI-compatible chat completions endpoint.
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingEndpointConfig {
    /// OpenAI-compatible embeddings endpoint.
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub dimension: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    pub endpoint: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file with the course/professor/exam tables.
    pub path: std::path::PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub max_turns_per_conversation: usize,
    pub ttl_secs: u64,
}

impl EngineConfig {
    /// Validate config values, returning errors for clearly broken
    /// configurations.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.router.confidence_threshold) {
            return Err("router.confidence_threshold must be in [0.0, 1.0]".into());
        }
        if self.router.max_sql_attempts == 0 {
            return Err("router.max_sql_attempts must be > 0".into());
        }
        if self.retrieval.per_namespace_top_k == 0 {
            return Err("retrieval.per_namespace_top_k must be > 0".into());
        }
        if self.retrieval.rerank_top_k == 0 {
            return Err("retrieval.rerank_top_k must be > 0".into());
        }
        if self.retrieval.max_context_chunks < self.retrieval.rerank_top_k {
            return Err("retrieval.max_context_chunks must be >= rerank_top_k".into());
        }
        if !(0.0..=1.0).contains(&self.retrieval.rerank_alpha) {
            return Err("retrieval.rerank_alpha must be in [0.0, 1.0]".into());
        }
        if self.retrieval.boosts.boost_factor < 1.0 {
            return Err("retrieval.boosts.boost_factor must be >= 1.0".into());
        }
        if self.text2sql.sentinel.trim().is_empty() {
            return Err("text2sql.sentinel must not be empty".into());
        }
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            max_sql_attempts: 2,
            no_information_message:
                "Mi dispiace, non ho trovato informazioni pertinenti alla tua domanda."
                    .to_string(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            per_namespace_top_k: 40,
            rerank_top_k: 5,
            max_context_words: 1200,
            max_context_chunks: 5,
            min_chunk_chars: 25,
            rerank_alpha: 0.5,
            boosts: BoostConfig::default(),
        }
    }
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            document_keywords: [
                "regolamento",
                "scadenze",
                "scadenza",
                "bando",
                "procedura",
                "iscrizione",
                "immatricolazione",
                "tasse",
                "borsa di studio",
                "erasmus",
                "tirocinio",
                "laurea",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            database_keywords: [
                "elenca",
                "quali corsi",
                "quanti",
                "cfu",
                "crediti",
                "docente",
                "professore",
                "orario",
                "aula",
                "esame",
                "semestre",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            boost_factor: 1.3,
        }
    }
}

impl Default for Text2SqlConfig {
    fn default() -> Self {
        Self {
            sentinel: "INVALID_QUERY".to_string(),
            few_shot_examples: true,
        }
    }
}

impl Default for GenerationEndpointConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/v1/chat/completions".to_string(),
            model: "gemma2:9b".to_string(),
            api_key: String::new(),
            max_tokens: 1024,
            temperature: 0.2,
            connect_timeout_secs: 15,
            request_timeout_secs: 300,
        }
    }
}

impl Default for EmbeddingEndpointConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/v1/embeddings".to_string(),
            model: "nomic-embed-text".to_string(),
            api_key: String::new(),
            dimension: 768,
        }
    }
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:6333/query".to_string(),
            api_key: String::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: std::path::PathBuf::from("./data/ateneo.db"),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl_secs: 600,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_turns_per_conversation: 20,
            ttl_secs: 1800,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_attempts() {
        let mut config = EngineConfig::default();
        config.router.max_sql_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut config = EngineConfig::default();
        config.router.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_boost_below_one() {
        let mut config = EngineConfig::default();
        config.retrieval.boosts.boost_factor = 0.8;
        assert!(config.validate().is_err());
    }
}
