//! Question classifier: predicts whether a question is a structured
//! lookup ("simple") or needs document retrieval ("complex"), with a
//! confidence the router gates on.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::embedding::{cosine_similarity, EmbeddingModel};
use crate::types::{Classification, QuestionLabel};

#[async_trait]
pub trait QuestionClassifier: Send + Sync {
    async fn classify(&self, question: &str) -> Result<Classification>;
}

/// Cues that the question targets exported course/professor/exam rows.
const SIMPLE_CUES: &[&str] = &[
    "quanti",
    "quante",
    "quale",
    "quali",
    "elenca",
    "elencami",
    "cfu",
    "crediti",
    "docente",
    "professore",
    "chi insegna",
    "chi tiene",
    "orario",
    "aula",
    "semestre",
    "quando",
];

/// Cues that the question needs regulations, procedures or synthesis.
const COMPLEX_CUES: &[&str] = &[
    "come",
    "perché",
    "perche",
    "procedura",
    "regolamento",
    "scadenz",
    "requisiti",
    "posso",
    "devo",
    "spiega",
    "spiegami",
    "differenza",
    "immatricolazione",
    "iscrizione",
    "tasse",
    "borsa di studio",
    "erasmus",
    "tirocinio",
];

/// Optional embedding prior: centroids of labeled example questions.
pub struct ClassPrototypes {
    pub embedder: Arc<dyn EmbeddingModel>,
    pub simple_centroid: Vec<f32>,
    pub complex_centroid: Vec<f32>,
    /// Contribution of the centroid margin to the decision score.
    pub weight: f32,
}

/// Hand-crafted lexical features squashed through a logistic function,
/// optionally blended with an embedding-prototype margin. Positive score
/// means "simple".
pub struct LexicalClassifier {
    cue_weight: f32,
    short_question_bonus: f32,
    prototypes: Option<ClassPrototypes>,
}

impl Default for LexicalClassifier {
    fn default() -> Self {
        Self {
            cue_weight: 0.9,
            short_question_bonus: 0.3,
            prototypes: None,
        }
    }
}

impl LexicalClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prototypes(mut self, prototypes: ClassPrototypes) -> Self {
        self.prototypes = Some(prototypes);
        self
    }

    fn lexical_score(&self, question: &str) -> f32 {
        let lower = question.to_lowercase();
        let simple_hits = SIMPLE_CUES.iter().filter(|c| lower.contains(*c)).count() as f32;
        let complex_hits = COMPLEX_CUES.iter().filter(|c| lower.contains(*c)).count() as f32;

        let mut score = self.cue_weight * (simple_hits - complex_hits);
        if lower.split_whitespace().count() <= 10 {
            score += self.short_question_bonus;
        }
        score
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[async_trait]
impl QuestionClassifier for LexicalClassifier {
    async fn classify(&self, question: &str) -> Result<Classification> {
        let mut score = self.lexical_score(question);

        if let Some(prototypes) = &self.prototypes {
            match prototypes.embedder.embed_query(question).await {
                Ok(vector) => {
                    let margin = cosine_similarity(&vector, &prototypes.simple_centroid)
                        - cosine_similarity(&vector, &prototypes.complex_centroid);
                    score += prototypes.weight * margin;
                }
                Err(e) => {
                    // Lexical features alone still produce a usable answer.
                    tracing::warn!(error = %e, "Embedding prior unavailable, using lexical features only");
                }
            }
        }

        let p_simple = sigmoid(score);
        let label = if p_simple >= 0.5 {
            QuestionLabel::Simple
        } else {
            QuestionLabel::Complex
        };
        let confidence = p_simple.max(1.0 - p_simple);

        tracing::debug!(
            question = question,
            score = score,
            label = %label,
            confidence = confidence,
            "Question classified"
        );

        Ok(Classification { label, confidence })
    }
}
