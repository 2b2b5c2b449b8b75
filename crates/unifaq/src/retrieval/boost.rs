//! Namespace boosting: a heuristic prior nudging namespaces whose content
//! type matches lexical cues in the question. Never a hard filter — every
//! namespace stays eligible.

use crate::config::BoostConfig;
use crate::types::Namespace;

/// Multiplier in `1.0..=config.boost_factor` for this namespace given the
/// question. Pure function; the keyword lists are configuration data.
pub fn boost(question: &str, namespace: Namespace, config: &BoostConfig) -> f32 {
    let lower = question.to_lowercase();

    let cues = if namespace.is_document() {
        &config.document_keywords
    } else {
        &config.database_keywords
    };

    if cues.iter().any(|kw| lower.contains(kw.as_str())) {
        config.boost_factor
    } else {
        1.0
    }
}
