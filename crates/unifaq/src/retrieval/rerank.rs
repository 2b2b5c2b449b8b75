//! Lexical BM25 reranking over the retrieved candidate set. The corpus is
//! tiny (tens of chunks), so document statistics are built per query.

pub const K1: f32 = 1.2;
pub const B: f32 = 0.75;

pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// BM25 scorer over a fixed candidate set.
pub struct Bm25Scorer {
    docs: Vec<Vec<String>>,
    avg_len: f32,
}

impl Bm25Scorer {
    pub fn new(texts: &[&str]) -> Self {
        let docs: Vec<Vec<String>> = texts.iter().map(|t| tokenize(t)).collect();
        let total: usize = docs.iter().map(|d| d.len()).sum();
        let avg_len = if docs.is_empty() {
            0.0
        } else {
            total as f32 / docs.len() as f32
        };
        Self { docs, avg_len }
    }

    fn idf(&self, term: &str) -> f32 {
        let df = self
            .docs
            .iter()
            .filter(|d| d.iter().any(|t| t == term))
            .count() as f32;
        let n = self.docs.len() as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// BM25 score of each candidate document for the query, in input order.
    pub fn score_all(&self, query: &str) -> Vec<f32> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || self.docs.is_empty() {
            return vec![0.0; self.docs.len()];
        }

        let idfs: Vec<(String, f32)> = query_terms
            .iter()
            .map(|t| (t.clone(), self.idf(t)))
            .collect();

        self.docs
            .iter()
            .map(|doc| {
                let len_norm = if self.avg_len > 0.0 {
                    1.0 - B + B * (doc.len() as f32 / self.avg_len)
                } else {
                    1.0
                };
                idfs.iter()
                    .map(|(term, idf)| {
                        let tf = doc.iter().filter(|t| *t == term).count() as f32;
                        if tf == 0.0 {
                            0.0
                        } else {
                            idf * (tf * (K1 + 1.0)) / (tf + K1 * len_norm)
                        }
                    })
                    .sum()
            })
            .collect()
    }
}

/// Min-max normalize scores into [0, 1]. Uniform scores map to 0.5 so the
/// blend with the other signal stays meaningful.
pub fn normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let max = scores.iter().copied().fold(f32::MIN, f32::max);
    let min = scores.iter().copied().fold(f32::MAX, f32::min);
    if (max - min).abs() < 1e-9 {
        return vec![0.5; scores.len()];
    }
    let range = max - min;
    scores.iter().map(|s| (s - min) / range).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_document_outranks_unrelated_one() {
        let docs = [
            "Il corso di Basi di Dati vale 6 CFU",
            "La mensa universitaria apre alle 12",
            "Regolamento per la prova finale di laurea",
        ];
        let scorer = Bm25Scorer::new(&docs);
        let scores = scorer.score_all("quanti CFU vale Basi di Dati");
        assert!(scores[0] > scores[1]);
        assert!(scores[0] > scores[2]);
    }

    #[test]
    fn no_overlap_scores_zero() {
        let scorer = Bm25Scorer::new(&["aaa bbb ccc"]);
        let scores = scorer.score_all("xyz");
        assert_eq!(scores, vec![0.0]);
    }

    #[test]
    fn empty_inputs_are_harmless() {
        let scorer = Bm25Scorer::new(&[]);
        assert!(scorer.score_all("ciao").is_empty());
        let scorer = Bm25Scorer::new(&["testo"]);
        assert_eq!(scorer.score_all(""), vec![0.0]);
    }

    #[test]
    fn normalize_maps_to_unit_interval() {
        let normalized = normalize(&[2.0, 4.0, 6.0]);
        assert_eq!(normalized, vec![0.0, 0.5, 1.0]);
        assert_eq!(normalize(&[3.0, 3.0]), vec![0.5, 0.5]);
        assert!(normalize(&[]).is_empty());
    }

    #[test]
    fn tokenize_strips_punctuation_and_case() {
        assert_eq!(
            tokenize("Quanti CFU vale, il corso?"),
            vec!["quanti", "cfu", "vale", "il", "corso"]
        );
    }
}
