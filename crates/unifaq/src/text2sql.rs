//! Text-to-SQL conversion: schema-aware prompt construction, response
//! cleaning, safety validation, and row narration. Retry policy lives in
//! the router, not here.

use anyhow::Result;
use regex::Regex;
use std::sync::{Arc, LazyLock};

use crate::config::Text2SqlConfig;
use crate::llm::{GenerationOptions, Generator};
use crate::relational::SqlRow;

/// Write-or-DDL keywords that disqualify a statement outright, wherever
/// they appear (comments included — a validator that parses comments is a
/// validator that can be confused by them).
static FORBIDDEN_KEYWORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|ATTACH|DETACH|PRAGMA|REPLACE|TRUNCATE|GRANT|REVOKE|VACUUM|REINDEX)\b",
    )
    .expect("keyword regex is valid")
});

static LABEL_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(sql|query)\s*:\s*").expect("prefix regex is valid"));

/// Deterministic NL→SQL prompt embedding the live schema. Pure function.
pub fn create_prompt(question: &str, schema: &str, config: &Text2SqlConfig) -> String {
    let mut prompt = format!(
        "Sei un traduttore da linguaggio naturale a SQL per il database di un ateneo.\n\
         Schema del database:\n{schema}\n\
         Regole:\n\
         - Genera UNA sola istruzione SELECT. Mai INSERT, UPDATE, DELETE, DROP, ALTER o CREATE.\n\
         - Usa esattamente i nomi di tabelle e colonne dello schema.\n\
         - Se la domanda non è traducibile in SQL, rispondi con la parola {sentinel}.\n\
         - Rispondi solo con l'istruzione SQL, senza spiegazioni.\n",
        schema = schema.trim_end(),
        sentinel = config.sentinel,
    );

    if config.few_shot_examples {
        prompt.push_str(
            "\nEsempi:\n\
             Domanda: Quanti CFU vale il corso di Analisi 1?\n\
             SQL: SELECT cfu FROM corso WHERE nome = 'Analisi 1';\n\
             Domanda: Chi insegna Sistemi Operativi?\n\
             SQL: SELECT d.nome, d.cognome FROM docente d JOIN corso c ON c.docente_id = d.id WHERE c.nome = 'Sistemi Operativi';\n\
             Domanda: Qual è il senso della vita?\n\
             SQL: ",
        );
        prompt.push_str(&config.sentinel);
        prompt.push('\n');
    }

    prompt.push_str(&format!("\nDomanda: {question}\nSQL: "));
    prompt
}

/// Strip code fences and label prefixes from raw generator output. If the
/// sentinel appears anywhere, the sentinel alone is returned; otherwise
/// the statement is semicolon-terminated. Idempotent.
pub fn clean_sql_response(raw: &str, sentinel: &str) -> String {
    let mut cleaned = raw.trim();
    cleaned = cleaned
        .trim_start_matches("```sql")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if cleaned.contains(sentinel) {
        return sentinel.to_string();
    }

    let without_label = LABEL_PREFIX_RE.replace(cleaned, "");
    let mut sql = without_label.trim().to_string();
    if !sql.is_empty() && !sql.ends_with(';') {
        sql.push(';');
    }
    sql
}

/// Last line of defense before execution: accept only a single pure
/// SELECT. Anything ambiguous is rejected.
pub fn is_sql_safe(sql: &str) -> bool {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return false;
    }

    if FORBIDDEN_KEYWORD_RE.is_match(trimmed) {
        return false;
    }

    // A single statement: at most one semicolon, and only at the end.
    let without_trailing = trimmed.strip_suffix(';').unwrap_or(trimmed);
    if without_trailing.contains(';') {
        return false;
    }

    // Must be a SELECT even after leading comments.
    let body = strip_leading_comments(without_trailing);
    let upper = body.trim_start().to_uppercase();
    upper.starts_with("SELECT") || upper.starts_with("WITH")
}

fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = match after.find('\n') {
                Some(i) => after[i + 1..].trim_start(),
                None => "",
            };
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = match after.find("*/") {
                Some(i) => after[i + 2..].trim_start(),
                None => "",
            };
        } else {
            return rest;
        }
    }
}

/// Bridges the generator and the SQL helpers; owns no retry logic.
pub struct SqlConverter {
    generator: Arc<dyn Generator>,
    config: Text2SqlConfig,
    options: GenerationOptions,
}

impl SqlConverter {
    pub fn new(generator: Arc<dyn Generator>, config: Text2SqlConfig) -> Self {
        let options = GenerationOptions {
            max_tokens: 256,
            temperature: 0.0,
            stop: Vec::new(),
        };
        Self {
            generator,
            config,
            options,
        }
    }

    pub fn sentinel(&self) -> &str {
        &self.config.sentinel
    }

    pub fn prompt_for(&self, question: &str, schema: &str) -> String {
        create_prompt(question, schema, &self.config)
    }

    /// One generator call. Retries are the router's responsibility.
    pub async fn query_llm(&self, prompt: &str) -> Result<String> {
        self.generator.generate(prompt, &self.options).await
    }

    pub fn clean(&self, raw: &str) -> String {
        clean_sql_response(raw, &self.config.sentinel)
    }

    /// Prompt for narrating result rows back into prose, grounded only in
    /// the rows. Used by both the one-shot and streaming answer paths.
    pub fn narration_prompt(&self, question: &str, rows: &[SqlRow]) -> String {
        let rendered = rows
            .iter()
            .map(|r| r.to_pairs())
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Domanda dello studente: {question}\n\
             Risultato della query sul database di ateneo:\n{rendered}\n\n\
             Rispondi in italiano, in modo conciso, basandoti esclusivamente \
             sui dati riportati sopra. Non aggiungere informazioni non presenti."
        )
    }

    pub async fn narrate_rows(&self, question: &str, rows: &[SqlRow]) -> Result<String> {
        let prompt = self.narration_prompt(question, rows);
        let options = GenerationOptions {
            max_tokens: 512,
            temperature: 0.2,
            stop: Vec::new(),
        };
        self.generator.generate(&prompt, &options).await
    }
}
