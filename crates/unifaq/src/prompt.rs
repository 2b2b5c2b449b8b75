//! Prompt assembly for the answer generator. Formats only: the retriever
//! already decided and budgeted the context, nothing is truncated here.

use crate::types::ContextChunk;

const SYSTEM_PREAMBLE: &str = "\
Sei l'assistente virtuale della segreteria didattica di un ateneo.\n\
Rispondi sempre in italiano, con un tono cordiale e professionale.\n\
Regole:\n\
- Basa la risposta ESCLUSIVAMENTE sulle fonti riportate sotto.\n\
- Se le fonti non contengono l'informazione richiesta, dillo chiaramente; \
non inventare mai dati, date o riferimenti normativi.\n\
- Cita la fonte tra parentesi quando riporti un dato puntuale.\n\
- Mantieni la risposta concisa e ben strutturata.";

#[derive(Debug, Clone, Default)]
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Assemble the full generation prompt: preamble, enumerated and
    /// attributed context blocks, then the question.
    pub fn build(&self, question: &str, context: &[ContextChunk]) -> String {
        let mut prompt = String::from(SYSTEM_PREAMBLE);
        prompt.push_str("\n\nFonti:\n");

        for (i, chunk) in context.iter().enumerate() {
            prompt.push_str(&format!(
                "[{}] ({})\n{}\n\n",
                i + 1,
                chunk.origin.label(),
                chunk.text.trim()
            ));
        }

        prompt.push_str(&format!("Domanda: {question}\nRisposta: "));
        prompt
    }
}
