//! Prompt assembly.
//!
//! Folds retrieved chunks into a numbered reference section ahead of the
//! user's question, with instructions to cite references by number and to
//! say so when none of them answer the question. Assembly is deterministic:
//! the same inputs produce byte-identical output.

use crate::models::RetrievalResult;

const INSTRUCTIONS: &str = "You are a helpful assistant. Answer the question using the \
numbered references below. Cite references by their number, like [1]. If no reference \
is relevant to the question, say so explicitly before answering from general knowledge.";

pub struct PromptAssembler {
    /// Character budget for the whole assembled prompt.
    budget_chars: usize,
}

impl PromptAssembler {
    pub fn new(budget_chars: usize) -> Self {
        Self { budget_chars }
    }

    /// Assemble the final prompt from the (already ranked) context chunks
    /// and the user's question.
    ///
    /// When the full assembly exceeds the character budget, the
    /// lowest-ranked chunks are dropped one at a time until it fits. The
    /// question itself is never truncated; with zero chunks remaining the
    /// prompt may still exceed the budget and is passed through as-is.
    pub fn assemble(&self, context: &[RetrievalResult], question: &str) -> String {
        let mut kept = context.len();
        loop {
            let prompt = render(&context[..kept], question);
            if prompt.chars().count() <= self.budget_chars || kept == 0 {
                return prompt;
            }
            kept -= 1;
        }
    }
}

fn render(context: &[RetrievalResult], question: &str) -> String {
    let mut prompt = String::new();

    if context.is_empty() {
        prompt.push_str(
            "You are a helpful assistant. No reference material was found for this \
question; answer from general knowledge and say that no local references were available.",
        );
    } else {
        prompt.push_str(INSTRUCTIONS);
        prompt.push_str("\n\nReferences:\n");
        for (i, chunk) in context.iter().enumerate() {
            prompt.push_str(&format!("[{}] {}\n", i + 1, chunk.text.trim()));
        }
    }

    prompt.push_str("\nQuestion: ");
    prompt.push_str(question);
    prompt.push_str("\nAnswer:");
    prompt
}
