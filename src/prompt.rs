//! RAG prompt assembly.

/// Build the generation prompt from retrieved context and the user's
/// question. The assistant is constrained to the provided context.
pub fn build_prompt(context: &[String], question: &str) -> String {
    let context_text = context.join("\n");

    format!(
        "You are a customer support assistant.\n\
         Answer ONLY using the provided context.\n\
         If the answer is not in the context, say you don't know.\n\
         \n\
         Context:\n\
         {}\n\
         \n\
         Question:\n\
         {}\n\
         \n\
         Answer:",
        context_text, question
    )
}
