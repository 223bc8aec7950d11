//! System prompt and prompt assembly

use super::context::ConversationMemory;

/// Default system prompt for the voice assistant
pub const SYSTEM_PROMPT: &str = r#"You are {name}, an AI voice assistant. Your replies are spoken aloud. Guidelines:
1. Be concise and direct (1-2 sentences preferred)
2. Respond naturally and conversationally
3. Do not use markdown, lists, code blocks or URLs
4. Focus on the core information requested"#;

/// System prompt with the assistant's name filled in
pub fn build_system_prompt(assistant_name: &str) -> String {
    SYSTEM_PROMPT.replace("{name}", assistant_name)
}

/// Prompt = system template + remembered turns (oldest first) + new input
pub fn build_prompt(system: &str, memory: &ConversationMemory, user_text: &str) -> String {
    let mut prompt = String::with_capacity(system.len() + 64 * (memory.len() + 1));
    prompt.push_str(system.trim_end());
    prompt.push_str("\n\n");

    for turn in memory.turns() {
        prompt.push_str("Human: ");
        prompt.push_str(&turn.user_text);
        prompt.push_str("\nAssistant: ");
        prompt.push_str(&turn.assistant_text);
        prompt.push('\n');
    }

    prompt.push_str("Human: ");
    prompt.push_str(user_text.trim());
    prompt.push_str("\nAssistant:");
    prompt
}
