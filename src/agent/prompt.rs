//! Deterministic prompt assembly shared by the built-in agents.

use crate::session::{Message, MessageRole};

/// Longest rendered history message; longer payloads are cut mid-word.
const HISTORY_LINE_CHARS: usize = 400;

/// Compose the generation prompt for one invocation.
///
/// Layout, in order: persona, memory fragment, recent history, prior stage
/// output, then the query. Sections that are empty are omitted entirely, so
/// the same inputs always produce the same prompt.
pub fn compose_prompt(
    persona: &str,
    memory_fragment: &str,
    history: &[Message],
    prior_output: Option<&str>,
    query: &str,
) -> String {
    let mut prompt = String::new();
    if !persona.is_empty() {
        prompt.push_str(persona);
        prompt.push_str("\n\n");
    }
    if !memory_fragment.is_empty() {
        prompt.push_str(memory_fragment);
        prompt.push('\n');
    }
    if !history.is_empty() {
        prompt.push_str("Conversation so far:\n");
        for message in history {
            let speaker = match message.role {
                MessageRole::User => "User",
                MessageRole::Assistant => "Assistant",
                MessageRole::System => "System",
                MessageRole::Tool => "Tool",
            };
            let line: String = message.content.chars().take(HISTORY_LINE_CHARS).collect();
            prompt.push_str(speaker);
            prompt.push_str(": ");
            prompt.push_str(&line);
            prompt.push('\n');
        }
        prompt.push('\n');
    }
    if let Some(prior) = prior_output {
        if !prior.is_empty() {
            prompt.push_str("Input from the previous step:\n");
            prompt.push_str(prior);
            prompt.push_str("\n\n");
        }
    }
    prompt.push_str("User: ");
    prompt.push_str(query);
    prompt.push_str("\nAssistant:");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MessageKind;

    fn msg(role: MessageRole, content: &str) -> Message {
        Message {
            message_id: "m".into(),
            session_id: "s".into(),
            agent_id: "a".into(),
            role,
            kind: MessageKind::Text,
            content: content.into(),
            timestamp_ms: 0,
            parent_message_id: None,
            cancelled: false,
        }
    }

    #[test]
    fn empty_sections_are_omitted() {
        let prompt = compose_prompt("", "", &[], None, "hello");
        assert_eq!(prompt, "User: hello\nAssistant:");
    }

    #[test]
    fn sections_appear_in_order() {
        let history = vec![msg(MessageRole::User, "earlier question")];
        let prompt = compose_prompt(
            "You are concise.",
            "Relevant prior context:\n- something\n",
            &history,
            Some("stage output"),
            "now answer",
        );
        let persona_at = prompt.find("You are concise.").unwrap();
        let memory_at = prompt.find("Relevant prior context").unwrap();
        let history_at = prompt.find("Conversation so far").unwrap();
        let prior_at = prompt.find("previous step").unwrap();
        let query_at = prompt.find("now answer").unwrap();
        assert!(persona_at < memory_at);
        assert!(memory_at < history_at);
        assert!(history_at < prior_at);
        assert!(prior_at < query_at);
    }

    #[test]
    fn long_history_lines_are_bounded() {
        let history = vec![msg(MessageRole::User, &"x".repeat(2_000))];
        let prompt = compose_prompt("", "", &history, None, "q");
        let line = prompt.lines().find(|l| l.starts_with("User: x")).unwrap();
        assert!(line.chars().count() <= HISTORY_LINE_CHARS + "User: ".len());
    }

    #[test]
    fn same_inputs_same_prompt() {
        let a = compose_prompt("p", "m\n", &[], Some("prior"), "q");
        let b = compose_prompt("p", "m\n", &[], Some("prior"), "q");
        assert_eq!(a, b);
    }
}
