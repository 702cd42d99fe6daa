//! Recent-history context window.

use parley_core::message::Message;

/// Prefix of the synthetic system message that carries a summary forward.
pub const SUMMARY_PREFIX: &str = "Summary of the earlier conversation: ";

/// Build the message list for one request.
///
/// The system prompt always comes first. When `summary` is present and
/// part of the history falls outside the window, a summary message follows
/// it. Then the last `recent_count` messages, stripped to role and content,
/// in their original order.
pub fn build_context_window(
    system_prompt: &str,
    messages: &[Message],
    summary: Option<&str>,
    recent_count: usize,
) -> Vec<Message> {
    let start = messages.len().saturating_sub(recent_count);
    let mut window = Vec::with_capacity(messages.len() - start + 2);
    window.push(Message::system(system_prompt));

    if let Some(summary) = summary.filter(|s| !s.is_empty())
        && messages.len() > recent_count
    {
        window.push(Message::system(format!("{SUMMARY_PREFIX}{summary}")));
    }

    window.extend(messages[start..].iter().map(Message::stripped));
    window
}

/// Whether the conversation has reached a summarization checkpoint:
/// at least `threshold` messages, on a multiple of ten.
pub fn should_summarize(message_count: usize, threshold: usize) -> bool {
    message_count >= threshold && message_count % 10 == 0
}
