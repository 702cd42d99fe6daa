//! Incremental reveal of a completed response.
//!
//! The completion API answers in one piece; the text is handed to the UI
//! in small chunks on a timer so it reads as if streamed.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::stream_event::TurnEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevealOutcome {
    Completed,
    /// Cancelled at a chunk boundary; carries what was already shown
    Aborted { revealed: String },
}

/// Emit `text` as [`TurnEvent::Chunk`]s of `chunk_chars` characters,
/// `interval` apart. Checks `cancel` before every chunk and while waiting.
pub async fn reveal(
    text: &str,
    chunk_chars: usize,
    interval: Duration,
    events: &mpsc::Sender<TurnEvent>,
    cancel: &CancellationToken,
) -> RevealOutcome {
    let chars: Vec<char> = text.chars().collect();
    let mut revealed = String::with_capacity(text.len());

    for (i, chunk) in chars.chunks(chunk_chars.max(1)).enumerate() {
        if i > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return RevealOutcome::Aborted { revealed },
                _ = tokio::time::sleep(interval) => {}
            }
        }
        if cancel.is_cancelled() {
            return RevealOutcome::Aborted { revealed };
        }

        let content: String = chunk.iter().collect();
        revealed.push_str(&content);
        let _ = events.send(TurnEvent::Chunk { content }).await;
    }

    RevealOutcome::Completed
}
