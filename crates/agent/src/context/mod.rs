//! Context window building.
//!
//! Two stages, both pure:
//!
//! | Stage | Function | Bounds by |
//! |-------|----------|-----------|
//! | 1. Window | [`build_context_window`] | Message count (recent tail + summary) |
//! | 2. Budget | [`trim_to_budget`] | Token count (tool output first, then history) |

pub mod budget;
pub mod window;

pub use budget::{TRUNCATION_MARKER, TrimOutcome, TrimPolicy, TrimStrategy, trim_to_budget, truncate_to_tokens};
pub use window::{SUMMARY_PREFIX, build_context_window, should_summarize};
