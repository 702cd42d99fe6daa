//! User input validation.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("Please enter a message.")]
    Empty,

    #[error("Your message is too long ({length} characters, the limit is {max}).")]
    TooLong { length: usize, max: usize },

    #[error("Your message contains unsupported control characters.")]
    ControlCharacters,
}

/// Check a raw user message and return it trimmed.
///
/// Newlines, carriage returns and tabs are the only control characters
/// accepted.
pub fn validate_input(input: &str, max_chars: usize) -> Result<&str, InputError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(InputError::Empty);
    }

    let length = trimmed.chars().count();
    if length > max_chars {
        return Err(InputError::TooLong {
            length,
            max: max_chars,
        });
    }

    if trimmed
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
    {
        return Err(InputError::ControlCharacters);
    }

    Ok(trimmed)
}
