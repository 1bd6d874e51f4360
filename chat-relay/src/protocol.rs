//! Fixed wire texts and display-name rules.

use crate::error::{RelayError, RelayResult};

/// Sent by the server as the first frame on every connection.
pub const NAME_REQUEST: &str = "NICK";

pub const JOIN_CONFIRMATION: &str = "Connected to the server!";

pub const MAX_NAME_LEN: usize = 64;

pub fn joined_notice(name: &str) -> String {
    format!("{name} has joined the chat!")
}

pub fn left_notice(name: &str) -> String {
    format!("{name} has left the chat!")
}

pub fn relay_line(name: &str, text: &str) -> String {
    format!("{name}: {text}")
}

/// Byte length of [`relay_line`] for `name` and `text`, without building it.
pub fn relay_line_len(name: &str, text: &str) -> usize {
    name.len() + ": ".len() + text.len()
}

pub fn duplicate_name_rejection(name: &str) -> String {
    format!("Nickname '{name}' is already in use!")
}

pub fn invalid_name_rejection() -> String {
    format!("Nickname must be 1-{MAX_NAME_LEN} bytes of UTF-8 text!")
}

/// Validates a proposed display name, trimming surrounding whitespace.
pub fn parse_name(payload: &[u8]) -> RelayResult<String> {
    let invalid = || RelayError::InvalidName { max: MAX_NAME_LEN };
    let name = std::str::from_utf8(payload).map_err(|_| invalid())?.trim();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(invalid());
    }
    Ok(name.to_string())
}

/// Returns the chat text to relay, or `None` if the frame should be dropped.
pub fn chat_text(payload: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(payload).ok()?;
    if text.trim().is_empty() {
        return None;
    }
    Some(text)
}
