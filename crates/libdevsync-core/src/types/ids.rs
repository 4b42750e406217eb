use rand::Rng;
use thiserror::Error;

/// Device identifier. Generated ids are 128-bit random values in lowercase hex,
/// but user-chosen ids (e.g. a hostname) are accepted as long as they are
/// safe to use as a segment file name.
pub type DeviceId = String;

/// Scope marker for entries visible on every device
pub const WILDCARD_DEVICE: &str = "*";

/// Maximum accepted device id length
pub const MAX_DEVICE_ID_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdParseError {
    #[error("device id is empty")]
    Empty,
    #[error("device id too long: {len} chars (max {max})")]
    TooLong { len: usize, max: usize },
    #[error("device id contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("device id {0:?} is reserved")]
    Reserved(String),
}

/// Generate a random 128-bit device ID as lowercase hex
pub fn generate_device_id() -> DeviceId {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Validate a device id.
///
/// Allowed characters are ASCII alphanumerics plus `-`, `_` and `.`; the id
/// must not start with a dot so it can never name a hidden or parent path.
pub fn validate_device_id(id: &str) -> Result<(), IdParseError> {
    if id.is_empty() {
        return Err(IdParseError::Empty);
    }
    if id.len() > MAX_DEVICE_ID_LEN {
        return Err(IdParseError::TooLong {
            len: id.len(),
            max: MAX_DEVICE_ID_LEN,
        });
    }
    if id == WILDCARD_DEVICE || id.starts_with('.') {
        return Err(IdParseError::Reserved(id.to_string()));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(IdParseError::InvalidChar(c));
    }
    Ok(())
}

/// Short form of a device id for human output
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
