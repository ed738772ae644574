//! The unlock gesture: a single configurable keystroke.

use thiserror::Error;

use super::keys::parse_key;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GestureError {
    #[error("empty gesture")]
    Empty,
    #[error("unsupported modifier in gesture: {0}")]
    UnsupportedModifier(String),
    #[error("no control code for ctrl+{0}")]
    NoControlCode(String),
    #[error("unrecognized key in gesture: {0}")]
    UnknownKey(String),
}

/// A key spec such as `ctrl+]`, `esc` or `q`, resolved to the bytes the
/// terminal sends for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gesture {
    spec: String,
    bytes: Vec<u8>,
}

impl Gesture {
    pub fn parse(spec: &str) -> Result<Self, GestureError> {
        let trimmed = spec.trim();
        if trimmed.is_empty() {
            return Err(GestureError::Empty);
        }

        let bytes = match trimmed.split_once('+') {
            // `+` on its own is a printable key, not a separator.
            Some((modifier, key)) if !modifier.is_empty() => {
                if !modifier.eq_ignore_ascii_case("ctrl") {
                    return Err(GestureError::UnsupportedModifier(modifier.to_string()));
                }
                vec![control_code(key)?]
            }
            _ => {
                let lower = trimmed.to_ascii_lowercase();
                if lower == "esc" || lower == "escape" {
                    vec![0x1b]
                } else {
                    let mut chars = trimmed.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) if c.is_ascii_graphic() || c == ' ' => vec![c as u8],
                        _ => return Err(GestureError::UnknownKey(trimmed.to_string())),
                    }
                }
            }
        };

        Ok(Self {
            spec: trimmed.to_string(),
            bytes,
        })
    }

    /// Exact match: the input chunk must be the gesture and nothing else.
    pub fn matches(&self, data: &[u8]) -> bool {
        data == self.bytes.as_slice()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    /// Human label for banners, e.g. `Ctrl+]`.
    pub fn label(&self) -> String {
        parse_key(&self.bytes)
            .label()
            .unwrap_or_else(|| self.spec.clone())
    }
}

impl Default for Gesture {
    fn default() -> Self {
        Self {
            spec: "ctrl+]".to_string(),
            bytes: vec![0x1d],
        }
    }
}

fn control_code(key: &str) -> Result<u8, GestureError> {
    let mut chars = key.chars();
    let c = match (chars.next(), chars.next()) {
        (Some(c), None) => c,
        _ => return Err(GestureError::NoControlCode(key.to_string())),
    };
    match c.to_ascii_lowercase() {
        l @ 'a'..='z' => Ok(l as u8 - b'a' + 1),
        '@' | ' ' => Ok(0x00),
        '[' => Ok(0x1b),
        '\\' => Ok(0x1c),
        ']' => Ok(0x1d),
        '^' => Ok(0x1e),
        '_' => Ok(0x1f),
        _ => Err(GestureError::NoControlCode(key.to_string())),
    }
}
