//! Key parsing for raw terminal input.
//!
//! Turns the bytes of a single keystroke into a structured key with
//! modifiers, so gestures can be described to the operator by name.

use serde::Serialize;

/// A parsed key event with optional modifiers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ParsedKey {
    /// The key that was pressed, if recognized.
    pub key: Option<String>,
    /// Modifiers active during the key press (e.g., "ctrl").
    pub modifiers: Vec<String>,
}

impl ParsedKey {
    pub fn new(key: Option<String>) -> Self {
        Self {
            key,
            modifiers: Vec::new(),
        }
    }

    pub fn with_modifiers(key: Option<String>, modifiers: Vec<String>) -> Self {
        Self { key, modifiers }
    }

    /// Display label such as `Ctrl+]` or `Escape`.
    pub fn label(&self) -> Option<String> {
        let key = self.key.as_ref()?;
        let mut label = String::new();
        for modifier in &self.modifiers {
            let mut chars = modifier.chars();
            if let Some(first) = chars.next() {
                label.extend(first.to_uppercase());
                label.push_str(chars.as_str());
            }
            label.push('+');
        }
        if self.modifiers.is_empty() {
            label.push_str(key);
        } else {
            label.push_str(&key.to_uppercase());
        }
        Some(label)
    }
}

/// Parses raw bytes into a structured key event.
///
/// - Empty input -> key: None
/// - 0x01-0x1a -> ctrl + letter (except Tab and Enter)
/// - 0x1c-0x1f -> ctrl + `\` `]` `^` `_`
/// - 0x1b (single) -> "Escape"
/// - 0x7f -> "Backspace"
/// - 0x20-0x7e -> printable char
/// - ESC [ A/B/C/D/H/F -> arrows, Home, End
/// - anything else -> key: None
pub fn parse_key(data: &[u8]) -> ParsedKey {
    if data.is_empty() {
        return ParsedKey::new(None);
    }

    if data.len() >= 3 && data[0] == 0x1b && data[1] == b'[' {
        let key = match data[2] {
            b'A' => Some("ArrowUp".to_string()),
            b'B' => Some("ArrowDown".to_string()),
            b'C' => Some("ArrowRight".to_string()),
            b'D' => Some("ArrowLeft".to_string()),
            b'H' => Some("Home".to_string()),
            b'F' => Some("End".to_string()),
            _ => None,
        };
        return ParsedKey::new(key);
    }

    if data.len() != 1 {
        return ParsedKey::new(None);
    }

    let byte = data[0];
    let ctrl = |key: &str| ParsedKey::with_modifiers(Some(key.to_string()), vec!["ctrl".to_string()]);
    match byte {
        0x09 => ParsedKey::new(Some("Tab".to_string())),
        0x0d => ParsedKey::new(Some("Enter".to_string())),
        0x1b => ParsedKey::new(Some("Escape".to_string())),
        0x01..=0x1a => ctrl(&((byte - 1 + b'a') as char).to_string()),
        0x1c => ctrl("\\"),
        0x1d => ctrl("]"),
        0x1e => ctrl("^"),
        0x1f => ctrl("_"),
        0x7f => ParsedKey::new(Some("Backspace".to_string())),
        0x20..=0x7e => ParsedKey::new(Some((byte as char).to_string())),
        _ => ParsedKey::new(None),
    }
}
