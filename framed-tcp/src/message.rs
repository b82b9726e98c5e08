use std::{borrow::Cow, fmt};

/// One discrete application-level unit carried by a frame.
///
/// `code` has no meaning to the transport; callers pick their own values.
/// The payload is opaque bytes and may be empty, in which case the message
/// acts as a code-only signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Message {
    pub code: i32,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(code: i32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    /// A message with an empty payload.
    pub fn signal(code: i32) -> Self {
        Self {
            code,
            payload: Vec::new(),
        }
    }

    /// Builds a message whose payload is the UTF-8 encoding of `text`.
    pub fn text_with_code(code: i32, text: &str) -> Self {
        Self::new(code, text.as_bytes())
    }

    pub fn is_signal(&self) -> bool {
        self.payload.is_empty()
    }

    /// Lossy UTF-8 view of the payload.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::text_with_code(0, text)
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::new(0, text.into_bytes())
    }
}

impl From<Vec<u8>> for Message {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(0, payload)
    }
}

impl From<&[u8]> for Message {
    fn from(payload: &[u8]) -> Self {
        Self::new(0, payload)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}
