use std::borrow::Cow;

/// A request or response body: UTF-8 text or a raw byte sequence.
///
/// The default body is empty text. Bodies are immutable once constructed;
/// every read method is a pure transform over the stored value, so calling
/// one repeatedly always yields the same result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Text(String),
    Bytes(Vec<u8>),
}

impl Default for Body {
    fn default() -> Self {
        Body::Text(String::new())
    }
}

impl Body {
    pub fn empty() -> Self {
        Body::default()
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Body::Text(text) => text.is_empty(),
            Body::Bytes(bytes) => bytes.is_empty(),
        }
    }

    /// Body size in bytes as it would go over the wire.
    pub fn len(&self) -> usize {
        match self {
            Body::Text(text) => text.len(),
            Body::Bytes(bytes) => bytes.len(),
        }
    }

    /// Decode as text. Byte bodies are decoded as UTF-8 with invalid
    /// sequences replaced; this never fails.
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            Body::Text(text) => Cow::Borrowed(text.as_str()),
            Body::Bytes(bytes) => String::from_utf8_lossy(bytes),
        }
    }

    /// Decode as text, then parse as JSON.
    pub fn json(&self) -> Result<serde_json::Value, BodyError> {
        serde_json::from_str(&self.text()).map_err(|err| BodyError::Parse(err.to_string()))
    }

    /// The raw byte view. Text bodies are UTF-8 encoded.
    pub fn array_buffer(&self) -> Cow<'_, [u8]> {
        match self {
            Body::Text(text) => Cow::Borrowed(text.as_bytes()),
            Body::Bytes(bytes) => Cow::Borrowed(bytes.as_slice()),
        }
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Text(text)
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(bytes)
    }
}

/// Body decode failures, surfaced to the caller as a 4xx-equivalent fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    /// Malformed JSON.
    Parse(String),
    /// Malformed or missing multipart framing.
    FormData(FormDataError),
}

impl std::fmt::Display for BodyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodyError::Parse(message) => write!(f, "invalid JSON body: {}", message),
            BodyError::FormData(err) => write!(f, "invalid form data: {}", err),
        }
    }
}

impl std::error::Error for BodyError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormDataError {
    MissingContentType,
    MissingBoundary,
    MalformedPart(String),
}

impl std::fmt::Display for FormDataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormDataError::MissingContentType => write!(f, "missing content-type header"),
            FormDataError::MissingBoundary => {
                write!(f, "content-type has no multipart boundary parameter")
            }
            FormDataError::MalformedPart(detail) => write!(f, "malformed part: {}", detail),
        }
    }
}

impl std::error::Error for FormDataError {}

impl From<FormDataError> for BodyError {
    fn from(err: FormDataError) -> Self {
        BodyError::FormData(err)
    }
}
