use std::borrow::Cow;

use crate::body::{Body, BodyError};
use crate::headers::Headers;

/// A handler's response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: Body,
    pub url: String,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(Body::empty())
    }
}

impl Response {
    /// Response with the defaults: status 200, no headers, empty URL.
    pub fn new(body: impl Into<Body>) -> Self {
        Self {
            status: 200,
            status_text: String::new(),
            headers: Headers::new(),
            body: body.into(),
            url: String::new(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = status_text.into();
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Whether the status is in the 2xx range.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> Cow<'_, str> {
        self.body.text()
    }

    pub fn json(&self) -> Result<serde_json::Value, BodyError> {
        self.body.json()
    }

    pub fn array_buffer(&self) -> Cow<'_, [u8]> {
        self.body.array_buffer()
    }
}
