use std::borrow::Cow;
use std::collections::HashMap;

use crate::body::{Body, BodyError};
use crate::headers::Headers;
use crate::multipart::parse_multipart;

/// An incoming request as handler code sees it.
///
/// Only method, headers, body, and URL are modeled; the remaining Fetch
/// request fields (cache, credentials, redirect, ...) have no constructor
/// surface here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Body,
}

impl Request {
    /// Request for a URL with the defaults: `GET`, no headers, empty body.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Headers::new(),
            body: Body::empty(),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
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

    /// Parse the body as `multipart/form-data` using this request's
    /// `Content-Type` boundary parameter.
    pub fn form_data(&self) -> Result<HashMap<String, String>, BodyError> {
        Ok(parse_multipart(&self.headers, &self.text())?)
    }
}
