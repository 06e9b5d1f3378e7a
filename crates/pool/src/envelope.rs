use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use fetch::{Body, Headers, Request, Response};

/// The request as it crosses into the sandbox. Byte bodies travel
/// base64-encoded; text bodies stay text.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub body_base64: Option<String>,
}

impl RequestPayload {
    pub fn from_request(request: &Request) -> Self {
        let (body, body_base64) = match &request.body {
            Body::Text(text) => (Some(text.clone()), None),
            Body::Bytes(bytes) => (None, Some(BASE64.encode(bytes))),
        };

        Self {
            url: request.url.clone(),
            method: request.method.clone(),
            headers: request.headers.to_pairs(),
            body,
            body_base64,
        }
    }
}

/// The normalized handler response coming back out of the sandbox.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub body_base64: Option<String>,
}

impl ResponseEnvelope {
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn into_response(self, url: &str) -> Result<Response, String> {
        let body = match self.body_base64 {
            Some(encoded) => Body::Bytes(
                BASE64
                    .decode(encoded.as_bytes())
                    .map_err(|err| format!("invalid base64 response body: {}", err))?,
            ),
            None => Body::Text(self.body),
        };

        Ok(Response::new(body)
            .with_status(self.status)
            .with_status_text(self.status_text)
            .with_headers(Headers::from_pairs(self.headers))
            .with_url(url))
    }
}
