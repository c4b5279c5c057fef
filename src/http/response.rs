//! Response builder with a typed body.
//!
//! A handler emits its output through one of two operations: structured data
//! ([`Response::json`]) or rendered text ([`Response::text`] /
//! [`Response::html`]). The distinction is kept in [`Body`] so that layers
//! like the response cache can capture and replay the payload with the kind
//! it was produced as.

use bytes::Bytes;
use serde_json::Value;

use super::{Headers, StatusCode};

pub const CONTENT_TYPE: &str = "Content-Type";

/// The payload of a [`Response`].
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    /// Opaque rendered bytes (HTML, plain text, ...).
    Text(Bytes),
    /// A serialized data value, rendered as JSON on the wire.
    Structured(Value),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Text(bytes) => bytes.is_empty(),
            Body::Structured(_) => false,
        }
    }

    /// Renders the body as it would be written to the client.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Body::Empty => Bytes::new(),
            Body::Text(bytes) => bytes.clone(),
            // Serializing a `Value` only fails for non-string map keys, which
            // `Value` cannot represent.
            Body::Structured(value) => Bytes::from(serde_json::to_vec(value).unwrap_or_default()),
        }
    }
}

/// An outgoing HTTP response.
///
/// # Examples
///
/// ```
/// use readthru::http::{Body, Response, StatusCode};
/// use serde_json::json;
///
/// let response = Response::json(json!({ "ok": true }));
/// assert_eq!(response.status(), StatusCode::Ok);
/// assert_eq!(response.headers().get("content-type"), Some("application/json"));
/// assert!(matches!(response.body(), Body::Structured(_)));
/// assert_eq!(&response.body_bytes()[..], br#"{"ok":true}"#);
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
}

impl Response {
    /// Creates a response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Empty,
        }
    }

    /// A `200 OK` response carrying structured data.
    pub fn json(value: Value) -> Self {
        Self::new(StatusCode::Ok)
            .header(CONTENT_TYPE, "application/json")
            .with_body(Body::Structured(value))
    }

    /// A `200 OK` response carrying plain text.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(StatusCode::Ok)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .with_body(Body::Text(Bytes::from(text.into())))
    }

    /// A `200 OK` response carrying rendered HTML.
    pub fn html(markup: impl Into<String>) -> Self {
        Self::new(StatusCode::Ok)
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .with_body(Body::Text(Bytes::from(markup.into())))
    }

    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces a header in place. Intended for middleware decorating a
    /// response it received from downstream.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE)
    }

    /// The body exactly as the client receives it.
    pub fn body_bytes(&self) -> Bytes {
        self.body.to_bytes()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_sets_plain_content_type() {
        let r = Response::text("hello");
        assert_eq!(r.content_type(), Some("text/plain; charset=utf-8"));
        assert_eq!(&r.body_bytes()[..], b"hello");
    }

    #[test]
    fn html_is_a_text_body() {
        let r = Response::html("<h1>hi</h1>");
        assert!(matches!(r.body(), Body::Text(_)));
        assert_eq!(r.content_type(), Some("text/html; charset=utf-8"));
    }

    #[test]
    fn structured_body_renders_as_json() {
        let r = Response::json(json!({ "items": [1, 2] }));
        assert_eq!(&r.body_bytes()[..], br#"{"items":[1,2]}"#);
    }

    #[test]
    fn with_status_keeps_body() {
        let r = Response::json(json!({ "error": "missing" })).with_status(StatusCode::NotFound);
        assert_eq!(r.status(), StatusCode::NotFound);
        assert!(!r.body().is_empty());
    }

    #[test]
    fn set_header_overrides() {
        let mut r = Response::new(StatusCode::NoContent).header("X-Cache", "MISS");
        r.set_header("x-cache", "HIT");
        assert_eq!(r.headers().get("X-Cache"), Some("HIT"));
        assert_eq!(r.headers().len(), 1);
        assert!(r.body().is_empty());
    }
}
