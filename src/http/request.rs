//! Inbound request representation.

use std::collections::HashMap;

use bytes::Bytes;

use super::{Headers, Method};

/// An inbound HTTP request as handed over by the dispatch layer.
///
/// Built from a method and a request target (`/path?query`); the target is
/// split once at construction so the path and the raw query string can be
/// read independently.
///
/// # Examples
///
/// ```
/// use readthru::http::{Method, Request};
///
/// let request = Request::new(Method::Get, "/search?q=rust&page=2")
///     .with_header("Accept", "application/json");
///
/// assert_eq!(request.path(), "/search");
/// assert_eq!(request.query_string(), Some("q=rust&page=2"));
/// assert_eq!(request.query_param("page"), Some("2"));
/// assert_eq!(request.headers().get("accept"), Some("application/json"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    headers: Headers,
    body: Bytes,
    params: HashMap<String, String>,
}

impl Request {
    /// Creates a request for `target`, which may carry a `?query` suffix.
    ///
    /// An empty target is treated as `/`. An empty query (`/path?`) is
    /// dropped.
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query).filter(|q| !q.is_empty())),
            None => (target, None),
        };
        let path = if path.is_empty() { "/" } else { path };

        let params = query.map(parse_query_string).unwrap_or_default();

        Self {
            method,
            path: path.to_owned(),
            query: query.map(str::to_owned),
            headers: Headers::new(),
            body: Bytes::new(),
            params,
        }
    }

    /// Shorthand for a `GET` request.
    pub fn get(target: &str) -> Self {
        Self::new(Method::Get, target)
    }

    /// Shorthand for a `POST` request.
    pub fn post(target: &str) -> Self {
        Self::new(Method::Post, target)
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Parses `key=value&key2=value2`, decoding `+` as a space.
///
/// Full percent-decoding is not performed.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.replace('+', " "), value.replace('+', " "))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_path_and_query() {
        let req = Request::get("/items?sort=asc&tag=a+b");
        assert_eq!(req.path(), "/items");
        assert_eq!(req.query_string(), Some("sort=asc&tag=a+b"));
        assert_eq!(req.query_param("tag"), Some("a b"));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn empty_target_is_root() {
        let req = Request::get("");
        assert_eq!(req.path(), "/");
        assert_eq!(req.query_string(), None);
    }

    #[test]
    fn trailing_question_mark_has_no_query() {
        let req = Request::get("/items?");
        assert_eq!(req.path(), "/items");
        assert_eq!(req.query_string(), None);
    }

    #[test]
    fn valueless_query_key_maps_to_empty_string() {
        let req = Request::get("/items?flag&x=1");
        assert_eq!(req.query_param("flag"), Some(""));
        assert_eq!(req.query_param("x"), Some("1"));
    }

    #[test]
    fn post_carries_body() {
        let req = Request::post("/send-welcome").with_body(r#"{"email":"a@b.c"}"#);
        assert_eq!(req.method(), &Method::Post);
        assert_eq!(&req.body()[..], br#"{"email":"a@b.c"}"#);
    }
}
