//! Ordered header map with case-insensitive names.

use std::fmt;

/// A case-insensitive, multi-value HTTP header map.
///
/// Insertion order is preserved and a name may carry several values, matching
/// HTTP field semantics (RFC 9110 §5.3). Middleware that must own a header
/// outright (such as the cache status marker) uses [`Headers::set`], which
/// replaces every existing value.
///
/// # Examples
///
/// ```
/// use readthru::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("X-Cache", "MISS");
/// headers.set("x-cache", "HIT");
///
/// assert_eq!(headers.get("X-CACHE"), Some("HIT"));
/// assert_eq!(headers.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value; existing values for the same name are kept.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces all values for `name` with a single `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// Returns the first value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value for `name` in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Removes every value for `name`. Returns `true` if anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.entries.len() < before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of entries, counting repeated names separately.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            writeln!(f, "{name}: {value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        let mut h = Headers::new();
        h.insert("Content-Type", "application/json");
        assert_eq!(h.get("content-type"), Some("application/json"));
        assert!(h.contains("CONTENT-TYPE"));
    }

    #[test]
    fn insert_keeps_every_value() {
        let mut h = Headers::new();
        h.insert("Vary", "Accept");
        h.insert("vary", "Authorization");
        let all: Vec<_> = h.get_all("VARY").collect();
        assert_eq!(all, vec!["Accept", "Authorization"]);
    }

    #[test]
    fn set_replaces_existing_values() {
        let mut h = Headers::new();
        h.insert("X-Cache", "MISS");
        h.insert("x-cache", "MISS");
        h.insert("Content-Type", "text/html");
        h.set("X-Cache", "HIT");

        assert_eq!(h.get_all("x-cache").collect::<Vec<_>>(), vec!["HIT"]);
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn remove_reports_whether_anything_changed() {
        let mut h = Headers::new();
        h.insert("X-Tenant", "acme");
        assert!(h.remove("x-tenant"));
        assert!(!h.remove("x-tenant"));
        assert!(h.is_empty());
    }
}
