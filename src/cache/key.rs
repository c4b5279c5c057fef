use std::fmt;

use crate::http::Request;

/// Namespace every cache key lives under in the shared store.
pub const CACHE_NAMESPACE: &str = "cache";

/// A deterministic store key for one cacheable resource.
///
/// Built from the method, the path with any trailing slash removed, the
/// query pairs in sorted order and, when configured, every value of each
/// header a mount varies on. Two requests for the same resource always map
/// to the same key regardless of query parameter order.
///
/// # Examples
///
/// ```
/// use readthru::cache::CacheKey;
/// use readthru::http::Request;
///
/// let a = CacheKey::for_request(&Request::get("/items/?b=2&a=1"), &[]);
/// let b = CacheKey::for_request(&Request::get("/items?a=1&b=2"), &[]);
/// assert_eq!(a, b);
/// assert_eq!(a.as_str(), "cache:GET:/items?a=1&b=2");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_request(request: &Request, vary_by: &[String]) -> Self {
        let path = request.path();
        let path = if path.len() > 1 {
            path.trim_end_matches('/')
        } else {
            path
        };
        let path = if path.is_empty() { "/" } else { path };

        let mut key = format!("{CACHE_NAMESPACE}:{}:{path}", request.method());

        if let Some(query) = request.query_string() {
            let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
            if !pairs.is_empty() {
                pairs.sort_unstable();
                key.push('?');
                key.push_str(&pairs.join("&"));
            }
        }

        // Values are length-prefixed so separators inside them can't forge
        // another header's segment.
        for name in vary_by {
            key.push('|');
            key.push_str(&name.to_ascii_lowercase());
            key.push('=');
            for (n, value) in request.headers().get_all(name).enumerate() {
                if n > 0 {
                    key.push(',');
                }
                key.push_str(&format!("{}:{value}", value.len()));
            }
        }

        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(req: &Request) -> String {
        CacheKey::for_request(req, &[]).to_string()
    }

    #[test]
    fn root_path() {
        assert_eq!(key(&Request::get("/")), "cache:GET:/");
        assert_eq!(key(&Request::get("")), "cache:GET:/");
    }

    #[test]
    fn trailing_slashes_are_normalized() {
        assert_eq!(key(&Request::get("/users/")), key(&Request::get("/users")));
        assert_eq!(key(&Request::get("/users//")), "cache:GET:/users");
    }

    #[test]
    fn query_distinguishes_resources() {
        assert_ne!(key(&Request::get("/search?q=a")), key(&Request::get("/search?q=b")));
        assert_ne!(key(&Request::get("/search?q=a")), key(&Request::get("/search")));
    }

    #[test]
    fn empty_query_pairs_are_ignored() {
        assert_eq!(key(&Request::get("/s?&&")), "cache:GET:/s");
        assert_eq!(key(&Request::get("/s?a=1&&b=2")), "cache:GET:/s?a=1&b=2");
    }

    #[test]
    fn vary_headers_split_tenants() {
        let vary = vec!["X-Tenant".to_owned()];
        let acme = Request::get("/dashboard").with_header("x-tenant", "acme");
        let globex = Request::get("/dashboard").with_header("X-Tenant", "globex");

        let acme_key = CacheKey::for_request(&acme, &vary);
        assert_eq!(acme_key.as_str(), "cache:GET:/dashboard|x-tenant=4:acme");
        assert_ne!(acme_key, CacheKey::for_request(&globex, &vary));

        // Without vary headers both tenants would share one entry.
        assert_eq!(key(&acme), key(&globex));
    }

    #[test]
    fn missing_vary_header_still_yields_a_stable_key() {
        let vary = vec!["Authorization".to_owned()];
        let anon = CacheKey::for_request(&Request::get("/"), &vary);
        assert_eq!(anon.as_str(), "cache:GET:/|authorization=");

        let empty = Request::get("/").with_header("Authorization", "");
        assert_ne!(CacheKey::for_request(&empty, &vary), anon);
    }

    #[test]
    fn separators_inside_header_values_cannot_collide() {
        let vary = vec!["A".to_owned(), "B".to_owned()];
        let forged = Request::get("/")
            .with_header("A", "1|b=2")
            .with_header("B", "3");
        let plain = Request::get("/")
            .with_header("A", "1")
            .with_header("B", "2|b=3");

        assert_ne!(
            CacheKey::for_request(&forged, &vary),
            CacheKey::for_request(&plain, &vary)
        );
    }

    #[test]
    fn every_value_of_a_repeated_header_is_keyed() {
        let vary = vec!["Accept-Language".to_owned()];
        let en = Request::get("/").with_header("Accept-Language", "en");
        let en_fr = Request::get("/")
            .with_header("Accept-Language", "en")
            .with_header("accept-language", "fr");
        let joined = Request::get("/").with_header("Accept-Language", "en,fr");

        let key = CacheKey::for_request(&en_fr, &vary);
        assert_eq!(key.as_str(), "cache:GET:/|accept-language=2:en,2:fr");
        assert_ne!(key, CacheKey::for_request(&en, &vary));
        assert_ne!(key, CacheKey::for_request(&joined, &vary));
    }
}
