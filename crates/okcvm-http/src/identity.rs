//! Client-identity resolution (§4.I).
//!
//! First non-empty source wins: an explicit override the route handler
//! already resolved (a path or query parameter it owns), the
//! `x-okc-client-id` header, the `okc_client_id` cookie, a generic
//! `client_id` query parameter, then the literal `"default"`.

use std::collections::HashMap;

use axum::http::HeaderMap;

const HEADER_NAME: &str = "x-okc-client-id";
const COOKIE_NAME: &str = "okc_client_id";
const DEFAULT_CLIENT_ID: &str = "default";

pub fn resolve(route_override: Option<&str>, headers: &HeaderMap, query: &HashMap<String, String>) -> String {
    if let Some(value) = route_override {
        if !value.is_empty() {
            return value.to_string();
        }
    }
    if let Some(value) = headers.get(HEADER_NAME).and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return value.to_string();
        }
    }
    if let Some(value) = cookie_value(headers, COOKIE_NAME) {
        if !value.is_empty() {
            return value;
        }
    }
    if let Some(value) = query.get("client_id") {
        if !value.is_empty() {
            return value.clone();
        }
    }
    DEFAULT_CLIENT_ID.to_string()
}

/// Hand-rolled `Cookie:` header parsing — avoids pulling in a cookie-jar
/// crate for a single name/value lookup.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                axum::http::HeaderValue::from_str(v).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn route_override_wins_over_everything() {
        let headers = headers_with(&[(HEADER_NAME, "from-header")]);
        let query = HashMap::from([("client_id".to_string(), "from-query".to_string())]);
        assert_eq!(resolve(Some("from-route"), &headers, &query), "from-route");
    }

    #[test]
    fn header_wins_over_cookie_and_query() {
        let headers = headers_with(&[(HEADER_NAME, "from-header"), ("cookie", "okc_client_id=from-cookie")]);
        let query = HashMap::from([("client_id".to_string(), "from-query".to_string())]);
        assert_eq!(resolve(None, &headers, &query), "from-header");
    }

    #[test]
    fn cookie_wins_over_query() {
        let headers = headers_with(&[("cookie", "other=1; okc_client_id=from-cookie; more=2")]);
        let query = HashMap::from([("client_id".to_string(), "from-query".to_string())]);
        assert_eq!(resolve(None, &headers, &query), "from-cookie");
    }

    #[test]
    fn query_wins_over_default() {
        let headers = HeaderMap::new();
        let query = HashMap::from([("client_id".to_string(), "from-query".to_string())]);
        assert_eq!(resolve(None, &headers, &query), "from-query");
    }

    #[test]
    fn falls_back_to_default() {
        let headers = HeaderMap::new();
        let query = HashMap::new();
        assert_eq!(resolve(None, &headers, &query), "default");
    }
}
