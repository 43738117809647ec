//! Normalized request and short-circuit response types shared by every routing stage.

use std::collections::BTreeMap;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use url::form_urlencoded;

/// Ordered multi-valued query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    /// Parse an already split query string (without the leading `?`).
    pub fn parse(query: &str) -> Self {
        let pairs = form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self { pairs }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// All values for `key` joined with `,`.
    pub fn joined(&self, key: &str) -> Option<String> {
        let values = self.get_all(key);
        (!values.is_empty()).then(|| values.join(","))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    /// Replace every value of `key` with a single value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.pairs.retain(|(k, _)| *k != key);
        self.pairs.push((key, value.into()));
    }

    /// Overlay `other`: keys present in `other` replace the existing values.
    pub fn merge(&mut self, other: QueryParams) {
        for key in other.keys() {
            self.pairs.retain(|(k, _)| *k != key);
        }
        self.pairs.extend(other.pairs);
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for (k, _) in &self.pairs {
            if !keys.contains(k) {
                keys.push(k.clone());
            }
        }
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Serialize with a leading `?`, or an empty string when there are no pairs.
    pub fn to_query_string(&self) -> String {
        if self.pairs.is_empty() {
            return String::new();
        }
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (k, v) in &self.pairs {
            serializer.append_pair(k, v);
        }
        format!("?{}", serializer.finish())
    }
}

/// The request as seen by the routing stages.
///
/// Header names are lower-cased; repeated headers are joined with `, `.
#[derive(Debug, Clone)]
pub struct InternalRequest {
    pub method: Method,
    pub raw_path: String,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub query: QueryParams,
    pub body: Bytes,
}

impl InternalRequest {
    pub fn new(method: Method, uri: &str) -> Self {
        let (path, query) = split_url(uri);
        Self {
            method,
            raw_path: path.to_string(),
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            query: QueryParams::parse(query),
            body: Bytes::new(),
        }
    }

    pub fn from_parts(parts: &Parts, body: Bytes) -> Self {
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in &parts.headers {
            let Ok(value) = value.to_str() else {
                continue;
            };
            let separator = if name == "cookie" { "; " } else { ", " };
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(separator);
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
        if !headers.contains_key("host")
            && let Some(authority) = parts.uri.authority()
        {
            headers.insert("host".to_string(), authority.to_string());
        }

        let cookies = headers
            .get("cookie")
            .map(|raw| parse_cookies(raw))
            .unwrap_or_default();

        Self {
            method: parts.method.clone(),
            raw_path: parts.uri.path().to_string(),
            headers,
            cookies,
            query: QueryParams::parse(parts.uri.query().unwrap_or("")),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        let name = name.to_ascii_lowercase();
        if name == "cookie" {
            let value = value.into();
            self.cookies = parse_cookies(&value);
            self.headers.insert(name, value);
        } else {
            self.headers.insert(name, value.into());
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// `Host` header, or an empty string.
    pub fn host(&self) -> &str {
        self.header("host").unwrap_or("")
    }

    /// Path plus serialized query.
    pub fn url(&self) -> String {
        format!("{}{}", self.raw_path, self.query.to_query_string())
    }

    /// Rebuild a header map for forwarding.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.insert(name, value);
            }
        }
        map
    }
}

/// Split `path?query` into its two halves.
pub fn split_url(url: &str) -> (&str, &str) {
    match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    }
}

pub fn parse_cookies(raw: &str) -> BTreeMap<String, String> {
    raw.split(';')
        .filter_map(|part| {
            let (name, value) = part.trim().split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// A response produced by the routing or cache layers without invoking the render pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl PreparedResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace every header named `name` (case-insensitive) with a single value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn redirect(status: u16, location: impl Into<String>) -> Self {
        Self::new(status).header("location", location)
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl IntoResponse for PreparedResponse {
    fn into_response(self) -> Response {
        let mut builder = Response::builder().status(self.status);

        for (name, value) in self.headers {
            if let Ok(header_value) = HeaderValue::from_str(&value) {
                builder = builder.header(name, header_value);
            }
        }

        builder
            .body(Body::from(self.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
