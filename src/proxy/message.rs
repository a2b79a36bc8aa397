//! Captured HTTP messages.
//!
//! Snapshots are the operator-facing form of a request or response: method,
//! URL or status, an ordered header list, and the raw body. They are what
//! the interception queue hands to the UI and what the traffic recorder
//! stores. Bodies travel as base64 strings in JSON.

use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One header line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Header name, spelled as sent when it could be recovered.
    pub name: String,
    /// Header value.
    pub value: String,
}

impl Header {
    /// Build a header from name and value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A captured request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
    /// Request method.
    pub method: String,
    /// Absolute URL of the target.
    pub url: String,
    /// Headers in wire order.
    pub headers: Vec<Header>,
    /// Raw body.
    #[serde(with = "base64_body")]
    pub body: Bytes,
}

/// A captured response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSnapshot {
    /// Status code.
    pub status: u16,
    /// Headers in wire order.
    pub headers: Vec<Header>,
    /// Raw body.
    #[serde(with = "base64_body")]
    pub body: Bytes,
}

/// Operator edits to a paused message. Absent fields keep the original.
///
/// `method` and `url` only apply to requests, `status` only to responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EditedPayload {
    /// Replacement method.
    pub method: Option<String>,
    /// Replacement URL.
    pub url: Option<String>,
    /// Replacement status code.
    pub status: Option<u16>,
    /// Replacement header list (replaces all headers).
    ///
    /// Accepted as a list of `{"name", "value"}` objects or as an object
    /// mapping names to a value or a list of values.
    #[serde(deserialize_with = "header_list_opt::deserialize")]
    pub headers: Option<Vec<Header>>,
    /// Replacement body.
    #[serde(with = "base64_body_opt")]
    pub body: Option<Bytes>,
}

impl EditedPayload {
    /// Whether applying this edit changes framing-relevant parts.
    pub fn touches_framing(&self) -> bool {
        self.headers.is_some() || self.body.is_some()
    }
}

impl RequestSnapshot {
    /// Apply operator edits.
    pub fn apply(&mut self, edit: &EditedPayload) {
        if let Some(method) = &edit.method {
            self.method = method.clone();
        }
        if let Some(url) = &edit.url {
            self.url = url.clone();
        }
        if let Some(headers) = &edit.headers {
            self.headers = headers.clone();
        }
        if let Some(body) = &edit.body {
            self.body = body.clone();
        }
    }

    /// Value of the first header called `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

impl ResponseSnapshot {
    /// Apply operator edits.
    pub fn apply(&mut self, edit: &EditedPayload) {
        if let Some(status) = edit.status {
            self.status = status;
        }
        if let Some(headers) = &edit.headers {
            self.headers = headers.clone();
        }
        if let Some(body) = &edit.body {
            self.body = body.clone();
        }
    }

    /// Value of the first header called `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

impl fmt::Display for RequestSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Capture a header map in iteration order.
///
/// Non-UTF-8 values are replaced lossily; the original map is what goes on
/// the wire unless the operator edits the headers.
pub fn headers_from_map(map: &HeaderMap) -> Vec<Header> {
    map.iter()
        .map(|(name, value)| {
            Header::new(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Rebuild a header map from an edited list.
pub fn headers_to_map(headers: &[Header]) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for header in headers {
        let name = HeaderName::from_bytes(header.name.trim().as_bytes())
            .map_err(|_| format!("invalid header name '{}'", header.name))?;
        let value = HeaderValue::from_str(header.value.trim())
            .map_err(|_| format!("invalid value for header '{}'", header.name))?;
        map.append(name, value);
    }
    Ok(map)
}

/// Serde helper: an optional header list in either operator form.
pub mod header_list_opt {
    use super::Header;
    use serde::de::{MapAccess, SeqAccess, Visitor};
    use serde::{Deserialize, Deserializer};
    use std::fmt;

    /// Deserialize `null`, `[{"name": .., "value": ..}]` or `{"Name": ..}`.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<Header>>, D::Error> {
        Ok(Option::<HeaderList>::deserialize(deserializer)?.map(|list| list.0))
    }

    struct HeaderList(Vec<Header>);

    /// Map form value: one value, or one per repeated header.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Values {
        One(String),
        Many(Vec<String>),
    }

    impl<'de> Deserialize<'de> for HeaderList {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_any(HeaderListVisitor)
        }
    }

    struct HeaderListVisitor;

    impl<'de> Visitor<'de> for HeaderListVisitor {
        type Value = HeaderList;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a list of {name, value} objects or a map of header names to values")
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<HeaderList, A::Error> {
            let mut headers = Vec::new();
            while let Some(header) = seq.next_element::<Header>()? {
                headers.push(header);
            }
            Ok(HeaderList(headers))
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<HeaderList, A::Error> {
            let mut headers = Vec::new();
            while let Some((name, values)) = map.next_entry::<String, Values>()? {
                match values {
                    Values::One(value) => headers.push(Header::new(name, value)),
                    Values::Many(values) => headers.extend(
                        values
                            .into_iter()
                            .map(|value| Header::new(name.clone(), value)),
                    ),
                }
            }
            Ok(HeaderList(headers))
        }
    }
}

/// Serde helper: `Bytes` as a base64 string.
pub mod base64_body {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as base64.
    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    /// Deserialize bytes from base64.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Serde helper: `Option<Bytes>` as an optional base64 string.
pub mod base64_body_opt {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize optional bytes as base64 or null.
    pub fn serialize<S: Serializer>(
        body: &Option<Bytes>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match body {
            Some(body) => serializer.serialize_some(&STANDARD.encode(body)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize optional bytes from base64 or null.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Bytes>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|s| {
                STANDARD
                    .decode(s.as_bytes())
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RequestSnapshot {
        RequestSnapshot {
            method: "POST".to_string(),
            url: "https://api.test/items".to_string(),
            headers: vec![
                Header::new("content-type", "application/json"),
                Header::new("x-trace", "1"),
            ],
            body: Bytes::from_static(b"{\"a\":1}"),
        }
    }

    #[test]
    fn test_body_is_base64_in_json() {
        let json = serde_json::to_value(request()).unwrap();
        assert_eq!(json["body"], "eyJhIjoxfQ==");
        assert_eq!(json["headers"][0]["name"], "content-type");
    }

    #[test]
    fn test_edit_applies_only_present_fields() {
        let mut snapshot = request();
        snapshot.apply(&EditedPayload {
            url: Some("https://api.test/other".to_string()),
            ..Default::default()
        });

        assert_eq!(snapshot.method, "POST");
        assert_eq!(snapshot.url, "https://api.test/other");
        assert_eq!(snapshot.headers.len(), 2);
    }

    #[test]
    fn test_edit_from_operator_json() {
        let edit: EditedPayload =
            serde_json::from_str(r#"{"status": 418, "body": "dGVhcG90"}"#).unwrap();
        assert_eq!(edit.status, Some(418));
        assert_eq!(edit.body.as_deref(), Some(&b"teapot"[..]));
        assert!(edit.headers.is_none());
        assert!(edit.touches_framing());

        let empty: EditedPayload = serde_json::from_str("{}").unwrap();
        assert!(!empty.touches_framing());
    }

    #[test]
    fn test_edit_headers_in_map_form() {
        let edit: EditedPayload = serde_json::from_str(
            r#"{"headers": {"X-Test": "1", "Set-Cookie": ["a=1", "b=2"]}}"#,
        )
        .unwrap();
        assert_eq!(
            edit.headers.unwrap(),
            vec![
                Header::new("X-Test", "1"),
                Header::new("Set-Cookie", "a=1"),
                Header::new("Set-Cookie", "b=2"),
            ]
        );
    }

    #[test]
    fn test_edit_headers_in_list_form() {
        let edit: EditedPayload =
            serde_json::from_str(r#"{"headers": [{"name": "X-Test", "value": "1"}]}"#).unwrap();
        assert_eq!(edit.headers.unwrap(), vec![Header::new("X-Test", "1")]);

        let edit: EditedPayload = serde_json::from_str(r#"{"headers": null}"#).unwrap();
        assert!(edit.headers.is_none());

        let result: Result<EditedPayload, _> = serde_json::from_str(r#"{"headers": "X-Test"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let result: Result<EditedPayload, _> = serde_json::from_str(r#"{"body": "***"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_header_lookup_case_insensitive() {
        let snapshot = request();
        assert_eq!(snapshot.header("Content-Type"), Some("application/json"));
        assert_eq!(snapshot.header("missing"), None);
    }

    #[test]
    fn test_header_map_conversion_keeps_duplicates() {
        let headers = vec![
            Header::new("Set-Cookie", "a=1"),
            Header::new("set-cookie", "b=2"),
        ];
        let map = headers_to_map(&headers).unwrap();
        assert_eq!(map.get_all("set-cookie").iter().count(), 2);

        let back = headers_from_map(&map);
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].name, "set-cookie");
    }

    #[test]
    fn test_invalid_header_name_rejected() {
        assert!(headers_to_map(&[Header::new("bad header", "x")]).is_err());
    }
}
