use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    HeaderMap, Method, Request, Uri,
    header::{self, HeaderName, HeaderValue},
};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::id;

/// Durable representation of one captured HTTP request.
///
/// The `headers`, `cookies` and `query_params` fields are self-describing
/// JSON blobs so the storage layer never needs to understand their shape.
/// The JSON serialization of the record itself (the capture endpoint's
/// response body) renders blob fields as base64 strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: Ulid,
    pub method: String,
    pub path: String,
    #[serde(with = "base64_blob")]
    pub headers: Vec<u8>,
    #[serde(with = "base64_blob_opt", default)]
    pub cookies: Option<Vec<u8>>,
    #[serde(with = "base64_blob")]
    pub query_params: Vec<u8>,
    #[serde(with = "base64_blob_opt", default)]
    pub body: Option<Vec<u8>>,
    pub recorded_at_unix_ms: i64,
}

/// One cookie pair from the inbound `Cookie` header, kept for audit only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredHeaderValue {
    Text(String),
    Bytes(Vec<u8>),
}

/// Converts a live inbound request into a [`Record`].
///
/// The body is best-effort: a failed read degrades to an empty body instead
/// of rejecting the capture. Header serialization failure is a hard error.
pub async fn capture<B>(req: Request<B>) -> anyhow::Result<Record>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::warn!("read request body failed, capturing empty body: {err}");
            Bytes::new()
        }
    };

    let headers = serialize_headers(&parts.headers)?;

    let cookies = parse_request_cookies(&parts.headers);
    let cookies = if cookies.is_empty() {
        None
    } else {
        Some(serde_json::to_vec(&cookies).context("serialize request cookies")?)
    };

    let id = id::next_id();
    Ok(Record {
        recorded_at_unix_ms: id::id_timestamp_unix_ms(id),
        id,
        method: parts.method.as_str().to_owned(),
        path: parts.uri.path().to_owned(),
        headers,
        cookies,
        query_params: serialize_query(parts.uri.query()),
        body: if body_bytes.is_empty() {
            None
        } else {
            Some(body_bytes.to_vec())
        },
    })
}

impl Record {
    /// Reconstructs a dispatchable request against `target_host`.
    ///
    /// The URL is `target_host` + stored path verbatim, with the decoded
    /// query string appended after `?` when non-empty. Stored headers are
    /// re-added in stored order; cookies are never re-attached. The body is
    /// a one-shot stream, consumed by the first dispatch.
    pub fn to_http_request(&self, target_host: &str) -> anyhow::Result<Request<Full<Bytes>>> {
        let method = Method::from_bytes(self.method.as_bytes())
            .with_context(|| format!("invalid stored method `{}`", self.method))?;

        let mut url = format!("{target_host}{}", self.path);
        let query: String =
            serde_json::from_slice(&self.query_params).context("deserialize stored query string")?;
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }
        let uri: Uri = url
            .parse()
            .with_context(|| format!("invalid replay url `{url}`"))?;

        let body = self
            .body
            .as_deref()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(body))
            .context("build replay request")?;

        let outgoing = request.headers_mut();
        for (name, values) in deserialize_headers(&self.headers)? {
            for value in values {
                outgoing.append(name.clone(), value);
            }
        }

        Ok(request)
    }

    /// Decodes the audit-only cookie field. `None` means the original
    /// request carried no cookies, which is distinct from an empty list.
    pub fn decoded_cookies(&self) -> anyhow::Result<Option<Vec<StoredCookie>>> {
        self.cookies
            .as_deref()
            .map(|blob| serde_json::from_slice(blob).context("deserialize stored cookies"))
            .transpose()
    }
}

/// Serializes headers as an ordered list of `(name, [values...])` pairs,
/// preserving multi-value order. The `cookie` header lives in the record's
/// dedicated cookies field and the `host` header belongs to the capturing
/// listener, so neither is part of the replayable header set.
fn serialize_headers(headers: &HeaderMap) -> anyhow::Result<Vec<u8>> {
    let mut grouped: Vec<(String, Vec<StoredHeaderValue>)> = Vec::new();
    for (name, value) in headers {
        if *name == header::COOKIE || *name == header::HOST {
            continue;
        }
        let stored = match value.to_str() {
            Ok(text) => StoredHeaderValue::Text(text.to_owned()),
            Err(_) => StoredHeaderValue::Bytes(value.as_bytes().to_vec()),
        };
        match grouped.iter_mut().find(|(n, _)| n == name.as_str()) {
            Some((_, values)) => values.push(stored),
            None => grouped.push((name.as_str().to_owned(), vec![stored])),
        }
    }
    serde_json::to_vec(&grouped).context("serialize request headers")
}

fn deserialize_headers(blob: &[u8]) -> anyhow::Result<Vec<(HeaderName, Vec<HeaderValue>)>> {
    let parsed: Vec<(String, Vec<StoredHeaderValue>)> =
        serde_json::from_slice(blob).context("deserialize stored headers")?;

    let mut headers = Vec::with_capacity(parsed.len());
    for (name, values) in parsed {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid stored header name `{name}`"))?;
        let mut header_values = Vec::with_capacity(values.len());
        for value in values {
            let header_value = match value {
                StoredHeaderValue::Text(text) => HeaderValue::from_str(&text),
                StoredHeaderValue::Bytes(bytes) => HeaderValue::from_bytes(&bytes),
            }
            .with_context(|| format!("invalid stored value for header `{name}`"))?;
            header_values.push(header_value);
        }
        headers.push((header_name, header_values));
    }
    Ok(headers)
}

/// The query blob is always a valid JSON string; a request without a query
/// string encodes as `""`.
fn serialize_query(query: Option<&str>) -> Vec<u8> {
    serde_json::to_vec(query.unwrap_or("")).unwrap_or_else(|_| b"\"\"".to_vec())
}

fn parse_request_cookies(headers: &HeaderMap) -> Vec<StoredCookie> {
    let mut cookies = Vec::new();
    for value in headers.get_all(header::COOKIE) {
        let Ok(text) = value.to_str() else { continue };
        for pair in text.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            if name.is_empty() {
                continue;
            }
            cookies.push(StoredCookie {
                name: name.to_owned(),
                value: value.to_owned(),
            });
        }
    }
    cookies
}

mod base64_blob {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

mod base64_blob_opt {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?;
        text.map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}
