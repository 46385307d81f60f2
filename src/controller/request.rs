use crate::error::AppError;
use crate::router::ParamMap;
use axum::body::Bytes;
use axum::extract::{FromRequest, Query};
use axum::http::{header, HeaderMap, Method, Uri};
use axum::Form;
use serde_json::{Map, Value};

const OVERRIDE_HEADER: &str = "x-http-method-override";

/// Transport request with parsed query and body.
#[derive(Clone, Debug)]
pub struct Request {
    /// Effective method, after `_method` / `X-HTTP-Method-Override`.
    pub method: Method,
    pub original_method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub query: Map<String, Value>,
    pub body: Map<String, Value>,
    pub route: ParamMap,
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim().to_lowercase())
        .unwrap_or_default()
}

/// Repeated keys collect into arrays.
fn pairs_to_map(pairs: Vec<(String, String)>) -> Map<String, Value> {
    let mut out = Map::new();
    for (k, v) in pairs {
        let v = Value::String(v);
        match out.get_mut(&k) {
            Some(Value::Array(items)) => items.push(v),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, v]);
            }
            None => {
                out.insert(k, v);
            }
        }
    }
    out
}

fn parse_json_body(bytes: &[u8]) -> Result<Map<String, Value>, AppError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| AppError::Validation(format!("malformed JSON body: {}", e)))?;
    Ok(match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("_body".into(), other);
            map
        }
    })
}

fn override_method(headers: &HeaderMap, body: &Map<String, Value>, query: &Map<String, Value>) -> Option<Method> {
    let raw = headers
        .get(OVERRIDE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| body.get("_method").and_then(Value::as_str).map(str::to_string))
        .or_else(|| query.get("_method").and_then(Value::as_str).map(str::to_string))?;
    Method::from_bytes(raw.trim().to_uppercase().as_bytes()).ok()
}

impl Request {
    /// Read the transport request. A malformed JSON body is a validation error.
    pub async fn read(req: axum::extract::Request) -> Result<Request, AppError> {
        let original_method = req.method().clone();
        let uri = req.uri().clone();
        let headers = req.headers().clone();
        let query = match Query::<Vec<(String, String)>>::try_from_uri(&uri) {
            Ok(Query(pairs)) => pairs_to_map(pairs),
            Err(e) => return Err(AppError::BadRequest(e.body_text())),
        };
        let ct = content_type(&headers);
        let body = if ct == "application/json" || ct.ends_with("+json") {
            let bytes = Bytes::from_request(req, &())
                .await
                .map_err(|e| AppError::BadRequest(e.body_text()))?;
            parse_json_body(&bytes)?
        } else if ct == "application/x-www-form-urlencoded" && original_method != Method::GET {
            let Form(pairs) = Form::<Vec<(String, String)>>::from_request(req, &())
                .await
                .map_err(|e| AppError::Validation(e.body_text()))?;
            pairs_to_map(pairs)
        } else {
            Map::new()
        };
        let method = if original_method == Method::POST {
            override_method(&headers, &body, &query).unwrap_or(Method::POST)
        } else {
            original_method.clone()
        };
        Ok(Request {
            method,
            original_method,
            uri,
            headers,
            query,
            body,
            route: ParamMap::new(),
        })
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn accept(&self) -> Option<&str> {
        self.header(header::ACCEPT.as_str())
    }

    /// Body, then route params, then query params; later sources win.
    pub fn merged_params(&self) -> Map<String, Value> {
        let mut out = self.body.clone();
        for (k, v) in &self.route {
            out.insert(k.clone(), v.to_json());
        }
        for (k, v) in &self.query {
            out.insert(k.clone(), v.clone());
        }
        out
    }
}
