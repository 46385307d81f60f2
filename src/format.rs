//! Response formats and `Accept` negotiation.

use crate::error::AppError;
use serde_json::{Map, Value};

/// Serializer for a non-template format. Receives the content and the request params.
pub type Formatter = fn(&Value, &Map<String, Value>) -> Result<Vec<u8>, AppError>;

#[derive(Clone)]
pub enum FormatKind {
    /// Rendered through a template engine.
    Template,
    /// Rendered through a report engine; output may be binary.
    Report,
    Serialize(Formatter),
}

#[derive(Clone)]
pub struct Format {
    pub name: String,
    /// First entry is the preferred content type.
    pub content_types: Vec<String>,
    pub kind: FormatKind,
}

impl Format {
    pub fn new(name: &str, content_types: &[&str], kind: FormatKind) -> Self {
        Format {
            name: name.to_string(),
            content_types: content_types.iter().map(|s| s.to_string()).collect(),
            kind,
        }
    }

    pub fn preferred(&self) -> &str {
        self.content_types.first().map(String::as_str).unwrap_or("application/octet-stream")
    }

    pub fn is_serializer(&self) -> bool {
        matches!(self.kind, FormatKind::Serialize(_))
    }
}

/// Outcome of negotiation: the format and the content type to send.
#[derive(Clone)]
pub struct Negotiated {
    pub format: Format,
    pub content_type: String,
}

#[derive(Clone)]
pub struct FormatRegistry {
    formats: Vec<Format>,
}

const REPORTS: &[(&str, &str)] = &[
    ("xhtml", "application/xhtml+xml"),
    ("pdf", "application/pdf"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("pptx", "application/vnd.openxmlformats-officedocument.presentationml.presentation"),
    ("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
    ("rtf", "application/rtf"),
    ("xls", "application/vnd.ms-excel"),
    ("csv", "text/csv"),
    ("odt", "application/vnd.oasis.opendocument.text"),
    ("ods", "application/vnd.oasis.opendocument.spreadsheet"),
    ("xml4swf", "application/x-xml4swf"),
    ("jpeg", "image/jpeg"),
];

impl Default for FormatRegistry {
    fn default() -> Self {
        let mut formats = vec![
            Format::new("html", &["text/html"], FormatKind::Template),
            Format::new("txt", &["text/plain"], FormatKind::Serialize(to_txt)),
            Format::new("json", &["application/json", "text/json"], FormatKind::Serialize(to_json)),
            Format::new("xml", &["application/xml", "text/xml"], FormatKind::Serialize(to_xml)),
            Format::new(
                "js",
                &["application/javascript", "text/javascript"],
                FormatKind::Serialize(to_js),
            ),
        ];
        for (name, ct) in REPORTS {
            formats.push(Format::new(name, &[ct], FormatKind::Report));
        }
        FormatRegistry { formats }
    }
}

struct MediaRange {
    kind: String,
    sub: String,
    q: f32,
}

fn parse_accept(accept: &str) -> Vec<MediaRange> {
    let mut ranges: Vec<MediaRange> = accept
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split(';');
            let media = pieces.next()?.trim().to_lowercase();
            let (kind, sub) = media.split_once('/')?;
            let mut q = 1.0;
            for p in pieces {
                if let Some(v) = p.trim().strip_prefix("q=") {
                    q = v.trim().parse().unwrap_or(0.0);
                }
            }
            (q > 0.0).then(|| MediaRange {
                kind: kind.to_string(),
                sub: sub.to_string(),
                q,
            })
        })
        .collect();
    ranges.sort_by(|a, b| b.q.partial_cmp(&a.q).unwrap_or(std::cmp::Ordering::Equal));
    ranges
}

impl FormatRegistry {
    pub fn register(&mut self, format: Format) {
        self.formats.retain(|f| f.name != format.name);
        self.formats.push(format);
    }

    pub fn get(&self, name: &str) -> Option<&Format> {
        self.formats.iter().find(|f| f.name == name)
    }

    /// Pick a format from `allowed` (in declared order) for the `Accept` header.
    /// A missing header counts as `*/*`; wildcards yield the format's preferred type.
    pub fn negotiate(&self, accept: Option<&str>, allowed: &[String]) -> Option<Negotiated> {
        let candidates: Vec<&Format> = allowed.iter().filter_map(|n| self.get(n)).collect();
        let accept = accept.map(str::trim).filter(|a| !a.is_empty()).unwrap_or("*/*");
        for range in parse_accept(accept) {
            for f in &candidates {
                if range.kind == "*" {
                    return Some(self.pick(f, None));
                }
                for ct in &f.content_types {
                    let Some((kind, sub)) = ct.split_once('/') else { continue };
                    if range.kind == kind && range.sub == "*" {
                        return Some(self.pick(f, None));
                    }
                    if range.kind == kind && range.sub == sub {
                        return Some(self.pick(f, Some(ct)));
                    }
                }
            }
        }
        None
    }

    /// A format named explicitly (URL suffix or `format` param), if allowed.
    pub fn by_name(&self, name: &str, allowed: &[String]) -> Option<Negotiated> {
        if !allowed.iter().any(|a| a == name) {
            return None;
        }
        self.get(name).map(|f| self.pick(f, None))
    }

    fn pick(&self, format: &Format, content_type: Option<&String>) -> Negotiated {
        Negotiated {
            content_type: content_type
                .cloned()
                .unwrap_or_else(|| format.preferred().to_string()),
            format: format.clone(),
        }
    }
}

fn to_txt(content: &Value, _params: &Map<String, Value>) -> Result<Vec<u8>, AppError> {
    Ok(match content {
        Value::String(s) => s.clone().into_bytes(),
        Value::Null => Vec::new(),
        other => serde_json::to_vec_pretty(other).map_err(|e| AppError::Render(e.to_string()))?,
    })
}

fn to_json(content: &Value, _params: &Map<String, Value>) -> Result<Vec<u8>, AppError> {
    serde_json::to_vec(content).map_err(|e| AppError::Render(e.to_string()))
}

fn is_js_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.')
}

/// JSONP when a valid `callback` param is present, plain JSON otherwise.
fn to_js(content: &Value, params: &Map<String, Value>) -> Result<Vec<u8>, AppError> {
    let json = to_json(content, params)?;
    match params.get("callback").and_then(Value::as_str) {
        Some(cb) if is_js_identifier(cb) => {
            let mut out = Vec::with_capacity(json.len() + cb.len() + 3);
            out.extend_from_slice(cb.as_bytes());
            out.push(b'(');
            out.extend_from_slice(&json);
            out.extend_from_slice(b");");
            Ok(out)
        }
        _ => Ok(json),
    }
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn element_name(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' { c } else { '_' })
        .collect();
    if name.is_empty() || !name.starts_with(|c: char| c.is_alphabetic() || c == '_') {
        name.insert(0, '_');
    }
    name
}

fn write_xml(out: &mut String, name: &str, v: &Value) {
    match v {
        Value::Null => out.push_str(&format!("<{}/>", name)),
        Value::Object(map) => {
            out.push_str(&format!("<{}>", name));
            for (k, child) in map {
                write_xml(out, &element_name(k), child);
            }
            out.push_str(&format!("</{}>", name));
        }
        Value::Array(items) => {
            out.push_str(&format!("<{}>", name));
            for item in items {
                write_xml(out, "item", item);
            }
            out.push_str(&format!("</{}>", name));
        }
        Value::String(s) => out.push_str(&format!("<{0}>{1}</{0}>", name, escape_xml(s))),
        other => out.push_str(&format!("<{0}>{1}</{0}>", name, other)),
    }
}

fn to_xml(content: &Value, _params: &Map<String, Value>) -> Result<Vec<u8>, AppError> {
    let mut out = String::from(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    write_xml(&mut out, "response", content);
    Ok(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn allowed(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn json_accept_picks_json() {
        let reg = FormatRegistry::default();
        let n = reg.negotiate(Some("application/json"), &allowed(&["html", "json"])).unwrap();
        assert_eq!(n.format.name, "json");
        assert_eq!(n.content_type, "application/json");
    }

    #[test]
    fn wildcard_picks_first_declared() {
        let reg = FormatRegistry::default();
        let n = reg.negotiate(Some("*/*"), &allowed(&["html", "json"])).unwrap();
        assert_eq!(n.format.name, "html");
        assert_eq!(n.content_type, "text/html");
        let n = reg.negotiate(None, &allowed(&["json", "html"])).unwrap();
        assert_eq!(n.content_type, "application/json");
    }

    #[test]
    fn q_values_order_preferences() {
        let reg = FormatRegistry::default();
        let n = reg
            .negotiate(Some("text/html;q=0.5, application/json"), &allowed(&["html", "json"]))
            .unwrap();
        assert_eq!(n.format.name, "json");
        let n = reg.negotiate(Some("text/*"), &allowed(&["json", "txt"])).unwrap();
        assert_eq!(n.format.name, "txt");
    }

    #[test]
    fn unsatisfiable_accept_is_none() {
        let reg = FormatRegistry::default();
        assert!(reg.negotiate(Some("image/png"), &allowed(&["html", "json"])).is_none());
        assert!(reg.negotiate(Some("application/json;q=0"), &allowed(&["json"])).is_none());
    }

    #[test]
    fn jsonp_needs_a_valid_callback() {
        let mut params = Map::new();
        params.insert("callback".into(), json!("cb.done"));
        assert_eq!(to_js(&json!({"a": 1}), &params).unwrap(), b"cb.done({\"a\":1});".to_vec());
        params.insert("callback".into(), json!("alert(1)//"));
        assert_eq!(to_js(&json!({"a": 1}), &params).unwrap(), b"{\"a\":1}".to_vec());
    }

    #[test]
    fn xml_escapes_and_nests() {
        let xml = String::from_utf8(to_xml(&json!({"name": "a<b", "tags": ["x"], "n": null}), &Map::new()).unwrap()).unwrap();
        assert_eq!(
            xml,
            r#"<?xml version="1.0" encoding="UTF-8"?><response><n/><name>a&lt;b</name><tags><item>x</item></tags></response>"#
        );
    }
}
