//! Route patterns: `:name` segments, `*glob` segments, `( ... )` optional groups.
//!
//! `/user/:id(.:format)` compiles to `^/user/([^/.]+)(?:\.([^/.]+))?/?$`.

use crate::error::ConfigError;
use crate::router::{decode, encode, ParamMap, ParamValue};
use axum::http::Method;
use regex::Regex;

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
    Glob(String),
    Optional(Vec<Segment>),
}

fn parse_segments(pattern: &str) -> Result<Vec<Segment>, ConfigError> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut pos = 0;
    let segs = parse_group(pattern, &chars, &mut pos, 0)?;
    if pos < chars.len() {
        return Err(ConfigError::InvalidPattern {
            pattern: pattern.into(),
            reason: "unbalanced ')'".into(),
        });
    }
    Ok(segs)
}

fn parse_group(pattern: &str, chars: &[char], pos: &mut usize, depth: usize) -> Result<Vec<Segment>, ConfigError> {
    let mut out = Vec::new();
    let mut literal = String::new();
    while *pos < chars.len() {
        let c = chars[*pos];
        match c {
            '(' => {
                *pos += 1;
                if !literal.is_empty() {
                    out.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                let inner = parse_group(pattern, chars, pos, depth + 1)?;
                out.push(Segment::Optional(inner));
            }
            ')' => {
                if depth == 0 {
                    return Err(ConfigError::InvalidPattern {
                        pattern: pattern.into(),
                        reason: "unbalanced ')'".into(),
                    });
                }
                *pos += 1;
                if !literal.is_empty() {
                    out.push(Segment::Literal(literal));
                }
                return Ok(out);
            }
            ':' | '*' => {
                *pos += 1;
                let start = *pos;
                while *pos < chars.len() && (chars[*pos].is_ascii_alphanumeric() || chars[*pos] == '_') {
                    *pos += 1;
                }
                let name: String = chars[start..*pos].iter().collect();
                if name.is_empty() {
                    return Err(ConfigError::InvalidPattern {
                        pattern: pattern.into(),
                        reason: format!("empty parameter name at {}", start),
                    });
                }
                if !literal.is_empty() {
                    out.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                out.push(if c == ':' { Segment::Param(name) } else { Segment::Glob(name) });
            }
            _ => {
                literal.push(c);
                *pos += 1;
            }
        }
    }
    if depth > 0 {
        return Err(ConfigError::InvalidPattern {
            pattern: pattern.into(),
            reason: "unclosed '('".into(),
        });
    }
    if !literal.is_empty() {
        out.push(Segment::Literal(literal));
    }
    Ok(out)
}

fn to_regex(segs: &[Segment], re: &mut String, keys: &mut Vec<(String, bool)>) {
    for s in segs {
        match s {
            Segment::Literal(l) => re.push_str(&regex::escape(l)),
            Segment::Param(name) => {
                re.push_str("([^/.]+)");
                keys.push((name.clone(), false));
            }
            Segment::Glob(name) => {
                re.push_str("(.+?)");
                keys.push((name.clone(), true));
            }
            Segment::Optional(inner) => {
                re.push_str("(?:");
                to_regex(inner, re, keys);
                re.push_str(")?");
            }
        }
    }
}

/// Render segments from params. Optional groups render only when every
/// parameter inside them is present.
fn render(segs: &[Segment], params: &ParamMap, used: &mut Vec<String>) -> Option<String> {
    let mut out = String::new();
    for s in segs {
        match s {
            Segment::Literal(l) => out.push_str(l),
            Segment::Param(name) => {
                let v = params.get(name)?.as_str()?;
                out.push_str(&encode(v));
                used.push(name.clone());
            }
            Segment::Glob(name) => {
                let parts: Vec<String> = match params.get(name)? {
                    ParamValue::Str(s) => vec![encode(s)],
                    ParamValue::List(l) => l.iter().map(|p| encode(p)).collect(),
                };
                out.push_str(&parts.join("/"));
                used.push(name.clone());
            }
            Segment::Optional(inner) => {
                let mut inner_used = Vec::new();
                if let Some(r) = render(inner, params, &mut inner_used) {
                    out.push_str(&r);
                    used.extend(inner_used);
                }
            }
        }
    }
    Some(out)
}

#[derive(Clone, Debug)]
pub struct Route {
    pub(crate) id: usize,
    pub name: Option<String>,
    pub pattern: String,
    /// Empty means any method.
    pub methods: Vec<Method>,
    pub controller: Option<String>,
    pub action: Option<String>,
    pub defaults: ParamMap,
    regex: Regex,
    keys: Vec<(String, bool)>,
    segments: Vec<Segment>,
}

impl Route {
    /// `target` is `Controller#action` or `Controller`; either part may instead
    /// come from `:controller` / `:action` segments.
    pub fn new(methods: Vec<Method>, pattern: &str, target: &str) -> Result<Route, ConfigError> {
        let segments = parse_segments(pattern)?;
        let mut re = String::from("^");
        let mut keys = Vec::new();
        to_regex(&segments, &mut re, &mut keys);
        if !re.ends_with('/') {
            re.push_str("/?");
        }
        re.push('$');
        let regex = Regex::new(&re).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.into(),
            reason: e.to_string(),
        })?;
        let (controller, action) = match target.split_once('#') {
            Some((c, a)) => (c, Some(a)),
            None => (target, None),
        };
        Ok(Route {
            id: 0,
            name: None,
            pattern: pattern.to_string(),
            methods,
            controller: Some(controller).filter(|c| !c.is_empty()).map(String::from),
            action: action.filter(|a| !a.is_empty()).map(String::from),
            defaults: ParamMap::new(),
            regex,
            keys,
            segments,
        })
    }

    pub fn accepts(&self, method: &Method) -> bool {
        self.methods.is_empty()
            || self.methods.contains(method)
            || (*method == Method::HEAD && self.methods.contains(&Method::GET))
    }

    /// Params for `path`: defaults, then the target, then captured segments.
    pub fn captures(&self, path: &str) -> Option<ParamMap> {
        let caps = self.regex.captures(path)?;
        let mut params = self.defaults.clone();
        if let Some(c) = &self.controller {
            params.insert("controller".into(), ParamValue::Str(c.clone()));
        }
        if let Some(a) = &self.action {
            params.insert("action".into(), ParamValue::Str(a.clone()));
        }
        for (i, (name, glob)) in self.keys.iter().enumerate() {
            let Some(m) = caps.get(i + 1) else { continue };
            let value = if *glob {
                ParamValue::List(m.as_str().split('/').map(decode).collect())
            } else {
                ParamValue::Str(decode(m.as_str()))
            };
            params.insert(name.clone(), value);
        }
        Some(params)
    }

    /// Whether this route can produce a URL for `params`.
    pub(crate) fn targets(&self, params: &ParamMap) -> bool {
        let same = |key: &str, fixed: &Option<String>| match (fixed, params.get(key).and_then(ParamValue::as_str)) {
            (Some(f), Some(p)) => f == p,
            (Some(_), None) => false,
            (None, _) => true,
        };
        same("controller", &self.controller) && same("action", &self.action)
    }

    /// Path for `params`, or `None` when a required segment is missing.
    pub fn path_for(&self, params: &ParamMap) -> Option<(String, Vec<String>)> {
        let mut used = Vec::new();
        let path = render(&self.segments, params, &mut used)?;
        Some((path, used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> ParamValue {
        ParamValue::Str(v.into())
    }

    #[test]
    fn format_suffix_is_optional() {
        let r = Route::new(vec![Method::GET], "/user/:id(.:format)", "User#show").unwrap();
        let p = r.captures("/user/42.json").unwrap();
        assert_eq!(p.get("id"), Some(&s("42")));
        assert_eq!(p.get("format"), Some(&s("json")));
        assert_eq!(p.get("controller"), Some(&s("User")));
        assert_eq!(p.get("action"), Some(&s("show")));
        let p = r.captures("/user/42").unwrap();
        assert!(!p.contains_key("format"));
        assert!(r.captures("/user/42/").is_some());
        assert!(r.captures("/user").is_none());
    }

    #[test]
    fn globs_capture_lists() {
        let r = Route::new(vec![], "/files/*path", "Files#get").unwrap();
        let p = r.captures("/files/a/b%20c/d.txt").unwrap();
        assert_eq!(
            p.get("path"),
            Some(&ParamValue::List(vec!["a".into(), "b c".into(), "d.txt".into()]))
        );
    }

    #[test]
    fn action_segment_fills_target() {
        let r = Route::new(vec![], "/admin/:action", "Admin").unwrap();
        let p = r.captures("/admin/stats").unwrap();
        assert_eq!(p.get("action"), Some(&s("stats")));
    }

    #[test]
    fn unbalanced_groups_are_rejected() {
        assert!(Route::new(vec![], "/a(/:b", "A#b").is_err());
        assert!(Route::new(vec![], "/a)/:b", "A#b").is_err());
        assert!(Route::new(vec![], "/a/:", "A#b").is_err());
    }

    #[test]
    fn head_matches_get_routes() {
        let r = Route::new(vec![Method::GET], "/", "Home#index").unwrap();
        assert!(r.accepts(&Method::HEAD));
        assert!(!r.accepts(&Method::POST));
    }
}
