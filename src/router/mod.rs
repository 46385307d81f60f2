//! Ordered route table: first match wins, names index routes for removal and URL generation.

mod route;

pub use route::Route;

use crate::error::ConfigError;
use axum::http::Method;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// A route parameter: a single segment or, for `*glob` segments, a list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Str(String),
    List(Vec<String>),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            ParamValue::List(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Str(s) => Value::String(s.clone()),
            ParamValue::List(l) => Value::Array(l.iter().cloned().map(Value::String).collect()),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Str(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Str(s)
    }
}

pub type ParamMap = BTreeMap<String, ParamValue>;

/// Build a `ParamMap` from string pairs.
pub fn params<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> ParamMap {
    pairs.into_iter().map(|(k, v)| (k.to_string(), ParamValue::from(v))).collect()
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
pub fn encode(s: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len() * 3);
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => out.push(b as char),
            _ => {
                out.push('%');
                out.push(HEX[(b >> 4) as usize] as char);
                out.push(HEX[(b & 0xF) as usize] as char);
            }
        }
    }
    out
}

/// Percent-decode a path segment. Invalid escapes are kept verbatim.
pub fn decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(n) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(n);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Which verbs `resource` registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResourceStyle {
    /// GET-only routes, mutations under `/create`, `/:id/update`, `/:id/destroy`.
    Url,
    /// Proper verbs: POST create, PUT update, DELETE destroy.
    Method,
    #[default]
    Both,
}

/// A matched route plus its params.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    pub params: ParamMap,
}

impl RouteMatch<'_> {
    pub fn controller(&self) -> Option<&str> {
        self.params.get("controller").and_then(ParamValue::as_str)
    }

    pub fn action(&self) -> Option<&str> {
        self.params.get("action").and_then(ParamValue::as_str)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Router {
    routes: Vec<Route>,
    names: HashMap<String, usize>,
    next_id: usize,
}

/// Handle to a just-registered route for naming and defaults.
pub struct RouteRef<'a> {
    router: &'a mut Router,
    id: usize,
}

impl RouteRef<'_> {
    fn route(&mut self) -> Option<&mut Route> {
        let id = self.id;
        self.router.routes.iter_mut().find(|r| r.id == id)
    }

    /// Name the route for `remove` and `url_for`.
    pub fn named(mut self, name: &str) -> Result<Self, ConfigError> {
        if self.router.names.contains_key(name) {
            return Err(ConfigError::Duplicate(format!("route {}", name)));
        }
        if let Some(r) = self.route() {
            r.name = Some(name.to_string());
        }
        self.router.names.insert(name.to_string(), self.id);
        Ok(self)
    }

    pub fn default_param(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        let value = value.into();
        if let Some(r) = self.route() {
            r.defaults.insert(key.to_string(), value);
        }
        self
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn add(&mut self, methods: Vec<Method>, pattern: &str, target: &str) -> Result<RouteRef<'_>, ConfigError> {
        let mut route = Route::new(methods, pattern, target)?;
        route.id = self.next_id;
        self.next_id += 1;
        tracing::debug!(pattern = %pattern, target = %target, methods = ?route.methods, "route");
        let id = route.id;
        self.routes.push(route);
        Ok(RouteRef { router: self, id })
    }

    pub fn get(&mut self, pattern: &str, target: &str) -> Result<RouteRef<'_>, ConfigError> {
        self.add(vec![Method::GET], pattern, target)
    }

    pub fn post(&mut self, pattern: &str, target: &str) -> Result<RouteRef<'_>, ConfigError> {
        self.add(vec![Method::POST], pattern, target)
    }

    pub fn put(&mut self, pattern: &str, target: &str) -> Result<RouteRef<'_>, ConfigError> {
        self.add(vec![Method::PUT], pattern, target)
    }

    pub fn patch(&mut self, pattern: &str, target: &str) -> Result<RouteRef<'_>, ConfigError> {
        self.add(vec![Method::PATCH], pattern, target)
    }

    pub fn delete(&mut self, pattern: &str, target: &str) -> Result<RouteRef<'_>, ConfigError> {
        self.add(vec![Method::DELETE], pattern, target)
    }

    pub fn any(&mut self, pattern: &str, target: &str) -> Result<RouteRef<'_>, ConfigError> {
        self.add(Vec::new(), pattern, target)
    }

    /// Conventional CRUD routes under `path` for `controller`, named `{path}.{action}`.
    pub fn resource(&mut self, path: &str, controller: &str, style: ResourceStyle) -> Result<(), ConfigError> {
        let base = format!("/{}", path.trim_matches('/'));
        let member = format!("{}/:id", base);
        let url = style != ResourceStyle::Method;
        let verbs = style != ResourceStyle::Url;
        let mut table: Vec<(Method, String, &str)> = vec![
            (Method::GET, base.clone(), "index"),
            (Method::GET, format!("{}/count", base), "count"),
            (Method::GET, format!("{}/add", base), "add"),
        ];
        if url {
            table.push((Method::GET, format!("{}/create", base), "create"));
        }
        if verbs {
            table.push((Method::POST, base.clone(), "create"));
        }
        table.push((Method::GET, member.clone(), "show"));
        table.push((Method::GET, format!("{}/edit", member), "edit"));
        if url {
            table.push((Method::GET, format!("{}/update", member), "update"));
        }
        if verbs {
            table.push((Method::PUT, member.clone(), "update"));
        }
        if url {
            table.push((Method::GET, format!("{}/destroy", member), "destroy"));
        }
        if verbs {
            table.push((Method::DELETE, member.clone(), "destroy"));
        }
        let prefix = path.trim_matches('/').replace('/', ".");
        for (method, pattern, action) in table {
            let name = format!("{}.{}", prefix, action);
            let taken = self.names.contains_key(&name);
            let r = self.add(vec![method], &format!("{}(.:format)", pattern), &format!("{}#{}", controller, action))?;
            if !taken {
                r.named(&name)?;
            }
        }
        tracing::info!(path = %base, controller = %controller, style = ?style, "resource routes");
        Ok(())
    }

    /// Delete a route by name.
    pub fn remove(&mut self, name: &str) -> Option<Route> {
        let id = self.names.remove(name)?;
        let pos = self.routes.iter().position(|r| r.id == id)?;
        Some(self.routes.remove(pos))
    }

    pub fn by_name(&self, name: &str) -> Option<&Route> {
        let id = *self.names.get(name)?;
        self.routes.iter().find(|r| r.id == id)
    }

    /// First route accepting `method` whose pattern matches `path`.
    pub fn match_route(&self, path: &str, method: &Method) -> Option<RouteMatch<'_>> {
        self.routes.iter().find_map(|route| {
            if !route.accepts(method) {
                return None;
            }
            route.captures(path).map(|params| RouteMatch { route, params })
        })
    }

    pub fn first(&self, path: &str, method: &Method) -> Option<ParamMap> {
        self.match_route(path, method).map(|m| m.params)
    }

    /// Params of every matching route, in registration order.
    pub fn all(&self, path: &str, method: &Method) -> Vec<ParamMap> {
        self.routes
            .iter()
            .filter(|r| r.accepts(method))
            .filter_map(|r| r.captures(path))
            .collect()
    }

    /// Reverse routing: the first route whose target fits `params` and whose
    /// required segments are all present. Unused params become the query
    /// string when `include_query` is set.
    pub fn url(&self, params: &ParamMap, include_query: bool) -> Option<String> {
        self.routes
            .iter()
            .filter(|r| r.targets(params))
            .find_map(|r| r.path_for(params))
            .map(|(path, used)| with_query(path, params, &used, include_query))
    }

    /// URL of a named route.
    pub fn url_for(&self, name: &str, params: &ParamMap, include_query: bool) -> Option<String> {
        let (path, used) = self.by_name(name)?.path_for(params)?;
        Some(with_query(path, params, &used, include_query))
    }
}

fn with_query(mut path: String, params: &ParamMap, used: &[String], include_query: bool) -> String {
    if !include_query {
        return path;
    }
    let mut pairs = Vec::new();
    for (k, v) in params {
        if k == "controller" || k == "action" || used.contains(k) {
            continue;
        }
        match v {
            ParamValue::Str(s) => pairs.push(format!("{}={}", encode(k), encode(s))),
            ParamValue::List(l) => {
                for s in l {
                    pairs.push(format!("{}={}", encode(k), encode(s)));
                }
            }
        }
    }
    if !pairs.is_empty() {
        path.push('?');
        path.push_str(&pairs.join("&"));
    }
    path
}
