use crate::controller::{Context, Filter, Flow};
use crate::error::AppError;
use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};

const ALLOW_METHODS: &str = "GET, HEAD, POST, PUT, PATCH, DELETE, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Authorization, X-Requested-With, X-HTTP-Method-Override";

/// Adds `Access-Control-Allow-*` headers and answers preflight requests.
#[derive(Clone, Debug)]
pub struct CorsFilter {
    origin: HeaderValue,
}

impl CorsFilter {
    pub fn new(origin: &str) -> Result<Self, AppError> {
        let origin = HeaderValue::from_str(origin)
            .map_err(|_| AppError::Config(crate::error::ConfigError::Validation(format!("bad CORS origin {}", origin))))?;
        Ok(CorsFilter { origin })
    }

    /// The CORS headers, for responses produced outside a controller.
    pub fn headers(&self) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, self.origin.clone());
        h.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOW_METHODS));
        h.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOW_HEADERS));
        if self.origin != "*" {
            h.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
        h
    }
}

#[async_trait]
impl Filter for CorsFilter {
    async fn call(&self, ctx: &mut Context) -> Result<Flow, AppError> {
        for (name, value) in self.headers().iter() {
            ctx.set_header(name.clone(), value.clone());
        }
        if ctx.request.original_method == Method::OPTIONS {
            ctx.output(StatusCode::NO_CONTENT, "text/plain", Vec::new()).await;
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_only_for_specific_origins() {
        let any = CorsFilter::new("*").unwrap().headers();
        assert!(any.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());
        let one = CorsFilter::new("https://app.example").unwrap().headers();
        assert_eq!(one[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example");
        assert_eq!(one[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[test]
    fn rejects_unprintable_origins() {
        assert!(CorsFilter::new("bad\norigin").is_err());
    }
}
