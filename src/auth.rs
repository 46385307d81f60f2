//! Passport-style authentication over the session, plus controller access control.

use crate::controller::{BoxFuture, Context, Filter, Flow};
use crate::error::AppError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

const PASSPORT: &str = "passport";

/// Turns a request into a user profile. `Ok(None)` is a failed login, not an error.
#[async_trait]
pub trait Strategy: Send + Sync {
    async fn authenticate(&self, ctx: &Context) -> Result<Option<Value>, AppError>;
}

/// Username and password from request params, checked by a verify callback.
pub struct LocalStrategy {
    username_field: String,
    password_field: String,
    verify: Box<dyn Fn(String, String) -> BoxFuture<'static, Result<Option<Value>, AppError>> + Send + Sync>,
}

impl LocalStrategy {
    pub fn new<F, Fut>(verify: F) -> Self
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, AppError>> + Send + 'static,
    {
        LocalStrategy {
            username_field: "username".into(),
            password_field: "password".into(),
            verify: Box::new(move |u, p| Box::pin(verify(u, p))),
        }
    }

    pub fn fields(mut self, username: &str, password: &str) -> Self {
        self.username_field = username.to_string();
        self.password_field = password.to_string();
        self
    }
}

#[async_trait]
impl Strategy for LocalStrategy {
    async fn authenticate(&self, ctx: &Context) -> Result<Option<Value>, AppError> {
        let (Some(user), Some(pass)) = (ctx.param_str(&self.username_field), ctx.param_str(&self.password_field)) else {
            return Ok(None);
        };
        (self.verify)(user, pass).await
    }
}

/// Named strategies; a successful login stores the profile at `passport.user`.
#[derive(Clone, Default)]
pub struct Authenticator {
    strategies: HashMap<String, Arc<dyn Strategy>>,
}

impl Authenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_strategy(&mut self, name: &str, strategy: impl Strategy + 'static) {
        self.strategies.insert(name.to_string(), Arc::new(strategy));
    }

    pub fn has_strategy(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    pub async fn authenticate(&self, name: &str, ctx: &mut Context) -> Result<Option<Value>, AppError> {
        let strategy = self
            .strategies
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::Auth(format!("unknown strategy {}", name)))?;
        let profile = strategy.authenticate(ctx).await?;
        match &profile {
            Some(p) => {
                ctx.session.set(PASSPORT, json!({ "user": p }));
                tracing::info!(strategy = %name, "login");
            }
            None => tracing::debug!(strategy = %name, "login rejected"),
        }
        Ok(profile)
    }

    pub fn logout(ctx: &mut Context) {
        ctx.session.unset(PASSPORT);
    }

    pub fn current_user(ctx: &Context) -> Option<Value> {
        ctx.session.get(PASSPORT)?.get("user").cloned()
    }
}

impl Context {
    /// Run a named strategy of the application's authenticator.
    pub async fn authenticate(&mut self, strategy: &str) -> Result<Option<Value>, AppError> {
        let auth = self.state().auth.clone();
        auth.authenticate(strategy, self).await
    }

    pub fn current_user(&self) -> Option<Value> {
        Authenticator::current_user(self)
    }

    pub fn logout(&mut self) {
        Authenticator::logout(self)
    }
}

/// Per-controller gate checked before every action.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn allowed(&self, ctx: &Context, action: &str) -> bool;

    /// Where to send denied requests; `None` answers 403.
    fn login_url(&self) -> Option<String> {
        None
    }
}

/// Requires a logged-in user.
#[derive(Clone, Debug, Default)]
pub struct RequireLogin {
    pub login_url: Option<String>,
}

#[async_trait]
impl AccessControl for RequireLogin {
    async fn allowed(&self, ctx: &Context, _action: &str) -> bool {
        ctx.current_user().is_some()
    }

    fn login_url(&self) -> Option<String> {
        self.login_url.clone()
    }
}

/// Before-all filter wrapping a controller's `AccessControl`.
pub(crate) struct AccessFilter(pub(crate) Arc<dyn AccessControl>);

#[async_trait]
impl Filter for AccessFilter {
    async fn call(&self, ctx: &mut Context) -> Result<Flow, AppError> {
        let action = ctx.action().to_string();
        if self.0.allowed(ctx, &action).await {
            return Ok(Flow::Continue);
        }
        tracing::debug!(controller = %ctx.controller_name(), action = %action, "access denied");
        match self.0.login_url() {
            Some(url) => ctx.redirect(&url).await,
            None => {
                let target = format!("{}#{}", ctx.controller_name(), action);
                ctx.forbidden(&target).await
            }
        }
        Ok(Flow::Continue)
    }
}
