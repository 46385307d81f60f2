//! Application assembly: routes, controllers, formats, renderers, sessions and the schema.

use crate::auth::{AccessFilter, Authenticator, Strategy};
use crate::config::Settings;
use crate::controller::{ControllerDef, CorsFilter};
use crate::dispatch::dispatch;
use crate::error::{AppError, ConfigError};
use crate::format::{Format, FormatRegistry};
use crate::orm::Schema;
use crate::render::{Renderer, RendererRegistry};
use crate::router::Router;
use crate::session::{MemorySessionStore, SessionStore};
use crate::state::AppState;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

pub struct App {
    settings: Settings,
    router: Router,
    controllers: HashMap<String, ControllerDef>,
    formats: FormatRegistry,
    renderers: RendererRegistry,
    sessions: Option<Arc<dyn SessionStore>>,
    auth: Authenticator,
    schema: Option<Schema>,
}

impl App {
    pub fn new(settings: Settings) -> Self {
        App {
            settings,
            router: Router::new(),
            controllers: HashMap::new(),
            formats: FormatRegistry::default(),
            renderers: RendererRegistry::new(),
            sessions: None,
            auth: Authenticator::new(),
            schema: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Register routes. Registration order is match order.
    pub fn routes<F>(mut self, init: F) -> Result<Self, ConfigError>
    where
        F: FnOnce(&mut Router) -> Result<(), ConfigError>,
    {
        init(&mut self.router)?;
        Ok(self)
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn controller(mut self, def: ControllerDef) -> Self {
        self.controllers.insert(def.name().to_string(), def);
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.formats.register(format);
        self
    }

    pub fn renderer(mut self, engine: &str, renderer: impl Renderer + 'static) -> Self {
        self.renderers.register(engine, renderer);
        self
    }

    /// Send a format (e.g. `pdf`) to a specific engine.
    pub fn render_format_with(mut self, format: &str, engine: &str) -> Self {
        self.renderers.use_for(format, engine);
        self
    }

    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    pub fn strategy(mut self, name: &str, strategy: impl Strategy + 'static) -> Self {
        self.auth.use_strategy(name, strategy);
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Every fixed route target must name a registered controller and action.
    fn check_routes(&self) -> Result<(), ConfigError> {
        for route in self.router.routes() {
            let Some(controller) = &route.controller else { continue };
            let def = self.controllers.get(controller).ok_or_else(|| ConfigError::MissingReference {
                kind: "controller",
                id: controller.clone(),
            })?;
            if let Some(action) = &route.action {
                if !def.has_action(action) {
                    return Err(ConfigError::MissingAction {
                        controller: controller.clone(),
                        action: action.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Validate the route table and freeze everything into shared state.
    pub fn build(self) -> Result<AppState, ConfigError> {
        self.check_routes()?;
        let cors = match &self.settings.cors_origin {
            Some(origin) => Some(Arc::new(CorsFilter::new(origin).map_err(|e| match e {
                AppError::Config(c) => c,
                other => ConfigError::Validation(other.to_string()),
            })?)),
            None => None,
        };
        let controllers = self
            .controllers
            .into_iter()
            .map(|(name, mut def)| {
                if let Some(access) = def.access() {
                    def.prepend_before(Arc::new(AccessFilter(access)));
                }
                if let Some(cors) = &cors {
                    def.prepend_before(cors.clone());
                }
                (name, Arc::new(def))
            })
            .collect::<HashMap<_, _>>();
        tracing::info!(
            routes = self.router.len(),
            controllers = controllers.len(),
            cors = cors.is_some(),
            "application built"
        );
        Ok(AppState {
            router: Arc::new(RwLock::new(self.router)),
            controllers: Arc::new(controllers),
            formats: Arc::new(self.formats),
            renderers: Arc::new(self.renderers),
            sessions: self
                .sessions
                .unwrap_or_else(|| Arc::new(MemorySessionStore::new())),
            auth: Arc::new(self.auth),
            settings: Arc::new(self.settings),
            schema: self.schema,
        })
    }

    /// An axum router sending every request through the dispatcher.
    pub fn into_router(self) -> Result<axum::Router, ConfigError> {
        let limit = self.settings.body_limit;
        let state = self.build()?;
        Ok(router_for(state, limit))
    }

    /// Bind `settings.bind` and serve until the process stops.
    pub async fn serve(self) -> Result<(), AppError> {
        let bind = self.settings.bind.clone();
        let router = self.into_router()?;
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .map_err(|e| AppError::Internal(format!("bind {}: {}", bind, e)))?;
        tracing::info!(addr = %bind, "listening");
        axum::serve(listener, router)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))
    }
}

pub fn router_for(state: AppState, body_limit: usize) -> axum::Router {
    axum::Router::new()
        .fallback(dispatch)
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(body_limit))
}
