//! Shared application state handed to every request. The route table is reloadable at runtime.

use crate::auth::Authenticator;
use crate::config::Settings;
use crate::controller::ControllerDef;
use crate::format::FormatRegistry;
use crate::orm::Schema;
use crate::render::RendererRegistry;
use crate::router::Router;
use crate::session::SessionStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    /// Routes may be removed by name while serving.
    pub router: Arc<RwLock<Router>>,
    pub controllers: Arc<HashMap<String, Arc<ControllerDef>>>,
    pub formats: Arc<FormatRegistry>,
    pub renderers: Arc<RendererRegistry>,
    pub sessions: Arc<dyn SessionStore>,
    pub auth: Arc<Authenticator>,
    pub settings: Arc<Settings>,
    pub schema: Option<Schema>,
}

impl AppState {
    pub fn controller(&self, name: &str) -> Option<Arc<ControllerDef>> {
        self.controllers.get(name).cloned()
    }
}
