use crate::auth::AccessControl;
use crate::controller::{BoxFuture, Context, Flow, Phase};
use crate::error::AppError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A controller action.
#[async_trait]
pub trait Action: Send + Sync {
    async fn call(&self, ctx: &mut Context) -> Result<(), AppError>;
}

/// A before or after filter. Returning `Flow::Abort` stops the chain.
#[async_trait]
pub trait Filter: Send + Sync {
    async fn call(&self, ctx: &mut Context) -> Result<Flow, AppError>;
}

pub struct ActionFn<F>(F);

/// Wrap `|ctx| Box::pin(async move { ... })` as an `Action`.
pub fn action_fn<F>(f: F) -> ActionFn<F>
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<(), AppError>> + Send + Sync,
{
    ActionFn(f)
}

#[async_trait]
impl<F> Action for ActionFn<F>
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<(), AppError>> + Send + Sync,
{
    async fn call(&self, ctx: &mut Context) -> Result<(), AppError> {
        (self.0)(ctx).await
    }
}

pub struct FilterFn<F>(F);

/// Wrap `|ctx| Box::pin(async move { ... })` as a `Filter`.
pub fn filter_fn<F>(f: F) -> FilterFn<F>
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<Flow, AppError>> + Send + Sync,
{
    FilterFn(f)
}

#[async_trait]
impl<F> Filter for FilterFn<F>
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<Flow, AppError>> + Send + Sync,
{
    async fn call(&self, ctx: &mut Context) -> Result<Flow, AppError> {
        (self.0)(ctx).await
    }
}

/// Which actions a filter applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    Only(Vec<String>),
    /// `Except(vec![])` means every action.
    Except(Vec<String>),
}

impl Selector {
    pub fn applies(&self, action: &str) -> bool {
        match self {
            Selector::Only(list) => list.iter().any(|a| a == action),
            Selector::Except(list) => !list.iter().any(|a| a == action),
        }
    }
}

fn names(actions: &[&str]) -> Vec<String> {
    actions.iter().map(|s| s.to_string()).collect()
}

#[derive(Clone)]
struct FilterEntry {
    selector: Selector,
    filter: Arc<dyn Filter>,
}

/// A controller: named actions, filter chains, and the formats it responds with.
/// A fresh `Context` is built per request; the definition itself holds no request state.
#[derive(Clone)]
pub struct ControllerDef {
    pub(crate) name: String,
    actions: HashMap<String, Arc<dyn Action>>,
    before: Vec<FilterEntry>,
    after: Vec<FilterEntry>,
    responds_with: Vec<String>,
    access: Option<Arc<dyn AccessControl>>,
}

impl std::fmt::Debug for ControllerDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut actions: Vec<&String> = self.actions.keys().collect();
        actions.sort();
        f.debug_struct("ControllerDef")
            .field("name", &self.name)
            .field("actions", &actions)
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .field("responds_with", &self.responds_with)
            .finish()
    }
}

impl ControllerDef {
    pub fn new(name: impl Into<String>) -> Self {
        ControllerDef {
            name: name.into(),
            actions: HashMap::new(),
            before: Vec::new(),
            after: Vec::new(),
            responds_with: vec!["html".into(), "json".into()],
            access: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(mut self, name: &str, action: impl Action + 'static) -> Self {
        self.actions.insert(name.to_string(), Arc::new(action));
        self
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn get_action(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    fn push(mut self, phase: Phase, selector: Selector, filter: Arc<dyn Filter>) -> Self {
        let entry = FilterEntry { selector, filter };
        match phase {
            Phase::Before => self.before.push(entry),
            Phase::After => self.after.push(entry),
        }
        self
    }

    pub fn before_all(self, filter: impl Filter + 'static) -> Self {
        self.push(Phase::Before, Selector::Except(Vec::new()), Arc::new(filter))
    }

    pub fn before_only(self, actions: &[&str], filter: impl Filter + 'static) -> Self {
        self.push(Phase::Before, Selector::Only(names(actions)), Arc::new(filter))
    }

    pub fn before_except(self, actions: &[&str], filter: impl Filter + 'static) -> Self {
        self.push(Phase::Before, Selector::Except(names(actions)), Arc::new(filter))
    }

    pub fn after_all(self, filter: impl Filter + 'static) -> Self {
        self.push(Phase::After, Selector::Except(Vec::new()), Arc::new(filter))
    }

    pub fn after_only(self, actions: &[&str], filter: impl Filter + 'static) -> Self {
        self.push(Phase::After, Selector::Only(names(actions)), Arc::new(filter))
    }

    pub fn after_except(self, actions: &[&str], filter: impl Filter + 'static) -> Self {
        self.push(Phase::After, Selector::Except(names(actions)), Arc::new(filter))
    }

    /// Formats in preference order for `*/*`.
    pub fn responds_with(mut self, formats: &[&str]) -> Self {
        self.responds_with = names(formats);
        self
    }

    pub fn formats(&self) -> &[String] {
        &self.responds_with
    }

    /// Guard every action; see `AccessControl`.
    pub fn access_control(mut self, access: impl AccessControl + 'static) -> Self {
        self.access = Some(Arc::new(access));
        self
    }

    pub(crate) fn access(&self) -> Option<Arc<dyn AccessControl>> {
        self.access.clone()
    }

    /// Put a before-all filter ahead of the registered ones.
    pub(crate) fn prepend_before(&mut self, filter: Arc<dyn Filter>) {
        self.before.insert(
            0,
            FilterEntry {
                selector: Selector::Except(Vec::new()),
                filter,
            },
        );
    }

    /// Filters for `action` in `phase`, in registration order.
    pub fn filters(&self, phase: Phase, action: &str) -> Vec<Arc<dyn Filter>> {
        let list = match phase {
            Phase::Before => &self.before,
            Phase::After => &self.after,
        };
        list.iter()
            .filter(|e| e.selector.applies(action))
            .map(|e| e.filter.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> FilterFn<impl for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<Flow, AppError>> + Send + Sync> {
        filter_fn(|_ctx| Box::pin(async { Ok(Flow::Continue) }))
    }

    #[test]
    fn selectors() {
        assert!(Selector::Except(vec![]).applies("index"));
        assert!(!Selector::Except(vec!["index".into()]).applies("index"));
        assert!(Selector::Only(vec!["show".into()]).applies("show"));
        assert!(!Selector::Only(vec!["show".into()]).applies("index"));
    }

    #[test]
    fn filters_follow_registration_and_selection() {
        let def = ControllerDef::new("User")
            .before_all(noop())
            .before_only(&["show"], noop())
            .before_except(&["show"], noop())
            .after_all(noop());
        assert_eq!(def.filters(Phase::Before, "show").len(), 2);
        assert_eq!(def.filters(Phase::Before, "index").len(), 2);
        assert_eq!(def.filters(Phase::After, "index").len(), 1);
    }

    #[test]
    fn defaults_to_html_and_json() {
        let def = ControllerDef::new("User");
        assert_eq!(def.formats(), ["html".to_string(), "json".to_string()]);
        assert!(!def.has_action("index"));
    }
}
