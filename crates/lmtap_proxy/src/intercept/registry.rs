use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::Interceptor;

/// Wildcard method accepted by [`Registry::register`].
pub const METHOD_ANY: &str = "*";

/// Maps `(endpoint, method)` to the interceptor responsible for it.
///
/// Lookups prefer an exact method entry over a `*` entry. Registration
/// happens at startup; the last registration for a pair wins.
#[derive(Default)]
pub struct Registry {
    routes: RwLock<HashMap<String, HashMap<String, Arc<dyn Interceptor>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: &str, method: &str, interceptor: Arc<dyn Interceptor>) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes
            .entry(endpoint.to_string())
            .or_default()
            .insert(method.to_uppercase(), interceptor);
    }

    pub fn lookup(&self, endpoint: &str, method: &str) -> Option<Arc<dyn Interceptor>> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        let methods = routes.get(endpoint)?;
        methods
            .get(&method.to_uppercase())
            .or_else(|| methods.get(METHOD_ANY))
            .cloned()
    }
}
