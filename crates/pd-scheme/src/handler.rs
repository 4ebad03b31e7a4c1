//! Per-profile mapping from scheme name to application handler.

use crate::RequestHandle;
use crate::registry::SchemeRegistry;
use parking_lot::RwLock;
use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_net::url::is_builtin_scheme;
use std::collections::HashMap;
use std::sync::Arc;

/// Application entry point for custom-scheme requests.
///
/// Invoked once per request on the control thread. The handler must make
/// exactly one terminal call on the handle, now or later.
pub trait SchemeHandler: Send + Sync {
    fn on_request_started(&self, request: RequestHandle);
}

impl<F> SchemeHandler for F
where
    F: Fn(RequestHandle) + Send + Sync,
{
    fn on_request_started(&self, request: RequestHandle) {
        self(request)
    }
}

pub type SharedSchemeHandler = Arc<dyn SchemeHandler>;

pub struct SchemeHandlerTable {
    registry: Arc<SchemeRegistry>,
    handlers: RwLock<HashMap<String, SharedSchemeHandler>>,
}

impl SchemeHandlerTable {
    pub fn new(registry: Arc<SchemeRegistry>) -> Self {
        Self {
            registry,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SchemeRegistry> {
        &self.registry
    }

    /// Installs `handler`; an existing handler for the scheme is kept.
    pub fn install(&self, scheme: &str, handler: SharedSchemeHandler) -> BrowserResult<()> {
        let key = scheme.trim().to_ascii_lowercase();

        if key.is_empty() {
            let error = BrowserError::new(
                "scheme.handler_name_empty",
                "cannot install a handler for an empty scheme name",
            );
            log::warn!("{error}");
            return Err(error);
        }

        if is_builtin_scheme(&key) {
            let error = BrowserError::new(
                "scheme.handler_builtin",
                format!("cannot install a handler for built-in scheme `{key}`"),
            );
            log::warn!("{error}");
            return Err(error);
        }

        let mut handlers = self.handlers.write();
        if handlers.contains_key(&key) {
            let error = BrowserError::new(
                "scheme.handler_exists",
                format!("a handler is already installed for scheme `{key}`"),
            );
            log::warn!("{error}");
            return Err(error);
        }

        if !self.registry.contains(&key) {
            log::warn!("installing handler for unregistered scheme `{key}`");
        }

        handlers.insert(key, handler);
        Ok(())
    }

    /// Stops routing new requests for `scheme`; in-flight requests keep
    /// their handler.
    pub fn remove(&self, scheme: &str) -> bool {
        let key = scheme.trim().to_ascii_lowercase();
        self.handlers.write().remove(&key).is_some()
    }

    pub fn remove_all(&self) {
        self.handlers.write().clear();
    }

    pub fn handler_for(&self, scheme: &str) -> Option<SharedSchemeHandler> {
        let key = scheme.trim().to_ascii_lowercase();
        self.handlers.read().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
