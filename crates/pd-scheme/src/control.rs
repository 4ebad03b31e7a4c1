//! Control-thread side of a request: the delegate the proxy owns and the
//! handle given to application handlers.

use crate::LoadError;
use crate::handler::SharedSchemeHandler;
use crate::proxy::RequestInfo;
use crate::proxy::RequestProxy;
use crate::source::DataSource;
use pd_net::Header;
use pd_net::HttpMethod;
use pd_net::Origin;
use pd_net::SchemeUrl;
use std::sync::Arc;
use std::sync::Weak;

/// Keeps the request's handler alive while the request is in flight.
///
/// Owned by the proxy and always dropped on the control thread.
pub(crate) struct ControlDelegate {
    _handler: SharedSchemeHandler,
    request_id: u64,
}

impl ControlDelegate {
    pub(crate) fn new(handler: SharedSchemeHandler, request_id: u64) -> Self {
        Self {
            _handler: handler,
            request_id,
        }
    }
}

impl Drop for ControlDelegate {
    fn drop(&mut self) {
        log::debug!("request {}: control delegate released", self.request_id);
    }
}

/// Application-facing view of one custom-scheme request.
///
/// All operations are fire-and-forget. Calls made off the control thread
/// are posted to it; calls after the request is torn down are ignored.
#[derive(Clone)]
pub struct RequestHandle {
    proxy: Weak<RequestProxy>,
    info: Arc<RequestInfo>,
}

impl RequestHandle {
    pub(crate) fn new(proxy: &Arc<RequestProxy>) -> Self {
        Self {
            proxy: Arc::downgrade(proxy),
            info: Arc::clone(proxy.info()),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.info.request_id
    }

    pub fn url(&self) -> &SchemeUrl {
        &self.info.url
    }

    pub fn method(&self) -> HttpMethod {
        self.info.method
    }

    pub fn initiator(&self) -> Option<&Origin> {
        self.info.initiator.as_ref()
    }

    pub fn request_headers(&self) -> &[Header] {
        &self.info.headers
    }

    /// True once the network side dropped the request.
    pub fn is_cancelled(&self) -> bool {
        self.proxy
            .upgrade()
            .is_none_or(|proxy| proxy.is_cancelled())
    }

    /// Replies with `source` as the body.
    ///
    /// Only a weak reference is kept; the caller must keep `source` alive
    /// until the load completes.
    pub fn reply(&self, mime_type: &str, source: &Arc<dyn DataSource>) {
        let mime_type = mime_type.to_owned();
        let source = Arc::clone(source);
        self.on_control_thread("reply", move |proxy| {
            proxy.reply(&mime_type, &source);
        });
    }

    pub fn redirect(&self, url: &str) {
        let url = url.to_owned();
        self.on_control_thread("redirect", move |proxy| {
            proxy.redirect(&url);
        });
    }

    pub fn fail(&self, error: LoadError) {
        self.on_control_thread("fail", move |proxy| {
            proxy.fail(error);
        });
    }

    pub fn abort(&self) {
        self.on_control_thread("abort", |proxy| proxy.abort());
    }

    /// Extra response headers; only honoured before `reply`.
    ///
    /// Names are lower-cased and kept in the given order. Invalid entries
    /// are logged and skipped.
    pub fn set_additional_response_headers<I, N, V>(&self, headers: I)
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: AsRef<str>,
    {
        let mut accepted = Vec::new();
        for (name, value) in headers {
            match Header::new(name.as_ref(), value.as_ref()) {
                Ok(header) => accepted.push(header.lowercased()),
                Err(error) => log::warn!(
                    "request {}: skipping response header: {error}",
                    self.info.request_id
                ),
            }
        }

        self.on_control_thread("set_additional_response_headers", move |proxy| {
            proxy.set_additional_headers(accepted);
        });
    }

    fn on_control_thread<F>(&self, operation: &'static str, apply: F)
    where
        F: FnOnce(&Arc<RequestProxy>) + Send + 'static,
    {
        let Some(proxy) = self.proxy.upgrade() else {
            log::debug!(
                "request {}: {operation} after release ignored",
                self.info.request_id
            );
            return;
        };

        let runner = Arc::clone(proxy.control_runner());
        if runner.runs_tasks_on_current_thread() {
            apply(&proxy);
            return;
        }

        let posted = runner.post_task(Box::new(move || apply(&proxy)));
        if let Err(error) = posted {
            log::warn!(
                "request {}: {operation} dropped: {error}",
                self.info.request_id
            );
        }
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("request_id", &self.info.request_id)
            .field("url", &self.info.url.as_str())
            .finish()
    }
}
