//! Reply state shared between the control-side handle and the I/O loader.
//!
//! A `RequestProxy` is the only object reachable from both threads. Every
//! field sits behind one mutex; each operation takes the lock once, applies
//! its transition, and then posts a notification to the I/O thread.
//!
//! ```text
//! Created -> AwaitingHandler -> Replying | Redirecting | Failing -> Terminal
//! ```

use crate::LoadError;
use crate::control::ControlDelegate;
use crate::source::DataSource;
use parking_lot::Mutex;
use pd_ipc::TaskRunner;
use pd_net::ByteRange;
use pd_net::Header;
use pd_net::HttpMethod;
use pd_net::Origin;
use pd_net::SchemeUrl;
use pd_net::http::parse_content_type;
use std::sync::Arc;
use std::sync::Weak;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyPhase {
    Created,
    AwaitingHandler,
    Replying,
    Redirecting,
    Failing,
    Terminal,
}

/// Immutable snapshot of the request as handed to the handler.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub request_id: u64,
    pub url: SchemeUrl,
    pub method: HttpMethod,
    pub initiator: Option<Origin>,
    pub headers: Vec<Header>,
    pub range: Option<ByteRange>,
}

/// Receives a posted notification whenever the proxy reaches an outcome.
pub(crate) trait ProxyClient: Send + Sync {
    fn on_proxy_updated(&self, proxy: &Arc<RequestProxy>);
}

/// Outcome the I/O side consumes to build response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HeaderOutcome {
    Reply(ReplyOutcome),
    Redirect(SchemeUrl),
    Fail(LoadError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReplyOutcome {
    pub mime_type: String,
    pub charset: Option<String>,
    pub additional_headers: Vec<Header>,
    pub size: Option<u64>,
    pub sequential: bool,
}

#[derive(Default)]
struct ReplyState {
    mime_type: String,
    charset: Option<String>,
    additional_headers: Vec<Header>,
    redirect: Option<SchemeUrl>,
    error: Option<LoadError>,
    source: Option<Weak<dyn DataSource>>,
    size: Option<u64>,
    sequential: bool,
}

struct ProxyState {
    phase: ProxyPhase,
    reply: ReplyState,
    headers_sent: bool,
    cancelled: bool,
    /// Set by `abort`: whether the response had already started.
    aborted_after_start: Option<bool>,
    client: Option<Weak<dyn ProxyClient>>,
    delegate: Option<ControlDelegate>,
}

impl ProxyState {
    /// Outcome setters only apply once, while the handler owns the request.
    fn accepts_outcome(&self) -> bool {
        self.delegate.is_some()
            && matches!(
                self.phase,
                ProxyPhase::Created | ProxyPhase::AwaitingHandler
            )
    }

    fn take_source(&mut self) -> Option<Arc<dyn DataSource>> {
        self.reply.source.take().and_then(|source| source.upgrade())
    }
}

pub struct RequestProxy {
    info: Arc<RequestInfo>,
    state: Mutex<ProxyState>,
    io_runner: Arc<dyn TaskRunner>,
    control_runner: Arc<dyn TaskRunner>,
}

impl RequestProxy {
    pub(crate) fn new(
        info: RequestInfo,
        io_runner: Arc<dyn TaskRunner>,
        control_runner: Arc<dyn TaskRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info: Arc::new(info),
            state: Mutex::new(ProxyState {
                phase: ProxyPhase::Created,
                reply: ReplyState::default(),
                headers_sent: false,
                cancelled: false,
                aborted_after_start: None,
                client: None,
                delegate: None,
            }),
            io_runner,
            control_runner,
        })
    }

    pub fn info(&self) -> &Arc<RequestInfo> {
        &self.info
    }

    pub fn request_id(&self) -> u64 {
        self.info.request_id
    }

    pub fn phase(&self) -> ProxyPhase {
        self.state.lock().phase
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// `Some(true)` when aborted after the response started streaming.
    pub fn aborted_after_start(&self) -> Option<bool> {
        self.state.lock().aborted_after_start
    }

    pub(crate) fn control_runner(&self) -> &Arc<dyn TaskRunner> {
        &self.control_runner
    }

    pub(crate) fn set_client(&self, client: Weak<dyn ProxyClient>) {
        self.state.lock().client = Some(client);
    }

    /// Marks the proxy as visible to the control thread.
    pub(crate) fn mark_dispatched(&self) {
        let mut state = self.state.lock();
        if state.phase == ProxyPhase::Created {
            state.phase = ProxyPhase::AwaitingHandler;
        }
    }

    /// Hands the proxy to the handler; false if it was torn down meanwhile.
    pub(crate) fn attach_delegate(&self, delegate: ControlDelegate) -> bool {
        let mut state = self.state.lock();
        if state.phase != ProxyPhase::AwaitingHandler || state.cancelled {
            return false;
        }

        state.delegate = Some(delegate);
        true
    }

    pub(crate) fn set_additional_headers(&self, headers: Vec<Header>) -> bool {
        let mut state = self.state.lock();
        if !state.accepts_outcome() {
            log::debug!(
                "request {}: response headers set after an outcome were ignored",
                self.info.request_id
            );
            return false;
        }

        state.reply.additional_headers = headers;
        true
    }

    pub(crate) fn reply(self: &Arc<Self>, mime_type: &str, source: &Arc<dyn DataSource>) -> bool {
        let prepared = {
            let mut state = self.state.lock();
            if !state.accepts_outcome() {
                log::debug!(
                    "request {}: reply ignored in {:?}",
                    self.info.request_id,
                    state.phase
                );
                return false;
            }

            let content_type = parse_content_type(mime_type);
            for parameter in &content_type.unrecognized {
                log::warn!(
                    "request {}: ignoring MIME parameter `{parameter}` in `{mime_type}`",
                    self.info.request_id
                );
            }
            state.reply.mime_type = content_type.mime_type;
            state.reply.charset = content_type.charset;

            if !source.is_open() {
                if let Err(error) = source.open() {
                    log::warn!(
                        "request {}: failed to open data source: {error}",
                        self.info.request_id
                    );
                }
            }

            match self.prepare_source(source) {
                Ok(size) => {
                    state.reply.source = Some(Arc::downgrade(source));
                    state.reply.size = size;
                    state.reply.sequential = source.is_sequential();
                    state.phase = ProxyPhase::Replying;
                    true
                }
                Err(error) => {
                    state.reply.error = Some(error);
                    state.phase = ProxyPhase::Failing;
                    false
                }
            }
        };

        if !prepared && source.is_open() {
            source.close();
        }

        self.notify_client();
        true
    }

    /// Checks readability and seeks to the requested range start.
    fn prepare_source(&self, source: &Arc<dyn DataSource>) -> Result<Option<u64>, LoadError> {
        if !source.is_readable() {
            log::warn!(
                "request {}: data source is not readable",
                self.info.request_id
            );
            return Err(LoadError::UrlInvalid);
        }

        let size = source.size();
        if source.is_sequential() {
            return Ok(size);
        }

        let start = self.info.range.and_then(|range| match size {
            Some(total) => range.resolve(total).map(|resolved| resolved.first),
            None => range.start_hint(),
        });
        if let Some(start) = start {
            source.seek(start).map_err(|error| {
                log::warn!(
                    "request {}: seeking to byte {start} failed: {error}",
                    self.info.request_id
                );
                LoadError::IoFailure
            })?;
        }

        Ok(size)
    }

    pub(crate) fn redirect(self: &Arc<Self>, target: &str) -> bool {
        {
            let mut state = self.state.lock();
            if !state.accepts_outcome() {
                log::debug!(
                    "request {}: redirect ignored in {:?}",
                    self.info.request_id,
                    state.phase
                );
                return false;
            }

            match SchemeUrl::parse(target) {
                Ok(url) => {
                    state.reply.redirect = Some(url);
                    state.phase = ProxyPhase::Redirecting;
                }
                Err(error) => {
                    log::warn!("request {}: {error}", self.info.request_id);
                    state.reply.error = Some(LoadError::UrlInvalid);
                    state.phase = ProxyPhase::Failing;
                }
            }
        }

        self.notify_client();
        true
    }

    /// Before any outcome this fails the request outright. Once the
    /// response is streaming, the error surfaces on the next read.
    pub(crate) fn fail(self: &Arc<Self>, error: LoadError) -> bool {
        let source = {
            let mut state = self.state.lock();
            let mid_stream = state.delegate.is_some()
                && state.phase == ProxyPhase::Replying
                && state.headers_sent
                && state.reply.error.is_none();
            if !state.accepts_outcome() && !mid_stream {
                log::debug!(
                    "request {}: fail({error}) ignored in {:?}",
                    self.info.request_id,
                    state.phase
                );
                return false;
            }

            state.reply.error = Some(error);
            if !mid_stream {
                state.phase = ProxyPhase::Failing;
            }
            state.take_source()
        };

        if let Some(source) = source {
            source.close();
        }
        self.notify_client();
        true
    }

    /// Rejects a request no handler picked up.
    pub(crate) fn reject(self: &Arc<Self>, error: LoadError) {
        {
            let mut state = self.state.lock();
            if !matches!(
                state.phase,
                ProxyPhase::Created | ProxyPhase::AwaitingHandler
            ) {
                return;
            }
            state.reply.error = Some(error);
            state.phase = ProxyPhase::Failing;
        }

        self.notify_client();
    }

    /// Control-side cancellation; funnels into the failing path.
    pub(crate) fn abort(self: &Arc<Self>) {
        let source = {
            let mut state = self.state.lock();
            if state.phase == ProxyPhase::Terminal || state.delegate.is_none() {
                return;
            }

            let started = state.headers_sent;
            state.aborted_after_start = Some(started);
            if state.reply.error.is_none() {
                state.reply.error = Some(LoadError::RequestAborted);
            }
            if !started {
                state.phase = ProxyPhase::Failing;
            }
            log::debug!(
                "request {} aborted {} the response started",
                self.info.request_id,
                if started { "after" } else { "before" }
            );
            state.take_source()
        };

        if let Some(source) = source {
            source.close();
        }
        self.notify_client();
    }

    /// Network-side cancellation. The loader releases the proxy right after.
    pub(crate) fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        if state.phase != ProxyPhase::Terminal && state.reply.error.is_none() {
            state.reply.error = Some(LoadError::RequestAborted);
        }
    }

    /// Consumes the outcome once; `None` while there is nothing new.
    pub(crate) fn take_header_outcome(&self) -> Option<HeaderOutcome> {
        let mut state = self.state.lock();
        match state.phase {
            ProxyPhase::Replying if !state.headers_sent => {
                state.headers_sent = true;
                Some(HeaderOutcome::Reply(ReplyOutcome {
                    mime_type: state.reply.mime_type.clone(),
                    charset: state.reply.charset.clone(),
                    additional_headers: state.reply.additional_headers.clone(),
                    size: state.reply.size,
                    sequential: state.reply.sequential,
                }))
            }
            ProxyPhase::Redirecting => {
                state.phase = ProxyPhase::Terminal;
                state.headers_sent = true;
                state.reply.redirect.clone().map(HeaderOutcome::Redirect)
            }
            ProxyPhase::Failing => {
                state.phase = ProxyPhase::Terminal;
                let error = state.reply.error.unwrap_or(LoadError::RequestFailed);
                Some(HeaderOutcome::Fail(error))
            }
            _ => None,
        }
    }

    /// Error recorded after the response started.
    pub(crate) fn pending_error(&self) -> Option<LoadError> {
        self.state.lock().reply.error
    }

    /// The handler's source, if it is still alive.
    pub(crate) fn source(&self) -> Option<Arc<dyn DataSource>> {
        self.state
            .lock()
            .reply
            .source
            .as_ref()
            .and_then(|source| source.upgrade())
    }

    /// Tears the proxy down from the I/O side.
    ///
    /// The delegate is dropped on the control thread.
    pub(crate) fn release(self: &Arc<Self>) {
        let (source, delegate) = {
            let mut state = self.state.lock();
            state.client = None;
            state.phase = ProxyPhase::Terminal;
            (state.take_source(), state.delegate.take())
        };

        if let Some(source) = source {
            source.set_ready_notifier(None);
            if source.is_open() {
                source.close();
            }
        }

        let Some(delegate) = delegate else {
            return;
        };

        let proxy = Arc::clone(self);
        let posted = self.control_runner.post_task(Box::new(move || {
            drop(delegate);
            drop(proxy);
        }));
        if let Err(error) = posted {
            log::warn!(
                "request {}: control delegate released off-thread: {error}",
                self.info.request_id
            );
        }
    }

    fn notify_client(self: &Arc<Self>) {
        let client = self.state.lock().client.clone();
        let Some(client) = client else {
            return;
        };

        let proxy = Arc::clone(self);
        let posted = self.io_runner.post_task(Box::new(move || {
            if let Some(client) = client.upgrade() {
                client.on_proxy_updated(&proxy);
            }
        }));
        if let Err(error) = posted {
            log::warn!(
                "request {}: dropping outcome notification: {error}",
                self.info.request_id
            );
        }
    }
}
