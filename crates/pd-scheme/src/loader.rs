//! I/O-thread loader for custom-scheme requests.
//!
//! One `SchemeLoader` exists per in-flight request. It runs the security
//! checks, dispatches the request to the control thread, turns the handler's
//! outcome into a response head, and pumps the data source into a bounded
//! pipe whose read half belongs to the host's `LoaderClient`.

use crate::LoadError;
use crate::LoaderConfig;
use crate::control::ControlDelegate;
use crate::control::RequestHandle;
use crate::handler::SchemeHandlerTable;
use crate::proxy::HeaderOutcome;
use crate::proxy::ProxyClient;
use crate::proxy::ReplyOutcome;
use crate::proxy::RequestInfo;
use crate::proxy::RequestProxy;
use crate::registry::SchemeFlags;
use crate::registry::SchemeRegistry;
use crate::source::ReadyNotifier;
use parking_lot::Mutex;
use pd_core::BrowserResult;
use pd_ipc::PipeConsumer;
use pd_ipc::PipeError;
use pd_ipc::PipeProducer;
use pd_ipc::Task;
use pd_ipc::TaskRunner;
use pd_ipc::data_pipe;
use pd_net::ByteRange;
use pd_net::Header;
use pd_net::HttpMethod;
use pd_net::HttpStatusCode;
use pd_net::RequestMode;
use pd_net::ResourceRequest;
use pd_net::ResponseHead;
use pd_net::SchemeUrl;
use pd_net::http::merge_headers;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Events the host receives for one load. Called on the I/O thread.
pub trait LoaderClient: Send {
    fn on_receive_response(&mut self, head: ResponseHead, body: PipeConsumer);

    fn on_receive_redirect(&mut self, redirect: RedirectInfo, head: ResponseHead);

    fn on_transfer_size_updated(&mut self, _delta: u64) {}

    fn on_complete(&mut self, status: CompletionStatus);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectInfo {
    pub status: HttpStatusCode,
    pub new_url: SchemeUrl,
    pub new_method: HttpMethod,
}

/// Final status of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStatus {
    pub error: Option<LoadError>,
    /// True when response headers had been delivered before completion.
    pub response_started: bool,
    pub body_bytes: u64,
}

impl CompletionStatus {
    pub fn ok(body_bytes: u64) -> Self {
        Self {
            error: None,
            response_started: true,
            body_bytes,
        }
    }

    pub fn failed(error: LoadError, response_started: bool, body_bytes: u64) -> Self {
        Self {
            error: Some(error),
            response_started,
            body_bytes,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn status_line(&self) -> String {
        self.error
            .map_or(HttpStatusCode::OK, LoadError::status)
            .status_line()
    }
}

struct FactoryShared {
    registry: Arc<SchemeRegistry>,
    handlers: Arc<SchemeHandlerTable>,
    io_runner: Arc<dyn TaskRunner>,
    control_runner: Arc<dyn TaskRunner>,
    config: LoaderConfig,
    next_request_id: AtomicU64,
}

/// Creates loaders for one profile's custom schemes.
#[derive(Clone)]
pub struct SchemeLoaderFactory {
    shared: Arc<FactoryShared>,
}

impl SchemeLoaderFactory {
    pub fn new(
        handlers: Arc<SchemeHandlerTable>,
        io_runner: Arc<dyn TaskRunner>,
        control_runner: Arc<dyn TaskRunner>,
        config: LoaderConfig,
    ) -> BrowserResult<Self> {
        config.validate()?;
        Ok(Self::with_config(handlers, io_runner, control_runner, config))
    }

    /// Builds the factory without validating `config`; an invalid pipe
    /// config then fails every load with an I/O error.
    fn with_config(
        handlers: Arc<SchemeHandlerTable>,
        io_runner: Arc<dyn TaskRunner>,
        control_runner: Arc<dyn TaskRunner>,
        config: LoaderConfig,
    ) -> Self {
        Self {
            shared: Arc::new(FactoryShared {
                registry: Arc::clone(handlers.registry()),
                handlers,
                io_runner,
                control_runner,
                config,
                next_request_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn handlers(&self) -> &Arc<SchemeHandlerTable> {
        &self.shared.handlers
    }

    /// Starts `request` on the I/O thread. Dropping the returned handle
    /// disconnects the loader.
    pub fn create_loader_and_start(
        &self,
        request: ResourceRequest,
        client: Box<dyn LoaderClient>,
    ) -> LoaderHandle {
        let loader = Arc::new_cyclic(|this| SchemeLoader {
            this: this.clone(),
            shared: Arc::clone(&self.shared),
            core: Mutex::new(LoaderCore::new(request, client)),
        });

        loader.post(|loader| loader.start());
        LoaderHandle { loader }
    }
}

/// Host-side ownership of a loader.
pub struct LoaderHandle {
    loader: Arc<SchemeLoader>,
}

impl LoaderHandle {
    /// Restarts the load against the redirect target, or `new_url` when
    /// given, after applying the header edits.
    pub fn follow_redirect(
        &self,
        removed_headers: Vec<String>,
        modified_headers: Vec<Header>,
        new_url: Option<SchemeUrl>,
    ) {
        self.loader.post(move |loader| {
            loader.follow_redirect(&removed_headers, &modified_headers, new_url)
        });
    }
}

impl Drop for LoaderHandle {
    fn drop(&mut self) {
        self.loader.post(|loader| loader.disconnect());
    }
}

struct LoaderCore {
    request: ResourceRequest,
    client: Option<Box<dyn LoaderClient>>,
    proxy: Option<Arc<RequestProxy>>,
    producer: Option<PipeProducer>,
    consumer: Option<PipeConsumer>,
    range: Option<ByteRange>,
    redirect_target: Option<SchemeUrl>,
    headers_sent: bool,
    sequential: bool,
    /// Bytes still allowed for a ranged response.
    budget: Option<u64>,
    body_bytes: u64,
    completed: bool,
}

impl LoaderCore {
    fn new(request: ResourceRequest, client: Box<dyn LoaderClient>) -> Self {
        Self {
            request,
            client: Some(client),
            proxy: None,
            producer: None,
            consumer: None,
            range: None,
            redirect_target: None,
            headers_sent: false,
            sequential: false,
            budget: None,
            body_bytes: 0,
            completed: false,
        }
    }

    fn reset_attempt(&mut self) {
        self.proxy = None;
        self.producer = None;
        self.consumer = None;
        self.range = None;
        self.redirect_target = None;
        self.headers_sent = false;
        self.sequential = false;
        self.budget = None;
        self.body_bytes = 0;
    }

    fn client(&mut self) -> Option<&mut (dyn LoaderClient + 'static)> {
        self.client.as_deref_mut()
    }
}

enum PumpStep {
    Continue,
    Wait,
    Finish(Option<LoadError>),
}

struct SchemeLoader {
    this: Weak<SchemeLoader>,
    shared: Arc<FactoryShared>,
    core: Mutex<LoaderCore>,
}

impl SchemeLoader {
    /// Runs `task` on the I/O thread with this loader.
    fn post<F>(self: &Arc<Self>, task: F)
    where
        F: FnOnce(&Arc<SchemeLoader>) + Send + 'static,
    {
        let loader = Arc::clone(self);
        let posted = self
            .shared
            .io_runner
            .post_task(Box::new(move || task(&loader)));
        if let Err(error) = posted {
            log::warn!("custom-scheme loader task dropped: {error}");
        }
    }

    /// Task that schedules a pump without keeping the loader alive.
    fn pump_task(&self) -> Task {
        let loader = self.this.clone();
        let io_runner = Arc::clone(&self.shared.io_runner);
        Box::new(move || {
            let posted = io_runner.post_task(Box::new(move || {
                if let Some(loader) = loader.upgrade() {
                    loader.pump();
                }
            }));
            if let Err(error) = posted {
                log::warn!("custom-scheme pump not scheduled: {error}");
            }
        })
    }

    fn ready_notifier(&self) -> ReadyNotifier {
        let loader = self.this.clone();
        let io_runner = Arc::clone(&self.shared.io_runner);
        Arc::new(move || {
            let loader = loader.clone();
            let posted = io_runner.post_task(Box::new(move || {
                if let Some(loader) = loader.upgrade() {
                    loader.pump();
                }
            }));
            if let Err(error) = posted {
                log::warn!("custom-scheme pump not scheduled: {error}");
            }
        })
    }

    fn start(&self) {
        let mut core = self.core.lock();
        self.start_locked(&mut core);
    }

    fn start_locked(&self, core: &mut LoaderCore) {
        if let Err(error) = self.check_access(&core.request) {
            self.complete_locked(core, Some(error));
            return;
        }

        match data_pipe(&self.shared.config.pipe) {
            Ok((producer, consumer)) => {
                core.producer = Some(producer);
                core.consumer = Some(consumer);
            }
            Err(error) => {
                log::warn!("custom-scheme pipe allocation failed: {error}");
                self.complete_locked(core, Some(LoadError::IoFailure));
                return;
            }
        }

        let range_header = core.request.header_value("range");
        core.range = range_header.and_then(ByteRange::parse);
        if let (Some(value), None) = (range_header, core.range) {
            log::debug!("ignoring unsupported range `{value}`");
        }

        let info = RequestInfo {
            request_id: self.shared.next_request_id.fetch_add(1, Ordering::Relaxed),
            url: core.request.url.clone(),
            method: core.request.method,
            initiator: core.request.initiator.clone(),
            headers: core.request.headers.clone(),
            range: core.range,
        };
        let proxy = RequestProxy::new(
            info,
            Arc::clone(&self.shared.io_runner),
            Arc::clone(&self.shared.control_runner),
        );
        let client: Weak<dyn ProxyClient> = self.this.clone();
        proxy.set_client(client);
        proxy.mark_dispatched();
        core.proxy = Some(Arc::clone(&proxy));

        log::debug!(
            "request {}: dispatching {} {}",
            proxy.request_id(),
            core.request.method.as_str(),
            core.request.url
        );

        let handlers = Arc::clone(&self.shared.handlers);
        let dispatch = Arc::clone(&proxy);
        let posted = self
            .shared
            .control_runner
            .post_task(Box::new(move || dispatch_to_handler(&handlers, &dispatch)));
        if let Err(error) = posted {
            log::warn!("request {}: dispatch failed: {error}", proxy.request_id());
            self.complete_locked(core, Some(LoadError::IoFailure));
        }
    }

    fn check_access(&self, request: &ResourceRequest) -> Result<(), LoadError> {
        let registry = &self.shared.registry;
        let descriptor = registry.scheme_by_name(request.url.scheme());

        if request.mode.requires_initiator() && request.initiator.is_none() {
            log::warn!("{}: {:?} request without initiator", request.url, request.mode);
            return Err(LoadError::InvalidArgument);
        }

        let Some(initiator) = &request.initiator else {
            return Ok(());
        };

        if descriptor.has_flag(SchemeFlags::LOCAL) && !registry.may_access_local(initiator.scheme())
        {
            log::warn!(
                "{}: {} may not load local content",
                request.url,
                initiator.serialize()
            );
            return Err(LoadError::AccessDenied);
        }

        // Navigations are not subject to CORS.
        if !descriptor.has_flag(SchemeFlags::CORS_ENABLED) && request.mode != RequestMode::Navigate
        {
            let target = registry.origin_for(&request.url);
            let initiator = registry.normalize_origin(initiator.clone());
            if !initiator.is_same_origin(&target) {
                log::warn!(
                    "{}: cross-origin request from {} to a scheme without CORS",
                    request.url,
                    initiator.serialize()
                );
                return Err(LoadError::CorsDisabledScheme);
            }
        }

        Ok(())
    }

    fn complete_headers_locked(&self, core: &mut LoaderCore, proxy: &Arc<RequestProxy>) {
        match proxy.take_header_outcome() {
            None => {}
            Some(HeaderOutcome::Fail(error)) => self.complete_locked(core, Some(error)),
            Some(HeaderOutcome::Redirect(target)) => self.redirect_locked(core, target),
            Some(HeaderOutcome::Reply(reply)) => self.respond_locked(core, proxy, reply),
        }
    }

    fn redirect_locked(&self, core: &mut LoaderCore, target: SchemeUrl) {
        core.producer = None;
        core.consumer = None;
        core.redirect_target = Some(target.clone());

        let mut head = ResponseHead::new(HttpStatusCode::SEE_OTHER);
        head.content_length = None;
        if let Err(error) = head.push_header("location", target.as_str()) {
            log::warn!("{}: {error}", core.request.url);
        }

        let new_method = match core.request.method {
            HttpMethod::Head => HttpMethod::Head,
            _ => HttpMethod::Get,
        };
        let redirect = RedirectInfo {
            status: HttpStatusCode::SEE_OTHER,
            new_url: target,
            new_method,
        };

        log::debug!("{}: redirecting to {}", core.request.url, redirect.new_url);
        if let Some(client) = core.client() {
            client.on_receive_redirect(redirect, head);
        }
    }

    fn respond_locked(&self, core: &mut LoaderCore, proxy: &Arc<RequestProxy>, reply: ReplyOutcome) {
        let mut status = HttpStatusCode::OK;
        let mut content_length = reply.size;
        let mut content_range = None;

        if let (Some(range), Some(total), false) = (core.range, reply.size, reply.sequential) {
            let Some(resolved) = range.resolve(total) else {
                log::warn!(
                    "{}: range {range:?} not satisfiable for {total} bytes",
                    core.request.url
                );
                self.complete_locked(core, Some(LoadError::RangeNotSatisfiable));
                return;
            };
            status = HttpStatusCode::PARTIAL_CONTENT;
            content_length = Some(resolved.byte_count());
            content_range = Some(resolved.content_range());
            core.budget = Some(resolved.byte_count());
        }

        let mut head = ResponseHead::new(status);
        head.mime_type = reply.mime_type;
        head.charset = reply.charset;
        head.content_length = content_length;

        let content_type = match &head.charset {
            Some(charset) => format!("{}; charset={charset}", head.mime_type),
            None => head.mime_type.clone(),
        };
        let mut synthesized = vec![("content-type", content_type)];
        if let Some(length) = content_length {
            synthesized.push(("content-length", length.to_string()));
        }
        if let Some(content_range) = content_range {
            synthesized.push(("content-range", content_range));
        }

        let descriptor = self.shared.registry.scheme_by_name(core.request.url.scheme());
        if descriptor.has_flag(SchemeFlags::CORS_ENABLED) {
            if let Some(origin) = core.request.header_value("origin") {
                synthesized.push(("access-control-allow-origin", origin.to_owned()));
                synthesized.push(("access-control-allow-credentials", "true".to_owned()));
            }
        }

        for (name, value) in synthesized {
            if let Err(error) = head.push_header(name, &value) {
                log::warn!("{}: {error}", core.request.url);
            }
        }
        head.headers.extend(reply.additional_headers);

        let Some(consumer) = core.consumer.take() else {
            self.complete_locked(core, Some(LoadError::IoFailure));
            return;
        };

        core.headers_sent = true;
        core.sequential = reply.sequential;
        log::debug!(
            "request {}: responding {} with {:?} bytes",
            proxy.request_id(),
            head.status.as_u16(),
            head.content_length
        );
        if let Some(client) = core.client() {
            client.on_receive_response(head, consumer);
        }

        if reply.sequential {
            if let Some(source) = proxy.source() {
                source.set_ready_notifier(Some(self.ready_notifier()));
            }
        }

        self.pump_locked(core);
    }

    fn pump(&self) {
        let mut core = self.core.lock();
        if core.headers_sent && !core.completed {
            self.pump_locked(&mut core);
        }
    }

    fn pump_locked(&self, core: &mut LoaderCore) {
        loop {
            match self.pump_once(core) {
                PumpStep::Continue => {}
                PumpStep::Wait => return,
                PumpStep::Finish(error) => {
                    self.complete_locked(core, error);
                    return;
                }
            }
        }
    }

    fn pump_once(&self, core: &mut LoaderCore) -> PumpStep {
        if core.completed {
            return PumpStep::Wait;
        }
        let Some(proxy) = core.proxy.clone() else {
            return PumpStep::Wait;
        };
        if let Some(error) = proxy.pending_error() {
            return PumpStep::Finish(Some(error));
        }
        let Some(source) = proxy.source() else {
            log::warn!(
                "request {}: data source destroyed mid-stream",
                proxy.request_id()
            );
            return PumpStep::Finish(Some(LoadError::RequestFailed));
        };

        let remaining = core.budget.map(|budget| budget.saturating_sub(core.body_bytes));
        if remaining == Some(0) {
            return PumpStep::Finish(None);
        }

        let Some(producer) = core.producer.as_ref() else {
            return PumpStep::Wait;
        };
        let mut buffer = match producer.begin_write() {
            Ok(buffer) => buffer,
            Err(PipeError::ShouldWait) => {
                producer.arm_writable(self.pump_task());
                return PumpStep::Wait;
            }
            Err(PipeError::PeerClosed) => return PumpStep::Finish(Some(LoadError::RequestAborted)),
        };

        let wanted = remaining
            .and_then(|remaining| usize::try_from(remaining).ok())
            .map_or(buffer.len(), |remaining| remaining.min(buffer.len()));

        match source.read(&mut buffer.as_mut_slice()[..wanted]) {
            Ok(0) => {
                if core.sequential && !source.at_end() {
                    return PumpStep::Wait;
                }
                PumpStep::Finish(None)
            }
            Ok(read) => {
                if producer.end_write(buffer, read).is_err() {
                    return PumpStep::Finish(Some(LoadError::RequestAborted));
                }
                core.body_bytes += read as u64;
                if let Some(client) = core.client() {
                    client.on_transfer_size_updated(read as u64);
                }
                if !core.sequential && source.at_end() {
                    return PumpStep::Finish(None);
                }
                PumpStep::Continue
            }
            Err(error) => {
                // A sequential source may report a read error and its end at the
                // same time; that is taken as a clean finish and the error is lost.
                // TODO: surface the error once sources can signal end-of-stream
                // unambiguously.
                if core.sequential && source.at_end() {
                    log::debug!(
                        "request {}: read error at end of stream treated as completion: {error}",
                        proxy.request_id()
                    );
                    return PumpStep::Finish(None);
                }
                log::warn!("request {}: read failed: {error}", proxy.request_id());
                let error = proxy.pending_error().unwrap_or(LoadError::RequestFailed);
                PumpStep::Finish(Some(error))
            }
        }
    }

    fn complete_locked(&self, core: &mut LoaderCore, error: Option<LoadError>) {
        if core.completed {
            return;
        }
        core.completed = true;
        core.producer = None;
        core.consumer = None;

        let status = match error {
            None => CompletionStatus::ok(core.body_bytes),
            Some(error) => CompletionStatus::failed(error, core.headers_sent, core.body_bytes),
        };
        log::debug!(
            "{}: completed with {} after {} body bytes",
            core.request.url,
            status.status_line(),
            status.body_bytes
        );

        if let Some(client) = core.client() {
            client.on_complete(status);
        }
        if let Some(proxy) = core.proxy.take() {
            proxy.release();
        }
    }

    fn follow_redirect(
        &self,
        removed_headers: &[String],
        modified_headers: &[Header],
        new_url: Option<SchemeUrl>,
    ) {
        let mut core = self.core.lock();
        if core.completed {
            log::warn!("{}: follow_redirect after completion", core.request.url);
            return;
        }
        let Some(target) = new_url.or_else(|| core.redirect_target.clone()) else {
            log::warn!("{}: follow_redirect without a redirect", core.request.url);
            return;
        };

        if let Some(proxy) = core.proxy.take() {
            proxy.release();
        }
        merge_headers(&mut core.request.headers, removed_headers, modified_headers);
        if core.request.method != HttpMethod::Head {
            core.request.method = HttpMethod::Get;
        }
        core.request.url = target;
        core.reset_attempt();

        log::debug!("following redirect to {}", core.request.url);
        self.start_locked(&mut core);
    }

    /// Network-side teardown when the host drops its handle.
    fn disconnect(&self) {
        let client = {
            let mut core = self.core.lock();
            if let Some(proxy) = core.proxy.take() {
                if !core.completed {
                    log::debug!("request {}: client disconnected", proxy.request_id());
                    proxy.cancel();
                }
                proxy.release();
            }
            core.completed = true;
            core.producer = None;
            core.consumer = None;
            core.client.take()
        };
        drop(client);
    }
}

impl ProxyClient for SchemeLoader {
    fn on_proxy_updated(&self, proxy: &Arc<RequestProxy>) {
        let mut core = self.core.lock();
        if core.completed {
            return;
        }
        let current = core
            .proxy
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, proxy));
        if !current {
            log::debug!("request {}: stale proxy update ignored", proxy.request_id());
            return;
        }

        if core.headers_sent {
            self.pump_locked(&mut core);
        } else {
            self.complete_headers_locked(&mut core, proxy);
        }
    }
}

/// Resolves the handler on the control thread and hands it the request.
fn dispatch_to_handler(handlers: &SchemeHandlerTable, proxy: &Arc<RequestProxy>) {
    let scheme = proxy.info().url.scheme();
    let Some(handler) = handlers.handler_for(scheme) else {
        log::warn!(
            "request {}: no handler installed for scheme `{scheme}`",
            proxy.request_id()
        );
        proxy.reject(LoadError::RequestFailed);
        return;
    };

    let delegate = ControlDelegate::new(Arc::clone(&handler), proxy.request_id());
    if !proxy.attach_delegate(delegate) {
        log::debug!(
            "request {}: cancelled before reaching its handler",
            proxy.request_id()
        );
        return;
    }

    handler.on_request_started(RequestHandle::new(proxy));
}

#[cfg(test)]
mod tests {
    use super::CompletionStatus;
    use super::LoaderClient;
    use super::LoaderHandle;
    use super::RedirectInfo;
    use super::SchemeLoaderFactory;
    use crate::LoadError;
    use crate::LoaderConfig;
    use crate::RequestHandle;
    use crate::handler::SchemeHandlerTable;
    use crate::registry::AuthoritySyntax;
    use crate::registry::SchemeDescriptor;
    use crate::registry::SchemeFlags;
    use crate::registry::SchemeRegistry;
    use crate::source::BufferSource;
    use crate::source::DataSource;
    use crate::source::StreamSource;
    use parking_lot::Mutex;
    use pd_core::ThreadRole;
    use pd_ipc::ManualTaskRunner;
    use pd_ipc::PipeConfig;
    use pd_ipc::PipeConsumer;
    use pd_ipc::drain_until_idle;
    use pd_net::Header;
    use pd_net::HttpStatusCode;
    use pd_net::Origin;
    use pd_net::RequestMode;
    use pd_net::ResourceRequest;
    use pd_net::ResponseHead;
    use pd_net::SchemeUrl;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    #[derive(Default)]
    struct Recorded {
        head: Option<ResponseHead>,
        redirect: Option<(RedirectInfo, ResponseHead)>,
        consumer: Option<PipeConsumer>,
        body: Vec<u8>,
        progress: u64,
        completion: Option<CompletionStatus>,
    }

    impl Recorded {
        fn drain_body(&mut self) -> usize {
            let Some(consumer) = self.consumer.as_ref() else {
                return 0;
            };
            match consumer.read_available() {
                Ok(bytes) => {
                    self.body.extend_from_slice(&bytes);
                    bytes.len()
                }
                Err(_) => 0,
            }
        }

        fn head(&self) -> &ResponseHead {
            assert!(self.head.is_some(), "no response head");
            self.head.as_ref().unwrap_or_else(|| unreachable!())
        }

        fn completion(&self) -> CompletionStatus {
            assert!(self.completion.is_some(), "load did not complete");
            self.completion.unwrap_or_else(|| unreachable!())
        }
    }

    struct RecordingClient(Arc<Mutex<Recorded>>);

    impl LoaderClient for RecordingClient {
        fn on_receive_response(&mut self, head: ResponseHead, body: PipeConsumer) {
            let mut recorded = self.0.lock();
            recorded.head = Some(head);
            recorded.consumer = Some(body);
        }

        fn on_receive_redirect(&mut self, redirect: RedirectInfo, head: ResponseHead) {
            self.0.lock().redirect = Some((redirect, head));
        }

        fn on_transfer_size_updated(&mut self, delta: u64) {
            self.0.lock().progress += delta;
        }

        fn on_complete(&mut self, status: CompletionStatus) {
            self.0.lock().completion = Some(status);
        }
    }

    struct Harness {
        io: Arc<ManualTaskRunner>,
        control: Arc<ManualTaskRunner>,
        handlers: Arc<SchemeHandlerTable>,
        factory: SchemeLoaderFactory,
    }

    impl Harness {
        fn new(descriptors: Vec<SchemeDescriptor>, pipe: PipeConfig) -> Self {
            Self::build(descriptors, pipe, true)
        }

        fn build(descriptors: Vec<SchemeDescriptor>, pipe: PipeConfig, validate: bool) -> Self {
            let registry = Arc::new(SchemeRegistry::new());
            for descriptor in descriptors {
                assert!(registry.register(descriptor).is_ok());
            }
            registry.lock();

            let handlers = Arc::new(SchemeHandlerTable::new(registry));
            let io = Arc::new(ManualTaskRunner::new(ThreadRole::Io));
            let control = Arc::new(ManualTaskRunner::new(ThreadRole::Control));
            let config = LoaderConfig { pipe };
            let factory = if validate {
                match SchemeLoaderFactory::new(
                    Arc::clone(&handlers),
                    io.clone(),
                    control.clone(),
                    config,
                ) {
                    Ok(value) => value,
                    Err(error) => panic!("{error}"),
                }
            } else {
                SchemeLoaderFactory::with_config(
                    Arc::clone(&handlers),
                    io.clone(),
                    control.clone(),
                    config,
                )
            };

            Self {
                io,
                control,
                handlers,
                factory,
            }
        }

        fn widget() -> Self {
            Self::with_flags(SchemeFlags::empty())
        }

        fn with_flags(flags: SchemeFlags) -> Self {
            Self::new(
                vec![SchemeDescriptor::new("widget", AuthoritySyntax::HostOnly).with_flags(flags)],
                PipeConfig::default(),
            )
        }

        fn install(&self, handler: impl Fn(RequestHandle) + Send + Sync + 'static) {
            assert!(self.handlers.install("widget", Arc::new(handler)).is_ok());
        }

        fn start(&self, request: ResourceRequest) -> (LoaderHandle, Arc<Mutex<Recorded>>) {
            let recorded = Arc::new(Mutex::new(Recorded::default()));
            let loader = self.factory.create_loader_and_start(
                request,
                Box::new(RecordingClient(Arc::clone(&recorded))),
            );
            (loader, recorded)
        }

        /// Runs both threads and reads the body until nothing moves.
        fn settle(&self, recorded: &Mutex<Recorded>) {
            loop {
                let ran = drain_until_idle(&[&*self.io, &*self.control]);
                let read = recorded.lock().drain_body();
                if ran == 0 && read == 0 {
                    return;
                }
            }
        }
    }

    fn get(url: &str) -> ResourceRequest {
        match ResourceRequest::get(url) {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        }
    }

    fn with_header(request: ResourceRequest, name: &str, value: &str) -> ResourceRequest {
        match request.header(name, value) {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        }
    }

    fn alphabet() -> Arc<dyn DataSource> {
        BufferSource::shared(&b"abcdefghijklmnopqrstuvwxyz0123"[..])
    }

    #[test]
    fn completion_status_lines() {
        assert_eq!(CompletionStatus::ok(5).status_line(), "HTTP/1.1 200 OK");
        let failed = CompletionStatus::failed(LoadError::UrlNotFound, false, 0);
        assert!(!failed.is_ok());
        assert_eq!(failed.status_line(), "HTTP/1.1 404 Not Found");
    }

    #[test]
    fn reply_streams_body_with_charset() {
        let harness = Harness::widget();
        let source = BufferSource::shared(&b"hello"[..]);
        let body = Arc::clone(&source);
        harness.install(move |request: RequestHandle| {
            request.reply("text/plain; charset=utf-8", &body);
        });

        let (_loader, recorded) = harness.start(get("widget://host/item"));
        harness.settle(&recorded);

        let recorded = recorded.lock();
        let head = recorded.head();
        assert_eq!(head.status, HttpStatusCode::OK);
        assert_eq!(head.mime_type, "text/plain");
        assert_eq!(head.charset.as_deref(), Some("utf-8"));
        assert_eq!(head.content_length, Some(5));
        assert_eq!(head.header("content-type"), Some("text/plain; charset=utf-8"));
        assert_eq!(recorded.body, b"hello");
        assert_eq!(recorded.progress, 5);
        assert_eq!(recorded.completion(), CompletionStatus::ok(5));
        assert!(!source.is_open());
    }

    #[test]
    fn redirect_reports_location_without_body() {
        let harness = Harness::widget();
        harness.install(|request: RequestHandle| request.redirect("widget://host/other"));

        let (_loader, recorded) = harness.start(get("widget://host/item"));
        harness.settle(&recorded);

        let recorded = recorded.lock();
        assert!(recorded.redirect.is_some());
        if let Some((redirect, head)) = &recorded.redirect {
            assert_eq!(redirect.new_url.as_str(), "widget://host/other");
            assert_eq!(head.status, HttpStatusCode::SEE_OTHER);
            assert_eq!(head.header("location"), Some("widget://host/other"));
            assert_eq!(head.content_length, None);
        }
        assert!(recorded.head.is_none());
        assert!(recorded.body.is_empty());
        assert!(recorded.completion.is_none());
    }

    #[test]
    fn fail_before_reply_completes_with_error() {
        let harness = Harness::widget();
        harness.install(|request: RequestHandle| request.fail(LoadError::UrlNotFound));

        let (_loader, recorded) = harness.start(get("widget://host/missing"));
        harness.settle(&recorded);

        let recorded = recorded.lock();
        let status = recorded.completion();
        assert_eq!(status.error, Some(LoadError::UrlNotFound));
        assert_eq!(status.status_line(), "HTTP/1.1 404 Not Found");
        assert!(!status.response_started);
        assert!(recorded.head.is_none());
        assert!(recorded.body.is_empty());
    }

    #[test]
    fn cross_origin_request_to_cors_disabled_scheme_never_reaches_handler() {
        let harness = Harness::widget();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        harness.install(move |_request: RequestHandle| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let request = get("widget://host/item")
            .initiator(Origin::new("https", "example.com", None))
            .mode(RequestMode::Cors);
        let (_loader, recorded) = harness.start(request);
        harness.settle(&recorded);

        assert_eq!(
            recorded.lock().completion().error,
            Some(LoadError::CorsDisabledScheme)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn same_origin_initiator_passes_cors_check() {
        let harness = Harness::widget();
        let source = alphabet();
        harness.install(move |request: RequestHandle| request.reply("text/plain", &source));

        let request = get("widget://host/item")
            .initiator(Origin::new("widget", "host", None))
            .mode(RequestMode::Cors);
        let (_loader, recorded) = harness.start(request);
        harness.settle(&recorded);

        assert!(recorded.lock().completion().is_ok());
    }

    #[test]
    fn cors_enabled_scheme_echoes_origin() {
        let harness = Harness::with_flags(SchemeFlags::CORS_ENABLED);
        let source = alphabet();
        harness.install(move |request: RequestHandle| request.reply("text/plain", &source));

        let request = with_header(get("widget://host/item"), "Origin", "https://example.com")
            .initiator(Origin::new("https", "example.com", None))
            .mode(RequestMode::Cors);
        let (_loader, recorded) = harness.start(request);
        harness.settle(&recorded);

        let recorded = recorded.lock();
        let head = recorded.head();
        assert_eq!(
            head.header("access-control-allow-origin"),
            Some("https://example.com")
        );
        assert_eq!(head.header("access-control-allow-credentials"), Some("true"));
    }

    #[test]
    fn cors_mode_without_initiator_is_invalid() {
        let harness = Harness::widget();
        let (_loader, recorded) = harness.start(get("widget://host/item").mode(RequestMode::Cors));
        harness.settle(&recorded);
        assert_eq!(
            recorded.lock().completion().error,
            Some(LoadError::InvalidArgument)
        );
    }

    #[test]
    fn local_scheme_denies_remote_initiators() {
        let harness = Harness::with_flags(SchemeFlags::LOCAL);
        let request = get("widget://host/item")
            .initiator(Origin::new("https", "example.com", None))
            .mode(RequestMode::NoCors);
        let (_loader, recorded) = harness.start(request);
        harness.settle(&recorded);
        assert_eq!(
            recorded.lock().completion().error,
            Some(LoadError::AccessDenied)
        );
    }

    #[test]
    fn local_access_allowed_initiator_reaches_local_scheme() {
        let harness = Harness::new(
            vec![
                SchemeDescriptor::new("widget", AuthoritySyntax::HostOnly)
                    .with_flags(SchemeFlags::LOCAL | SchemeFlags::CORS_ENABLED),
                SchemeDescriptor::new("portal", AuthoritySyntax::HostOnly)
                    .with_flags(SchemeFlags::LOCAL_ACCESS_ALLOWED),
            ],
            PipeConfig::default(),
        );
        let source = BufferSource::shared(&b"local"[..]);
        harness.install(move |request: RequestHandle| request.reply("text/plain", &source));

        let request = get("widget://host/item")
            .initiator(Origin::new("portal", "host", None))
            .mode(RequestMode::NoCors);
        let (_loader, recorded) = harness.start(request);
        harness.settle(&recorded);

        let recorded = recorded.lock();
        assert_eq!(recorded.body, b"local");
        assert_eq!(recorded.completion(), CompletionStatus::ok(5));
    }

    #[test]
    fn missing_handler_fails_the_request() {
        let harness = Harness::widget();
        let (_loader, recorded) = harness.start(get("widget://host/item"));
        harness.settle(&recorded);
        assert_eq!(
            recorded.lock().completion().error,
            Some(LoadError::RequestFailed)
        );
    }

    #[test]
    fn range_request_yields_partial_content() {
        let harness = Harness::widget();
        let source = alphabet();
        harness.install(move |request: RequestHandle| {
            request.reply("application/octet-stream", &source);
        });

        let request = with_header(get("widget://host/item"), "Range", "bytes=10-19");
        let (_loader, recorded) = harness.start(request);
        harness.settle(&recorded);

        let recorded = recorded.lock();
        let head = recorded.head();
        assert_eq!(head.status, HttpStatusCode::PARTIAL_CONTENT);
        assert_eq!(head.header("content-range"), Some("bytes 10-19/30"));
        assert_eq!(head.content_length, Some(10));
        assert_eq!(recorded.body, b"klmnopqrst");
        assert_eq!(recorded.completion(), CompletionStatus::ok(10));
    }

    #[test]
    fn range_past_the_end_is_clamped() {
        let harness = Harness::widget();
        let source = alphabet();
        harness.install(move |request: RequestHandle| request.reply("text/plain", &source));

        let request = with_header(get("widget://host/item"), "Range", "bytes=10-40");
        let (_loader, recorded) = harness.start(request);
        harness.settle(&recorded);

        let recorded = recorded.lock();
        let head = recorded.head();
        assert_eq!(head.status, HttpStatusCode::PARTIAL_CONTENT);
        assert_eq!(head.header("content-range"), Some("bytes 10-29/30"));
        assert_eq!(recorded.body, b"klmnopqrstuvwxyz0123");
        assert_eq!(recorded.completion(), CompletionStatus::ok(20));
    }

    #[test]
    fn open_and_suffix_ranges_seek_to_the_tail() {
        for value in ["bytes=-5", "bytes=25-"] {
            let harness = Harness::widget();
            let source = alphabet();
            harness.install(move |request: RequestHandle| request.reply("text/plain", &source));

            let request = with_header(get("widget://host/item"), "Range", value);
            let (_loader, recorded) = harness.start(request);
            harness.settle(&recorded);

            let recorded = recorded.lock();
            let head = recorded.head();
            assert_eq!(head.status, HttpStatusCode::PARTIAL_CONTENT, "{value}");
            assert_eq!(head.header("content-range"), Some("bytes 25-29/30"), "{value}");
            assert_eq!(recorded.body, b"z0123", "{value}");
            assert_eq!(recorded.completion(), CompletionStatus::ok(5), "{value}");
        }
    }

    #[test]
    fn pipe_allocation_failure_is_an_io_failure() {
        let harness = Harness::build(
            vec![SchemeDescriptor::new("widget", AuthoritySyntax::HostOnly)],
            PipeConfig::with_capacity(0),
            false,
        );
        let dispatched = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dispatched);
        harness.install(move |_request: RequestHandle| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (_loader, recorded) = harness.start(get("widget://host/item"));
        harness.settle(&recorded);

        let status = recorded.lock().completion();
        assert_eq!(status.error, Some(LoadError::IoFailure));
        assert!(!status.response_started);
        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsatisfiable_range_fails_with_416() {
        let harness = Harness::widget();
        let source = alphabet();
        harness.install(move |request: RequestHandle| request.reply("text/plain", &source));

        let request = with_header(get("widget://host/item"), "Range", "bytes=40-50");
        let (_loader, recorded) = harness.start(request);
        harness.settle(&recorded);

        let recorded = recorded.lock();
        let status = recorded.completion();
        assert_eq!(status.error, Some(LoadError::RangeNotSatisfiable));
        assert_eq!(status.status_line(), "HTTP/1.1 416 Range Not Satisfiable");
        assert!(recorded.head.is_none());
    }

    #[test]
    fn multi_range_is_served_in_full() {
        let harness = Harness::widget();
        let source = alphabet();
        harness.install(move |request: RequestHandle| request.reply("text/plain", &source));

        let request = with_header(get("widget://host/item"), "Range", "bytes=0-1,4-5");
        let (_loader, recorded) = harness.start(request);
        harness.settle(&recorded);

        let recorded = recorded.lock();
        assert_eq!(recorded.head().status, HttpStatusCode::OK);
        assert_eq!(recorded.body.len(), 30);
    }

    #[test]
    fn full_pipe_suspends_the_pump() {
        let harness = Harness::new(
            vec![SchemeDescriptor::new("widget", AuthoritySyntax::HostOnly)],
            PipeConfig::with_capacity(1024),
        );
        let data: Vec<u8> = (0..10_000_u32).map(|value| (value % 251) as u8).collect();
        let source = BufferSource::shared(data.clone());
        harness.install(move |request: RequestHandle| {
            request.reply("application/octet-stream", &source);
        });

        let (_loader, recorded) = harness.start(get("widget://host/blob"));
        drain_until_idle(&[&*harness.io, &*harness.control]);
        {
            let recorded = recorded.lock();
            assert!(recorded.completion.is_none());
            let buffered = recorded.consumer.as_ref().map(PipeConsumer::buffered_len);
            assert_eq!(buffered, Some(1024));
        }

        harness.settle(&recorded);
        let recorded = recorded.lock();
        assert_eq!(recorded.body, data);
        assert_eq!(recorded.completion(), CompletionStatus::ok(10_000));
    }

    #[test]
    fn stream_source_waits_for_more_data() {
        let harness = Harness::widget();
        let stream = Arc::new(StreamSource::new());
        let source: Arc<dyn DataSource> = stream.clone();
        harness.install(move |request: RequestHandle| {
            request.reply("application/octet-stream", &source);
        });

        let (_loader, recorded) = harness.start(get("widget://host/live"));
        harness.settle(&recorded);
        assert_eq!(recorded.lock().head().content_length, None);
        assert!(recorded.lock().completion.is_none());

        stream.push(b"hel");
        harness.settle(&recorded);
        stream.push(b"lo");
        stream.finish();
        harness.settle(&recorded);

        let recorded = recorded.lock();
        assert_eq!(recorded.body, b"hello");
        assert_eq!(recorded.completion(), CompletionStatus::ok(5));
    }

    #[test]
    fn read_error_at_end_of_stream_completes_cleanly() {
        let harness = Harness::widget();
        let stream = Arc::new(StreamSource::new());
        let source: Arc<dyn DataSource> = stream.clone();
        harness.install(move |request: RequestHandle| request.reply("text/plain", &source));

        let (_loader, recorded) = harness.start(get("widget://host/live"));
        stream.push(b"ab");
        harness.settle(&recorded);
        stream.finish();
        stream.fail("late error");
        harness.settle(&recorded);

        assert_eq!(recorded.lock().completion(), CompletionStatus::ok(2));
    }

    #[test]
    fn read_error_mid_stream_fails_the_load() {
        let harness = Harness::widget();
        let stream = Arc::new(StreamSource::new());
        let source: Arc<dyn DataSource> = stream.clone();
        harness.install(move |request: RequestHandle| request.reply("text/plain", &source));

        let (_loader, recorded) = harness.start(get("widget://host/live"));
        stream.push(b"ab");
        harness.settle(&recorded);
        stream.fail("disk gone");
        harness.settle(&recorded);

        let status = recorded.lock().completion();
        assert_eq!(status.error, Some(LoadError::RequestFailed));
        assert!(status.response_started);
        assert_eq!(status.body_bytes, 2);
    }

    #[test]
    fn dropped_source_fails_the_load() {
        let harness = Harness::widget();
        harness.install(|request: RequestHandle| {
            request.reply("text/plain", &BufferSource::shared(&b"gone"[..]));
        });

        let (_loader, recorded) = harness.start(get("widget://host/item"));
        harness.settle(&recorded);

        let status = recorded.lock().completion();
        assert_eq!(status.error, Some(LoadError::RequestFailed));
        assert!(status.response_started);
    }

    #[test]
    fn later_outcomes_are_ignored() {
        let harness = Harness::widget();
        let source = alphabet();
        harness.install(move |request: RequestHandle| {
            request.reply("text/plain", &source);
            request.fail(LoadError::RequestDenied);
            request.redirect("widget://host/elsewhere");
        });

        let (_loader, recorded) = harness.start(get("widget://host/item"));
        harness.settle(&recorded);

        let recorded = recorded.lock();
        assert!(recorded.redirect.is_none());
        assert_eq!(recorded.completion(), CompletionStatus::ok(30));
    }

    #[test]
    fn follow_redirect_restarts_with_merged_headers() {
        let harness = Harness::widget();
        let seen: Arc<Mutex<Vec<Vec<Header>>>> = Arc::default();
        let requests = Arc::clone(&seen);
        let source = BufferSource::shared(&b"moved"[..]);
        harness.install(move |request: RequestHandle| {
            requests.lock().push(request.request_headers().to_vec());
            if request.url().path() == "/item" {
                request.redirect("widget://host/other");
            } else {
                request.reply("text/plain", &source);
            }
        });

        let request = with_header(get("widget://host/item"), "X-Stale", "1");
        let request = with_header(request, "Accept", "text/plain");
        let (loader, recorded) = harness.start(request);
        harness.settle(&recorded);
        assert!(recorded.lock().redirect.is_some());

        let fresh = match Header::new("X-Fresh", "2") {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        };
        loader.follow_redirect(vec!["x-stale".to_owned()], vec![fresh], None);
        harness.settle(&recorded);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        let second = &seen[1];
        assert!(!second.iter().any(|header| header.name == "X-Stale"));
        assert!(second.iter().any(|header| header.name == "X-Fresh"));
        assert!(second.iter().any(|header| header.name == "Accept"));

        let recorded = recorded.lock();
        assert_eq!(recorded.body, b"moved");
        assert_eq!(recorded.completion(), CompletionStatus::ok(5));
    }

    #[test]
    fn follow_redirect_prefers_an_explicit_url() {
        let harness = Harness::widget();
        let paths: Arc<Mutex<Vec<String>>> = Arc::default();
        let seen = Arc::clone(&paths);
        let source = BufferSource::shared(&b"elsewhere"[..]);
        harness.install(move |request: RequestHandle| {
            seen.lock().push(request.url().path().to_owned());
            if request.url().path() == "/item" {
                request.redirect("widget://host/other");
            } else {
                request.reply("text/plain", &source);
            }
        });

        let (loader, recorded) = harness.start(get("widget://host/item"));
        harness.settle(&recorded);
        assert!(recorded.lock().redirect.is_some());

        let explicit = match SchemeUrl::parse("widget://host/elsewhere") {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        };
        loader.follow_redirect(Vec::new(), Vec::new(), Some(explicit));
        harness.settle(&recorded);

        assert_eq!(*paths.lock(), ["/item", "/elsewhere"]);
        let recorded = recorded.lock();
        assert_eq!(recorded.body, b"elsewhere");
        assert_eq!(recorded.completion(), CompletionStatus::ok(9));
    }

    #[test]
    fn abort_before_reply_is_reported_as_not_started() {
        let harness = Harness::widget();
        harness.install(|request: RequestHandle| request.abort());

        let (_loader, recorded) = harness.start(get("widget://host/item"));
        harness.settle(&recorded);

        let status = recorded.lock().completion();
        assert_eq!(status.error, Some(LoadError::RequestAborted));
        assert!(!status.response_started);
    }

    #[test]
    fn abort_after_start_is_reported_as_started() {
        let harness = Harness::widget();
        let stream = Arc::new(StreamSource::new());
        let source: Arc<dyn DataSource> = stream.clone();
        let slot: Arc<Mutex<Option<RequestHandle>>> = Arc::default();
        let stored = Arc::clone(&slot);
        harness.install(move |request: RequestHandle| {
            request.reply("text/plain", &source);
            *stored.lock() = Some(request);
        });

        let (_loader, recorded) = harness.start(get("widget://host/live"));
        stream.push(b"abc");
        harness.settle(&recorded);
        assert!(recorded.lock().head.is_some());

        let handle = slot.lock().clone();
        assert!(handle.is_some());
        if let Some(handle) = handle {
            handle.abort();
        }
        harness.settle(&recorded);

        let status = recorded.lock().completion();
        assert_eq!(status.error, Some(LoadError::RequestAborted));
        assert!(status.response_started);
        assert_eq!(status.body_bytes, 3);
        assert!(!stream.is_open());
    }

    #[test]
    fn fail_after_headers_surfaces_on_next_read() {
        let harness = Harness::widget();
        let stream = Arc::new(StreamSource::new());
        let source: Arc<dyn DataSource> = stream.clone();
        let slot: Arc<Mutex<Option<RequestHandle>>> = Arc::default();
        let stored = Arc::clone(&slot);
        harness.install(move |request: RequestHandle| {
            request.reply("text/plain", &source);
            *stored.lock() = Some(request);
        });

        let (_loader, recorded) = harness.start(get("widget://host/live"));
        harness.settle(&recorded);

        if let Some(handle) = slot.lock().clone() {
            handle.fail(LoadError::IoFailure);
        }
        harness.settle(&recorded);

        let status = recorded.lock().completion();
        assert_eq!(status.error, Some(LoadError::IoFailure));
        assert!(status.response_started);
    }

    #[test]
    fn client_disconnect_cancels_the_request() {
        let harness = Harness::widget();
        let stream = Arc::new(StreamSource::new());
        let source: Arc<dyn DataSource> = stream.clone();
        let slot: Arc<Mutex<Option<RequestHandle>>> = Arc::default();
        let stored = Arc::clone(&slot);
        harness.install(move |request: RequestHandle| {
            request.reply("text/plain", &source);
            *stored.lock() = Some(request);
        });

        let (loader, recorded) = harness.start(get("widget://host/live"));
        harness.settle(&recorded);
        let handle = slot.lock().clone();
        assert!(handle.as_ref().is_some_and(|handle| !handle.is_cancelled()));

        drop(loader);
        harness.settle(&recorded);

        assert!(handle.is_some_and(|handle| handle.is_cancelled()));
        assert!(!stream.is_open());
        assert!(recorded.lock().completion.is_none());
    }

    #[test]
    fn disconnect_before_dispatch_skips_the_handler() {
        let harness = Harness::widget();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        harness.install(move |_request: RequestHandle| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (loader, recorded) = harness.start(get("widget://host/item"));
        drop(loader);
        harness.settle(&recorded);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(harness.control.pending(), 0);
    }
}
