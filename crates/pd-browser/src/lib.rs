//! Browser process coordinator for custom-scheme loading.
//!
//! Startup order matters: the embedder registers its schemes on a
//! [`SchemeRegistry`], then [`Browser::start`] locks the registry, spawns the
//! I/O and control threads, and creates the default profile.

use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_core::ThreadRole;
use pd_ipc::PipeConfig;
use pd_ipc::TaskRunner;
use pd_ipc::ThreadTaskRunner;
use pd_net::ResourceRequest;
use pd_scheme::LoaderClient;
use pd_scheme::LoaderConfig;
use pd_scheme::LoaderHandle;
use pd_scheme::SchemeHandlerTable;
use pd_scheme::SchemeLoaderFactory;
use pd_scheme::SchemeRegistry;
use pd_scheme::SharedSchemeHandler;
use std::sync::Arc;

const PIPE_BYTES_ENV: &str = "PIXELDUST_SCHEME_PIPE_BYTES";
const DEFAULT_PROFILE_NAME: &str = "default";

/// Process-wide browser settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrowserConfig {
    pub loader: LoaderConfig,
}

impl BrowserConfig {
    pub fn hardened() -> BrowserResult<Self> {
        Ok(Self {
            loader: LoaderConfig::hardened()?,
        })
    }

    /// Hardened defaults with the pipe capacity taken from
    /// `PIXELDUST_SCHEME_PIPE_BYTES` when set.
    pub fn from_env() -> BrowserResult<Self> {
        let value = std::env::var(PIPE_BYTES_ENV).ok();
        Self::hardened().map(|config| config.with_pipe_override(value.as_deref()))
    }

    /// Applies a pipe capacity override; bad values are logged and ignored.
    pub fn with_pipe_override(mut self, value: Option<&str>) -> Self {
        let Some(value) = value else {
            return self;
        };

        let pipe = value
            .trim()
            .parse::<usize>()
            .map_err(|error| {
                BrowserError::new(
                    "browser.config.pipe_bytes_invalid",
                    format!("{PIPE_BYTES_ENV}=`{value}` is not a byte count: {error}"),
                )
            })
            .map(PipeConfig::with_capacity)
            .and_then(|pipe| pipe.validate().map(|()| pipe));

        match pipe {
            Ok(pipe) => self.loader.pipe = pipe,
            Err(error) => log::warn!("ignoring pipe override: {error}"),
        }
        self
    }

    pub fn validate(&self) -> BrowserResult<()> {
        self.loader.validate()
    }
}

/// Startup summary used by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserSummary {
    pub registered_schemes: usize,
    pub registry_locked: bool,
    pub pipe_capacity_bytes: usize,
}

/// Per-profile handler table plus the loader factory serving it.
pub struct Profile {
    name: String,
    handlers: Arc<SchemeHandlerTable>,
    factory: SchemeLoaderFactory,
}

impl Profile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn install_handler(&self, scheme: &str, handler: SharedSchemeHandler) -> BrowserResult<()> {
        self.handlers.install(scheme, handler)
    }

    pub fn remove_handler(&self, scheme: &str) -> bool {
        self.handlers.remove(scheme)
    }

    pub fn remove_all_handlers(&self) {
        self.handlers.remove_all();
    }

    pub fn handler_for(&self, scheme: &str) -> Option<SharedSchemeHandler> {
        self.handlers.handler_for(scheme)
    }

    pub fn start_load(&self, request: ResourceRequest, client: Box<dyn LoaderClient>) -> LoaderHandle {
        self.factory.create_loader_and_start(request, client)
    }
}

/// Browser process top-level orchestration object.
pub struct Browser {
    config: BrowserConfig,
    registry: Arc<SchemeRegistry>,
    io_runner: Arc<dyn TaskRunner>,
    control_runner: Arc<dyn TaskRunner>,
    threads: Vec<Arc<ThreadTaskRunner>>,
    default_profile: Profile,
}

impl Browser {
    /// Locks `registry` and spawns the I/O and control threads.
    pub fn start(registry: Arc<SchemeRegistry>, config: BrowserConfig) -> BrowserResult<Self> {
        config.validate()?;

        let io = Arc::new(ThreadTaskRunner::spawn(ThreadRole::Io)?);
        let control = match ThreadTaskRunner::spawn(ThreadRole::Control) {
            Ok(control) => Arc::new(control),
            Err(error) => {
                io.shutdown()?;
                return Err(error);
            }
        };

        let mut browser = Self::with_runners(registry, config, io.clone(), control.clone())?;
        browser.threads = vec![io, control];
        Ok(browser)
    }

    /// Same as [`Browser::start`] on caller-provided task runners.
    pub fn with_runners(
        registry: Arc<SchemeRegistry>,
        config: BrowserConfig,
        io_runner: Arc<dyn TaskRunner>,
        control_runner: Arc<dyn TaskRunner>,
    ) -> BrowserResult<Self> {
        config.validate()?;
        registry.lock();

        let default_profile = new_profile(
            DEFAULT_PROFILE_NAME,
            &registry,
            &io_runner,
            &control_runner,
            config.loader,
        )?;

        Ok(Self {
            config,
            registry,
            io_runner,
            control_runner,
            threads: Vec::new(),
            default_profile,
        })
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchemeRegistry> {
        &self.registry
    }

    pub fn default_profile(&self) -> &Profile {
        &self.default_profile
    }

    /// Profiles share the registry and threads but not handlers.
    pub fn create_profile(&self, name: &str) -> BrowserResult<Profile> {
        if name.trim().is_empty() {
            return Err(BrowserError::new(
                "browser.profile.name_empty",
                "profile name must not be empty",
            ));
        }

        new_profile(
            name.trim(),
            &self.registry,
            &self.io_runner,
            &self.control_runner,
            self.config.loader,
        )
    }

    pub fn summary(&self) -> BrowserSummary {
        BrowserSummary {
            registered_schemes: self.registry.len(),
            registry_locked: self.registry.is_locked(),
            pipe_capacity_bytes: self.config.loader.pipe.capacity_bytes,
        }
    }

    /// Drains and joins the threads spawned by [`Browser::start`].
    pub fn shutdown(self) -> BrowserResult<()> {
        for thread in &self.threads {
            thread.shutdown()?;
        }
        Ok(())
    }
}

fn new_profile(
    name: &str,
    registry: &Arc<SchemeRegistry>,
    io_runner: &Arc<dyn TaskRunner>,
    control_runner: &Arc<dyn TaskRunner>,
    config: LoaderConfig,
) -> BrowserResult<Profile> {
    let handlers = Arc::new(SchemeHandlerTable::new(Arc::clone(registry)));
    let factory = SchemeLoaderFactory::new(
        Arc::clone(&handlers),
        Arc::clone(io_runner),
        Arc::clone(control_runner),
        config,
    )?;

    Ok(Profile {
        name: name.to_owned(),
        handlers,
        factory,
    })
}
