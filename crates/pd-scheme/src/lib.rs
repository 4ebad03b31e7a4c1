//! Custom URL scheme support.
//!
//! Application handlers run on the control thread; loads originate on the
//! I/O thread. [`SchemeLoaderFactory`] bridges the two: it checks each
//! request against the [`SchemeRegistry`], hands a [`RequestHandle`] to the
//! scheme's [`SchemeHandler`], and streams the handler's [`DataSource`] back
//! to the host's [`LoaderClient`].

pub mod control;
pub mod error;
pub mod handler;
pub mod loader;
pub mod proxy;
pub mod registry;
pub mod source;

use pd_core::BrowserResult;
use pd_ipc::PipeConfig;

pub use control::RequestHandle;
pub use error::LoadError;
pub use handler::SchemeHandler;
pub use handler::SchemeHandlerTable;
pub use handler::SharedSchemeHandler;
pub use loader::CompletionStatus;
pub use loader::LoaderClient;
pub use loader::LoaderHandle;
pub use loader::RedirectInfo;
pub use loader::SchemeLoaderFactory;
pub use registry::AuthoritySyntax;
pub use registry::SchemeDescriptor;
pub use registry::SchemeFlags;
pub use registry::SchemeRegistry;
pub use source::BufferSource;
pub use source::DataSource;
pub use source::ReadyNotifier;
pub use source::StreamSource;

/// Settings shared by every loader of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoaderConfig {
    pub pipe: PipeConfig,
}

impl LoaderConfig {
    pub fn hardened() -> BrowserResult<Self> {
        let config = Self {
            pipe: PipeConfig::hardened()?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BrowserResult<()> {
        self.pipe.validate()
    }
}
