//! Networking contracts for custom-scheme loads: URLs, origins, HTTP heads,
//! and byte ranges.

pub mod http;
pub mod range;
pub mod url;

use pd_core::BrowserResult;

pub use http::ContentType;
pub use http::Header;
pub use http::HttpMethod;
pub use http::HttpStatusCode;
pub use http::ResponseHead;
pub use range::ByteRange;
pub use range::ResolvedRange;
pub use url::Origin;
pub use url::SchemeUrl;

/// How the engine wants the request's initiator treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Navigate,
    NoCors,
    Cors,
    SameOrigin,
}

impl RequestMode {
    /// CORS-style modes cannot be evaluated without an initiator.
    pub fn requires_initiator(self) -> bool {
        matches!(self, Self::Cors | Self::SameOrigin)
    }
}

/// Load request handed to a loader factory by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub url: SchemeUrl,
    pub method: HttpMethod,
    pub headers: Vec<Header>,
    pub initiator: Option<Origin>,
    pub mode: RequestMode,
}

impl ResourceRequest {
    pub fn get(raw_url: &str) -> BrowserResult<Self> {
        Ok(Self {
            url: SchemeUrl::parse(raw_url)?,
            method: HttpMethod::Get,
            headers: Vec::new(),
            initiator: None,
            mode: RequestMode::Navigate,
        })
    }

    pub fn header(mut self, name: &str, value: &str) -> BrowserResult<Self> {
        self.headers.push(Header::new(name, value)?);
        Ok(self)
    }

    pub fn initiator(mut self, initiator: Origin) -> Self {
        self.initiator = Some(initiator);
        self
    }

    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        http::header_value(&self.headers, name)
    }
}
