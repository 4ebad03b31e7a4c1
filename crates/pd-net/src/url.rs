//! URL and origin contracts for custom schemes.

use pd_core::BrowserError;
use pd_core::BrowserResult;
use url::Url;

/// Schemes the engine implements itself; applications cannot take them over.
pub const BUILTIN_SCHEMES: &[&str] = &[
    "blob",
    "data",
    "javascript",
    "resource",
    "http",
    "https",
    "file",
    "ftp",
    "ws",
    "wss",
    "filesystem",
];

/// Built-in schemes whose content is local to the machine.
const LOCAL_BUILTIN_SCHEMES: &[&str] = &["file"];

pub fn is_builtin_scheme(name: &str) -> bool {
    BUILTIN_SCHEMES
        .iter()
        .any(|builtin| builtin.eq_ignore_ascii_case(name.trim()))
}

pub fn is_local_builtin_scheme(name: &str) -> bool {
    LOCAL_BUILTIN_SCHEMES
        .iter()
        .any(|builtin| builtin.eq_ignore_ascii_case(name.trim()))
}

/// Lower-cases a scheme name and checks it is a valid URL scheme token.
pub fn normalize_scheme_name(name: &str) -> Option<String> {
    let normalized = name.trim().to_ascii_lowercase();
    let mut bytes = normalized.bytes();
    let first = bytes.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }

    if bytes.all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'-' | b'.')) {
        Some(normalized)
    } else {
        None
    }
}

/// Canonical URL for a custom-scheme request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemeUrl {
    parsed: Url,
}

impl SchemeUrl {
    pub fn parse(input: &str) -> BrowserResult<Self> {
        let mut parsed = Url::parse(input.trim()).map_err(|error| {
            BrowserError::new(
                "net.url.invalid",
                format!("failed to parse URL `{input}`: {error}"),
            )
        })?;

        // Fragments never reach a scheme handler.
        parsed.set_fragment(None);

        Ok(Self { parsed })
    }

    pub fn as_str(&self) -> &str {
        self.parsed.as_str()
    }

    pub fn scheme(&self) -> &str {
        self.parsed.scheme()
    }

    pub fn host(&self) -> Option<&str> {
        self.parsed.host_str().filter(|host| !host.is_empty())
    }

    pub fn port(&self) -> Option<u16> {
        self.parsed.port_or_known_default()
    }

    pub fn path(&self) -> &str {
        self.parsed.path()
    }

    pub fn origin(&self) -> Origin {
        match self.host() {
            Some(host) => Origin {
                scheme: self.scheme().to_owned(),
                host: Some(host.to_ascii_lowercase()),
                port: self.port(),
            },
            None => Origin::opaque(self.scheme()),
        }
    }
}

impl std::fmt::Display for SchemeUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security origin of a request or initiator.
///
/// Host-less URLs get an opaque origin which is never same-origin with
/// anything, itself included.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: String,
    host: Option<String>,
    port: Option<u16>,
}

impl Origin {
    pub fn new(scheme: &str, host: &str, port: Option<u16>) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: Some(host.to_ascii_lowercase()),
            port,
        }
    }

    pub fn opaque(scheme: &str) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: None,
            port: None,
        }
    }

    /// Parses a serialized origin such as `https://example.com:8443`.
    pub fn parse(input: &str) -> BrowserResult<Self> {
        SchemeUrl::parse(input).map(|url| url.origin())
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_opaque(&self) -> bool {
        self.host.is_none()
    }

    /// Fills in a scheme-specific default port when none was explicit.
    pub fn with_default_port(mut self, default_port: Option<u16>) -> Self {
        if self.port.is_none() && !self.is_opaque() {
            self.port = default_port;
        }
        self
    }

    pub fn is_same_origin(&self, other: &Origin) -> bool {
        !self.is_opaque() && !other.is_opaque() && self == other
    }

    /// Serialization used for `Origin`/`Access-Control-Allow-Origin`.
    pub fn serialize(&self) -> String {
        match (&self.host, self.port) {
            (None, _) => "null".to_owned(),
            (Some(host), None) => format!("{}://{host}", self.scheme),
            (Some(host), Some(port)) => format!("{}://{host}:{port}", self.scheme),
        }
    }
}
