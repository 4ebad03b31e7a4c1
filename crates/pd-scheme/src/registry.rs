//! Process-wide table of custom scheme descriptors.
//!
//! Application code registers schemes during startup; the startup sequence
//! then calls [`SchemeRegistry::lock`] exactly once, after which the table is
//! read-only. Rejected registrations are logged and returned as errors but
//! are never fatal.

use parking_lot::RwLock;
use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_net::Origin;
use pd_net::SchemeUrl;
use pd_net::url::is_builtin_scheme;
use pd_net::url::is_local_builtin_scheme;
use pd_net::url::normalize_scheme_name;
use std::collections::HashMap;
use std::ops::BitOr;

/// Which URL components a custom scheme's authority carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthoritySyntax {
    #[default]
    PathOnly,
    HostOnly,
    HostAndPort,
    HostPortAndUserInfo,
}

impl AuthoritySyntax {
    pub fn requires_port(self) -> bool {
        matches!(self, Self::HostAndPort | Self::HostPortAndUserInfo)
    }
}

/// Security and capability flags of a custom scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SchemeFlags(u16);

impl SchemeFlags {
    pub const SECURE: Self = Self(1 << 0);
    pub const LOCAL: Self = Self(1 << 1);
    pub const LOCAL_ACCESS_ALLOWED: Self = Self(1 << 2);
    pub const NO_ACCESS_ALLOWED: Self = Self(1 << 3);
    pub const SERVICE_WORKERS_ALLOWED: Self = Self(1 << 4);
    pub const VIEW_SOURCE_ALLOWED: Self = Self(1 << 5);
    pub const CSP_IGNORED: Self = Self(1 << 6);
    pub const CORS_ENABLED: Self = Self(1 << 7);
    pub const FETCH_API_ALLOWED: Self = Self(1 << 8);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SchemeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Registration record for one custom scheme.
///
/// The default value (empty name) is what lookups of unknown schemes return.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemeDescriptor {
    name: String,
    syntax: AuthoritySyntax,
    default_port: Option<u16>,
    flags: SchemeFlags,
}

impl SchemeDescriptor {
    pub fn new(name: &str, syntax: AuthoritySyntax) -> Self {
        Self {
            name: name.to_owned(),
            syntax,
            default_port: None,
            flags: SchemeFlags::empty(),
        }
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = Some(port);
        self
    }

    pub fn with_flags(mut self, flags: SchemeFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn syntax(&self) -> AuthoritySyntax {
        self.syntax
    }

    pub fn default_port(&self) -> Option<u16> {
        self.default_port
    }

    pub fn flags(&self) -> SchemeFlags {
        self.flags
    }

    pub fn has_flag(&self, flag: SchemeFlags) -> bool {
        self.flags.contains(flag)
    }

    /// True for the placeholder returned by failed lookups.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    /// Port-bearing syntaxes need a default port; the others must not set one.
    pub fn validate(&self) -> BrowserResult<()> {
        match (self.syntax.requires_port(), self.default_port) {
            (true, None) => Err(BrowserError::new(
                "scheme.port_required",
                format!(
                    "scheme `{}` uses {:?} syntax but has no default port",
                    self.name, self.syntax
                ),
            )),
            (false, Some(port)) => Err(BrowserError::new(
                "scheme.port_unexpected",
                format!(
                    "scheme `{}` uses {:?} syntax and cannot have default port {port}",
                    self.name, self.syntax
                ),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    schemes: HashMap<String, SchemeDescriptor>,
    locked: bool,
}

/// Registered custom schemes, shared by every profile of the process.
#[derive(Default)]
pub struct SchemeRegistry {
    state: RwLock<RegistryState>,
}

impl SchemeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: SchemeDescriptor) -> BrowserResult<()> {
        let mut state = self.state.write();

        if state.locked {
            return Err(rejected(
                "scheme.registry_locked",
                format!(
                    "cannot register scheme `{}` after the registry was locked",
                    descriptor.name
                ),
            ));
        }

        if descriptor.name.trim().is_empty() {
            return Err(rejected(
                "scheme.name_empty",
                "scheme name must not be empty",
            ));
        }

        let name = normalize_scheme_name(&descriptor.name).ok_or_else(|| {
            rejected(
                "scheme.name_invalid",
                format!("`{}` is not a valid URL scheme name", descriptor.name),
            )
        })?;

        if state.schemes.contains_key(&name) {
            return Err(rejected(
                "scheme.already_registered",
                format!("scheme `{name}` is already registered"),
            ));
        }

        if is_builtin_scheme(&name) {
            return Err(rejected(
                "scheme.name_reserved",
                format!("scheme `{name}` is a built-in scheme"),
            ));
        }

        if let Err(error) = descriptor.validate() {
            log::warn!("rejecting custom scheme: {error}");
            return Err(error);
        }

        log::debug!("registered custom scheme `{name}`");
        state.schemes.insert(
            name.clone(),
            SchemeDescriptor {
                name,
                ..descriptor
            },
        );
        Ok(())
    }

    /// Descriptor for `name`, or the empty descriptor when unknown.
    pub fn scheme_by_name(&self, name: &str) -> SchemeDescriptor {
        let key = name.trim().to_ascii_lowercase();
        self.state
            .read()
            .schemes
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        let key = name.trim().to_ascii_lowercase();
        self.state.read().schemes.contains_key(&key)
    }

    /// Makes the registry read-only. Idempotent.
    pub fn lock(&self) {
        let mut state = self.state.write();
        if !state.locked {
            state.locked = true;
            log::info!(
                "custom scheme registry locked with {} scheme(s)",
                state.schemes.len()
            );
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.read().locked
    }

    pub fn len(&self) -> usize {
        self.state.read().schemes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_local_scheme(&self, name: &str) -> bool {
        is_local_builtin_scheme(name) || self.scheme_by_name(name).has_flag(SchemeFlags::LOCAL)
    }

    /// Whether documents of scheme `name` may load `Local` schemes.
    pub fn may_access_local(&self, name: &str) -> bool {
        if is_local_builtin_scheme(name) {
            return true;
        }

        let flags = self.scheme_by_name(name).flags();
        flags.contains(SchemeFlags::LOCAL) || flags.contains(SchemeFlags::LOCAL_ACCESS_ALLOWED)
    }

    /// Applies the registered default port so origins compare consistently.
    pub fn normalize_origin(&self, origin: Origin) -> Origin {
        let default_port = self.scheme_by_name(origin.scheme()).default_port();
        origin.with_default_port(default_port)
    }

    pub fn origin_for(&self, url: &SchemeUrl) -> Origin {
        self.normalize_origin(url.origin())
    }
}

fn rejected(code: &'static str, message: impl Into<String>) -> BrowserError {
    let error = BrowserError::new(code, message);
    log::warn!("rejecting custom scheme: {error}");
    error
}
