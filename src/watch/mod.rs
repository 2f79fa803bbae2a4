//! # Watch relay
//!
//! Many consumers watching the same key share one store watch:
//!
//! ```text
//! StateStore ──watch──▶ relay task ──publish(topic = key)──▶ Bus
//!                          ▲                                  │
//!        register/release  │                     subscribe    ▼
//!   ListerWatcher ──HTTP──▶ WatchRegistry      ListerWatcher (×N) ──▶ handler
//! ```
//!
//! - [`WatchRegistry`] (server side) keeps at most one store watch per
//!   [`WatchedKey`] and reference-counts interest through [`WatchTicket`]s.
//! - [`ListerWatcher`] (client side) lists a snapshot, takes a ticket,
//!   subscribes to the bus, and always gives the ticket back.

pub mod client;
pub mod lister;
pub mod registry;

pub use client::{HttpRegistrar, RegistrationError, WatchRegistrar};
pub use lister::{ListedObject, ListerWatcher, WatchError, WatchGuard, WatchHandle};
pub use registry::{
    RegistryConfig, RegistryError, WatchCommand, WatchRegistry, WatchReply, WatchStat,
};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::store::REGISTRY_ROOT;

/// Path prefix of the watch registration routes
pub const WATCH_ROUTE_ROOT: &str = "/watch";

/// Opaque claim on a shared watch, issued by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchTicket(pub u64);

impl fmt::Display for WatchTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Body of a successful registration: `{"T": <ticket>}`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TicketResponse {
    #[serde(rename = "T")]
    pub ticket: WatchTicket,
}

/// Identity of a shared watch: a key plus whether it covers the whole prefix
///
/// `/registry/pod/default` as a prefix watch and as a point watch are two
/// different identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchedKey {
    pub key: String,

    #[serde(rename = "withPrefix")]
    pub with_prefix: bool,
}

impl WatchedKey {
    /// Watch a single key
    pub fn point(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            with_prefix: false,
        }
    }

    /// Watch every key under a prefix
    pub fn prefix(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            with_prefix: true,
        }
    }

    /// Collection key for one kind in one namespace
    pub fn collection(kind: &str, namespace: &str) -> Self {
        Self::prefix(format!("{}/{}/{}", REGISTRY_ROOT, kind, namespace))
    }

    /// Key of a single named object
    pub fn object(kind: &str, namespace: &str, name: &str) -> Self {
        Self::point(format!("{}/{}/{}/{}", REGISTRY_ROOT, kind, namespace, name))
    }

    /// Registration route for this key.
    ///
    /// Collections (`/registry/<kind>/<ns>`) map to `/watch/<kind>/<ns>` and
    /// objects (`/registry/<kind>/<ns>/<name>`) to `/watch/<kind>/<ns>/<name>`.
    /// Returns `None` for keys outside that layout or whose mode does not
    /// match the path shape.
    pub fn watch_path(&self) -> Option<String> {
        let rest = self.key.strip_prefix(REGISTRY_ROOT)?.strip_prefix('/')?;
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        match (segments.len(), self.with_prefix) {
            (2, true) | (3, false) => Some(format!("{}/{}", WATCH_ROUTE_ROOT, rest)),
            _ => None,
        }
    }

    /// Inverse of [`WatchedKey::watch_path`], given the part after `/watch/`
    pub fn from_watch_path(path: &str) -> Option<Self> {
        let path = path.trim_matches('/');
        let segments: Vec<&str> = path.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        let key = format!("{}/{}", REGISTRY_ROOT, path);
        match segments.len() {
            2 => Some(Self::prefix(key)),
            3 => Some(Self::point(key)),
            _ => None,
        }
    }
}

impl fmt::Display for WatchedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.with_prefix {
            write!(f, "{} (prefix)", self.key)
        } else {
            write!(f, "{}", self.key)
        }
    }
}
