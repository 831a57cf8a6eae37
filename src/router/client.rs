//! RouterClient capability - the poller's only view of a router
//!
//! `is_reachable` is deliberately separate from `list_links`: a failed
//! session means "router down, every dependent link is down", while an
//! empty-but-successful listing is a valid result. Implementations block;
//! the poller wraps calls in `spawn_blocking`.

use anyhow::Result;

/// A raw netwatch row as reported by the router, before normalization
#[derive(Debug, Clone)]
pub struct RawLink {
    /// Link name (router-side comment, falling back to the probe host)
    pub name: String,
    /// Raw status string (`up` / `down` / anything else)
    pub status: String,
}

/// Router access capability, one instance per group
pub trait RouterClient: Send + Sync {
    /// Can a session be established right now?
    fn is_reachable(&self) -> bool;

    /// List the router's netwatch entries
    fn list_links(&self) -> Result<Vec<RawLink>>;
}
