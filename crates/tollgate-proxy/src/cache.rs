//! Shared response cache hook.

use std::sync::Arc;

/// A cache of backend responses shared by every caller.
///
/// The proxy never reads from it; it only drops everything when the backend
/// rejects a caller's credentials outright.
pub trait ResponseCache: Send + Sync + std::fmt::Debug {
    fn invalidate_all(&self);
}

pub type SharedResponseCache = Arc<dyn ResponseCache>;

/// Cache that holds nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

impl ResponseCache for NoopCache {
    fn invalidate_all(&self) {}
}
