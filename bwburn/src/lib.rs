use core::sync::atomic::{AtomicUsize, Ordering};

use http::Uri;

pub mod cfg;
pub mod client;
pub mod cmd;
pub mod engine;
pub mod logging;
pub mod runtime;
pub mod stat;
pub mod ua;

/// Thread-safe endless cycle over the configured URL list.
///
/// Yields every URL in declared order, then wraps back to the first,
/// forever. The atomic index hands out items on demand: a URL is claimed
/// only at the moment an idle worker asks for its next target, so the feed
/// itself balances load across however many workers share it.
#[derive(Debug)]
pub struct UrlFeed {
    urls: Vec<Uri>,
    idx: AtomicUsize,
}

impl UrlFeed {
    /// Constructs a new [`UrlFeed`] over the given non-empty list.
    #[inline]
    pub const fn new(urls: Vec<Uri>) -> Self {
        Self { urls, idx: AtomicUsize::new(0) }
    }

    /// Claims and returns the next URL in the cycle.
    #[inline]
    pub fn next(&self) -> &Uri {
        // Increment the current value, returning the previous one.
        let idx = self.idx.fetch_add(1, Ordering::Relaxed);

        &self.urls[idx % self.urls.len()]
    }
}
