//! SOCKS5 proxy cache with TTL-based refresh and round-robin querying.
//!
//! Three disjoint lists, identity keyed by proxy JID alone:
//! - **discovered**: proxies whose streamhost details we have confirmed,
//!   unbounded, most-recently-touched first
//! - **fallback**: operator-configured proxies, a bounded ring where the
//!   oldest entry is evicted
//! - **potential**: candidate JIDs from the discovery service, not yet
//!   queried, consumed round-robin and replaced wholesale on refresh
//!
//! The potential list is rotated once at a random pivot when installed, so
//! repeated connections do not hammer the same proxy first every time; it
//! is a single rotation, not a shuffle. A candidate whose query fails is
//! struck permanently; the wholesale replacement at the next TTL expiry is
//! the natural retry boundary.

use std::collections::VecDeque;

use lru::LruCache;
use rand::Rng;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::identity::Jid;
use crate::stanza::Streamhost;

// ============================================================================
// Cache policy constants
// ============================================================================

/// How long a fetched potential-proxy list stays fresh.
pub const PROXY_LIST_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Keep querying until this many proxies are known; once met, a single
/// keep-warm query per round suffices.
pub const PROXY_FLOOR: usize = 3;

/// Capacity of the fallback ring.
pub const FALLBACK_CAPACITY: usize = 5;

/// A confirmed SOCKS5 proxy: where to point a streamhost candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Socks5Proxy {
    pub jid: Jid,
    pub host: String,
    pub port: u16,
}

impl From<&Socks5Proxy> for Streamhost {
    fn from(proxy: &Socks5Proxy) -> Self {
        Streamhost {
            jid: proxy.jid.clone(),
            host: proxy.host.clone(),
            port: proxy.port,
        }
    }
}

/// Rotate `list` so that the element at `pivot` comes first. Pure; the
/// caller picks the pivot (randomly in production, fixed in tests).
pub(crate) fn rotate_at<T>(mut list: Vec<T>, pivot: usize) -> Vec<T> {
    if !list.is_empty() {
        let pivot = pivot % list.len();
        list.rotate_left(pivot);
    }
    list
}

#[derive(Clone, Debug)]
pub struct ProxyCacheStats {
    pub discovered: usize,
    pub fallback: usize,
    pub potential: usize,
    pub refresh_age: Option<Duration>,
}

pub struct ProxyCache {
    discovered: LruCache<Jid, Socks5Proxy>,
    fallback: VecDeque<Socks5Proxy>,
    potential: Vec<Jid>,
    cursor: usize,
    refreshed_at: Option<Instant>,
    floor: usize,
}

impl ProxyCache {
    pub fn new(floor: usize) -> Self {
        Self {
            discovered: LruCache::unbounded(),
            fallback: VecDeque::with_capacity(FALLBACK_CAPACITY),
            potential: Vec::new(),
            cursor: 0,
            refreshed_at: None,
            floor,
        }
    }

    /// Record a proxy whose streamhost details a query confirmed; touching
    /// an already-known JID moves it to the front.
    pub fn note_discovered(&mut self, proxy: Socks5Proxy) {
        debug!(proxy = %proxy.jid, "proxy confirmed");
        self.discovered.put(proxy.jid.clone(), proxy);
    }

    /// Add an operator-configured fallback proxy. The ring holds
    /// [`FALLBACK_CAPACITY`] entries; the oldest untouched entry is
    /// evicted. Re-adding a known JID refreshes its position instead of
    /// duplicating it.
    pub fn add_fallback(&mut self, proxy: Socks5Proxy) {
        self.fallback.retain(|p| p.jid != proxy.jid);
        self.fallback.push_back(proxy);
        while self.fallback.len() > FALLBACK_CAPACITY {
            if let Some(evicted) = self.fallback.pop_front() {
                debug!(proxy = %evicted.jid, "fallback ring full, evicting oldest");
            }
        }
    }

    /// Streamhost candidates to advertise in an outbound offer:
    /// discovered proxies first (most recently confirmed first), then the
    /// fallback ring.
    pub fn proxies_for_offer(&self) -> Vec<Socks5Proxy> {
        self.discovered
            .iter()
            .map(|(_, p)| p.clone())
            .chain(self.fallback.iter().cloned())
            .collect()
    }

    /// Whether the potential list must be fetched anew before querying.
    pub fn needs_refresh(&self) -> bool {
        if self.potential.is_empty() {
            return true;
        }
        match self.refreshed_at {
            Some(at) => at.elapsed() > PROXY_LIST_TTL,
            None => true,
        }
    }

    /// Install a freshly fetched candidate list, rotated once at a random
    /// pivot.
    pub fn replace_potential(&mut self, jids: Vec<Jid>) {
        let pivot = if jids.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..jids.len())
        };
        self.replace_potential_rotated(jids, pivot);
    }

    pub(crate) fn replace_potential_rotated(&mut self, jids: Vec<Jid>, pivot: usize) {
        debug!(candidates = jids.len(), "potential proxy list replaced");
        self.potential = rotate_at(jids, pivot);
        self.cursor = 0;
        self.refreshed_at = Some(Instant::now());
    }

    /// The next round-robin candidate to query, wrapping around.
    pub fn next_potential(&mut self) -> Option<Jid> {
        if self.potential.is_empty() {
            return None;
        }
        let jid = self.potential[self.cursor % self.potential.len()].clone();
        self.cursor += 1;
        Some(jid)
    }

    /// Permanently strike a candidate whose query failed; it will not be
    /// retried until the next wholesale refresh.
    pub fn strike(&mut self, jid: &Jid) {
        let before = self.potential.len();
        self.potential.retain(|j| j != jid);
        if self.potential.len() != before {
            debug!(proxy = %jid, "struck unresponsive proxy candidate");
            if self.potential.is_empty() {
                self.cursor = 0;
            } else {
                self.cursor %= self.potential.len();
            }
        }
    }

    /// How many proxy queries to issue this round: enough to reach the
    /// floor, or exactly one keep-warm query once the floor is met.
    pub fn wanted_queries(&self) -> usize {
        let have = self.discovered.len() + self.fallback.len();
        if have < self.floor {
            self.floor - have
        } else {
            1
        }
    }

    pub fn stats(&self) -> ProxyCacheStats {
        ProxyCacheStats {
            discovered: self.discovered.len(),
            fallback: self.fallback.len(),
            potential: self.potential.len(),
            refresh_age: self.refreshed_at.map(|at| at.elapsed()),
        }
    }
}

impl Default for ProxyCache {
    fn default() -> Self {
        Self::new(PROXY_FLOOR)
    }
}
