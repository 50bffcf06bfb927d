//! # Identity Types
//!
//! This module defines the identity types used throughout siphon:
//!
//! - [`Jid`]: an XMPP address (`node@domain/resource`), the wire-level peer
//!   identifier used in stanzas and registry keys
//! - [`Handle`]: a stable opaque integer standing in for a contact
//! - [`HandleMap`]: the reference-counted string↔handle service the factory
//!   and the groupchat transport use for lookups
//!
//! ## Identity Model
//!
//! Bytestreams are keyed by the *exact* JID string the peer used, resource
//! included. Two peers offering the same stream id never collide because the
//! JID is part of the key; the same peer reconnecting under a different
//! resource is, deliberately, a different endpoint.
//!
//! Handles exist so consumers can refer to contacts without holding string
//! JIDs: a handle stays valid for as long as at least one reference is held,
//! and lookups never allocate.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// An XMPP address. Stored verbatim; accessors split on demand.
///
/// Equality and hashing are by exact string match, which is what the
/// bytestream registry keys require.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Jid(String);

impl Jid {
    pub fn new(jid: impl Into<String>) -> Self {
        Self(jid.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after `/`, if any.
    pub fn resource(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, r)| r)
    }

    /// Everything before the `/`.
    pub fn bare_str(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(b, _)| b)
    }

    /// A copy of this JID with the resource stripped.
    pub fn to_bare(&self) -> Jid {
        Jid(self.bare_str().to_owned())
    }

    pub fn is_bare(&self) -> bool {
        !self.0.contains('/')
    }

    /// The part before `@`, if any.
    pub fn node(&self) -> Option<&str> {
        self.bare_str().split_once('@').map(|(n, _)| n)
    }

    pub fn domain(&self) -> &str {
        let bare = self.bare_str();
        bare.split_once('@').map_or(bare, |(_, d)| d)
    }

    /// A copy of this JID with the resource replaced.
    pub fn with_resource(&self, resource: &str) -> Jid {
        Jid(format!("{}/{}", self.bare_str(), resource))
    }
}

impl std::fmt::Display for Jid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for Jid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Jid({})", self.0)
    }
}

impl From<&str> for Jid {
    fn from(s: &str) -> Self {
        Jid(s.to_owned())
    }
}

impl From<String> for Jid {
    fn from(s: String) -> Self {
        Jid(s)
    }
}

/// Opaque contact identity. Valid while at least one reference is held in
/// the originating [`HandleMap`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle(u32);

impl Handle {
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

struct HandleEntry {
    jid: String,
    refs: u32,
}

#[derive(Default)]
struct HandleMapInner {
    next: u32,
    by_jid: HashMap<String, Handle>,
    by_handle: HashMap<Handle, HandleEntry>,
}

/// Reference-counted bidirectional map between JID strings and handles.
///
/// `ensure` mints a handle on first sight and bumps the refcount on every
/// later call; `unref` releases one reference and frees the entry when the
/// count reaches zero. `handle_of` is a pure lookup and never inserts,
/// which is what the groupchat transport relies on to drop data from
/// senders it has never admitted.
pub struct HandleMap {
    inner: Mutex<HandleMapInner>,
}

impl HandleMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HandleMapInner {
                next: 1,
                ..Default::default()
            }),
        }
    }

    /// Look up or create the handle for a JID, taking a reference.
    pub fn ensure(&self, jid: &Jid) -> Handle {
        let mut inner = self.inner.lock().expect("handle map poisoned");
        if let Some(&handle) = inner.by_jid.get(jid.as_str()) {
            if let Some(entry) = inner.by_handle.get_mut(&handle) {
                entry.refs += 1;
            }
            return handle;
        }
        let handle = Handle(inner.next);
        inner.next += 1;
        inner.by_jid.insert(jid.as_str().to_owned(), handle);
        inner.by_handle.insert(
            handle,
            HandleEntry {
                jid: jid.as_str().to_owned(),
                refs: 1,
            },
        );
        handle
    }

    /// Pure lookup; never inserts.
    pub fn handle_of(&self, jid: &Jid) -> Option<Handle> {
        let inner = self.inner.lock().expect("handle map poisoned");
        inner.by_jid.get(jid.as_str()).copied()
    }

    /// The JID a handle was minted for, if the handle is still live.
    pub fn jid_of(&self, handle: Handle) -> Option<Jid> {
        let inner = self.inner.lock().expect("handle map poisoned");
        inner.by_handle.get(&handle).map(|e| Jid::new(e.jid.clone()))
    }

    /// Release one reference; the entry is freed at zero.
    pub fn unref(&self, handle: Handle) {
        let mut inner = self.inner.lock().expect("handle map poisoned");
        let remove = match inner.by_handle.get_mut(&handle) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = inner.by_handle.remove(&handle) {
                inner.by_jid.remove(&entry.jid);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("handle map poisoned").by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleMap {
    fn default() -> Self {
        Self::new()
    }
}
