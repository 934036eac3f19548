//! Identity table
//!
//! Indexes guarded by one lock:
//! - URI → server identity, for dispatching incoming calls
//! - object → server identity, so publishing the same object twice finds
//!   the identity it already has
//! - URL → proxy identity, so proxies to one object share an identity
//!
//! Proxy identities are held weakly; a proxy nobody references is purged
//! on the next registration or by [`IdentityTable::purge_dead`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use super::uri::table_key;
use super::{Identity, ServerIdentity, ServerState};
use crate::error::{RemotingError, Result};

#[derive(Default)]
struct Tables {
    by_uri: HashMap<String, Arc<ServerIdentity>>,
    by_object: HashMap<usize, Arc<ServerIdentity>>,
    clients: HashMap<String, Weak<Identity>>,
}

fn is_dead(identity: &ServerIdentity) -> bool {
    identity.state() == ServerState::FullyDisconnected && !identity.retained_alive()
}

/// Identity indexes of a domain
#[derive(Default)]
pub struct IdentityTable {
    inner: RwLock<Tables>,
}

impl IdentityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server identity published under `uri`
    pub fn lookup_server(&self, uri: &str) -> Option<Arc<ServerIdentity>> {
        self.inner.read().by_uri.get(&table_key(uri)).cloned()
    }

    /// Live proxy identity for `url`
    pub fn lookup_client(&self, url: &str) -> Option<Arc<Identity>> {
        self.inner
            .read()
            .clients
            .get(&table_key(url))
            .and_then(Weak::upgrade)
    }

    /// Server identity of a published object instance
    pub(crate) fn server_for_object(&self, key: usize) -> Option<Arc<ServerIdentity>> {
        self.inner.read().by_object.get(&key).cloned()
    }

    /// Register a server identity under its URI
    ///
    /// A URI taken by a live identity is rejected. A URI held by an identity
    /// whose retained object has since been dropped is reclaimed.
    pub(crate) fn register_server(&self, identity: Arc<ServerIdentity>) -> Result<()> {
        let uri = identity
            .uri()
            .ok_or_else(|| RemotingError::InvalidMessage("server identity has no URI".into()))?;
        let key = table_key(&uri);
        let mut tables = self.inner.write();

        if let Some(existing) = tables.by_uri.get(&key) {
            if !is_dead(existing) {
                return Err(RemotingError::UriInUse(uri));
            }
            if let Some(stale) = tables.by_uri.remove(&key) {
                if let Some(object) = stale.object_key() {
                    tables.by_object.remove(&object);
                }
                debug!(uri = %uri, "reclaimed URI of dropped object");
            }
        }

        if let Some(object) = identity.object_key() {
            tables.by_object.insert(object, identity.clone());
        }
        tables.by_uri.insert(key, identity);
        Ok(())
    }

    /// Proxy identity for `url`, registering the one `make` builds if none
    /// is alive
    pub(crate) fn find_or_register_client(&self, url: &str, make: impl FnOnce() -> Identity) -> Arc<Identity> {
        let key = table_key(url);
        let mut tables = self.inner.write();
        if let Some(identity) = tables.clients.get(&key).and_then(Weak::upgrade) {
            return identity;
        }
        tables.clients.retain(|_, weak| weak.strong_count() > 0);
        let identity = Arc::new(make());
        tables.clients.insert(key, Arc::downgrade(&identity));
        identity
    }

    /// Remove a server identity from the URI and object indexes
    pub(crate) fn remove_server(&self, identity: &Arc<ServerIdentity>) -> bool {
        let mut tables = self.inner.write();
        let mut removed = false;
        if let Some(uri) = identity.uri() {
            let key = table_key(&uri);
            if matches!(tables.by_uri.get(&key), Some(current) if Arc::ptr_eq(current, identity)) {
                tables.by_uri.remove(&key);
                removed = true;
            }
        }
        if let Some(object) = identity.object_key() {
            if matches!(tables.by_object.get(&object), Some(current) if Arc::ptr_eq(current, identity)) {
                tables.by_object.remove(&object);
                removed = true;
            }
        }
        removed
    }

    /// Drop dead proxy entries and expired identities whose object is gone
    pub fn purge_dead(&self) -> usize {
        let mut tables = self.inner.write();
        let before = tables.by_uri.len() + tables.clients.len();
        let mut dropped_objects = Vec::new();
        tables.by_uri.retain(|_, identity| {
            let dead = is_dead(identity);
            if dead {
                dropped_objects.extend(identity.object_key());
            }
            !dead
        });
        for key in dropped_objects {
            tables.by_object.remove(&key);
        }
        tables.clients.retain(|_, weak| weak.strong_count() > 0);
        before - (tables.by_uri.len() + tables.clients.len())
    }

    /// Registered server identities
    pub fn server_count(&self) -> usize {
        self.inner.read().by_uri.len()
    }

    /// Live proxy identities
    pub fn client_count(&self) -> usize {
        self.inner
            .read()
            .clients
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}
