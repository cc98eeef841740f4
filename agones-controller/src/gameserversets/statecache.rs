//! A shadow of very recent GameServer creations & deletions.
//!
//! Cluster watches are eventually consistent: a freshly created GameServer can
//! take hundreds of milliseconds to show up in the local cache, and deletions
//! linger just as long. Without this cache the reconciler would re-create
//! already-created instances on every sync during that lag.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use agones_core::crd::{GameServer, GameServerSet, RequiredMetadata};

/// How long a shadow entry may contradict the cache before it is discarded.
const MAX_SHADOW_ENTRY_AGE: Duration = Duration::from_secs(60);

/// Per-GameServerSet shadow caches, keyed by `namespace/name`.
#[derive(Default)]
pub struct GameServerSetStateCache {
    entries: Mutex<HashMap<String, Arc<GameServerStateCache>>>,
}

impl GameServerSetStateCache {
    /// The shadow cache for the given set, created on first use.
    pub fn for_set(&self, gss: &GameServerSet) -> Arc<GameServerStateCache> {
        let key = set_key(gss);
        self.lock().entry(key).or_insert_with(Default::default).clone()
    }

    /// Drop the shadow cache of a deleted set.
    pub fn delete_set(&self, gss: &GameServerSet) {
        self.lock().remove(&set_key(gss));
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<GameServerStateCache>>> {
        self.entries.lock().expect("state cache lock poisoned")
    }
}

fn set_key(gss: &GameServerSet) -> String {
    format!("{}/{}", RequiredMetadata::namespace(gss), RequiredMetadata::name(gss))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Intent {
    Created,
    Deleted,
}

struct ShadowEntry {
    intent: Intent,
    game_server: GameServer,
    recorded_at: Instant,
}

/// The shadow map of one GameServerSet: UID to recent local intent.
#[derive(Default)]
pub struct GameServerStateCache {
    entries: Mutex<HashMap<String, ShadowEntry>>,
}

impl GameServerStateCache {
    /// Record that the given GameServer was just created by this controller.
    pub fn created(&self, gs: &GameServer) {
        self.record(gs, Intent::Created);
    }

    /// Record that the given GameServer was just torn down by this controller.
    pub fn deleted(&self, gs: &GameServer) {
        self.record(gs, Intent::Deleted);
    }

    fn record(&self, gs: &GameServer, intent: Intent) {
        self.lock().insert(
            RequiredMetadata::uid(gs).to_string(),
            ShadowEntry {
                intent,
                game_server: gs.clone(),
                recorded_at: Instant::now(),
            },
        );
    }

    /// Overlay the shadow map onto a freshly listed server set: recently
    /// created GameServers missing from the list are merged in, recently
    /// deleted ones still in the list are hidden. Entries the cache has
    /// caught up with, and entries past the staleness window, are dropped.
    pub fn reconcile_with_updated_server_list(&self, list: Vec<GameServer>) -> Vec<GameServer> {
        let mut entries = self.lock();
        let now = Instant::now();
        let listed: HashSet<String> = list.iter().map(|gs| RequiredMetadata::uid(gs).to_string()).collect();

        entries.retain(|uid, entry| {
            if now.duration_since(entry.recorded_at) > MAX_SHADOW_ENTRY_AGE {
                return false;
            }
            match entry.intent {
                // The cache agrees once the created GameServer shows up...
                Intent::Created => !listed.contains(uid),
                // ...or the deleted one disappears.
                Intent::Deleted => listed.contains(uid),
            }
        });

        let mut result = Vec::with_capacity(list.len() + entries.len());
        for gs in list {
            let hidden = entries
                .get(RequiredMetadata::uid(&gs))
                .map(|entry| entry.intent == Intent::Deleted)
                .unwrap_or(false);
            if !hidden {
                result.push(gs);
            }
        }
        for entry in entries.values() {
            if entry.intent == Intent::Created && !listed.contains(RequiredMetadata::uid(&entry.game_server)) {
                result.push(entry.game_server.clone());
            }
        }
        result
    }

    /// The number of live shadow entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ShadowEntry>> {
        self.entries.lock().expect("state cache lock poisoned")
    }
}
