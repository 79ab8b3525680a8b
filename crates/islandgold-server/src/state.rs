use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::RwLock;

use islandgold_core::player::ConnectionId;

use crate::config::ServerConfig;
use crate::match_registry::MatchRegistry;

pub type SharedMatchRegistry = Arc<RwLock<MatchRegistry>>;

#[derive(Clone)]
pub struct AppState {
    pub matches: SharedMatchRegistry,
    pub config: Arc<ServerConfig>,
    pub ws_connection_count: Arc<AtomicUsize>,
    next_connection_id: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let registry = MatchRegistry::new(
            config.game.clone(),
            config.matches.default_match.clone(),
            config.matches.tick_interval(),
            config.limits.max_matches,
        );
        Self {
            matches: Arc::new(RwLock::new(registry)),
            config: Arc::new(config),
            ws_connection_count: Arc::new(AtomicUsize::new(0)),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Fresh id for an accepted socket. Never reused while the process lives.
    pub fn alloc_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Holds one slot of the WebSocket connection cap; released on drop.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    /// Take a slot if fewer than `max` are held.
    pub fn try_acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        Some(Self {
            counter: Arc::clone(counter),
        })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
