//! The room registry: creation, lookup, destruction, quotas.
//!
//! The registry owns every live room handle behind a reader-writer lock and
//! hands out room IDs from the same bitmap allocator the rooms use for user
//! IDs. Rooms destroy themselves; the registry only learns about it through
//! the buffered stop-signal bus, whose single consumer removes the entry
//! and frees the ID. An idle sweeper walks the table once a minute and
//! destroys rooms that have been empty and inactive past the configured
//! threshold.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::ServerError;
use crate::id_alloc::{round_up_to_64, SafeIdAllocator};
use crate::room::{Room, RoomHandle};
use crate::world::WorldFactory;

const STOP_BUS_CAPACITY: usize = 100;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Registry {
    rooms: RwLock<HashMap<u32, Arc<RoomHandle>>>,
    alloc: SafeIdAllocator,
    stop_tx: mpsc::Sender<u32>,
    factory: WorldFactory,
    cfg: Config,
}

impl Registry {
    /// Builds the registry and starts its two background tasks: the
    /// stop-signal consumer and the idle sweeper. Both hold only a weak
    /// reference, so dropping the last strong `Arc` shuts them down.
    pub fn new(cfg: Config, factory: WorldFactory) -> Arc<Registry> {
        let (stop_tx, mut stop_rx) = mpsc::channel(STOP_BUS_CAPACITY);

        let registry = Arc::new(Registry {
            rooms: RwLock::new(HashMap::new()),
            alloc: SafeIdAllocator::new(round_up_to_64(cfg.server.max_room_number.max(1))),
            stop_tx,
            factory,
            cfg,
        });

        let weak: Weak<Registry> = Arc::downgrade(&registry);
        tokio::spawn(async move {
            while let Some(room_id) = stop_rx.recv().await {
                match weak.upgrade() {
                    Some(registry) => {
                        debug!("registry: stop signal from room {}", room_id);
                        registry.remove(room_id);
                    }
                    None => break,
                }
            }
        });

        let weak: Weak<Registry> = Arc::downgrade(&registry);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await; // the immediate first tick sweeps nothing
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(registry) => registry.sweep_idle_rooms(),
                    None => break,
                }
            }
        });

        registry
    }

    /// Creates a room and starts its event loop. Fails when the room cap or
    /// the ID pool is exhausted.
    pub fn create(&self, name: &str, key: &str) -> Result<Arc<RoomHandle>, ServerError> {
        let mut rooms = self.rooms.write().unwrap();
        if rooms.len() >= self.cfg.server.max_room_number as usize {
            return Err(ServerError::QuotaExceeded);
        }

        let room_id = self.alloc.allocate()?;
        let name = if name.is_empty() {
            format!("room_{}", room_id)
        } else {
            name.to_string()
        };

        let handle = Room::spawn(
            room_id,
            name,
            key.to_string(),
            &self.cfg.lockstep,
            &self.factory,
            self.stop_tx.clone(),
        );
        rooms.insert(room_id, Arc::clone(&handle));
        info!("registry: room {} created", room_id);
        Ok(handle)
    }

    pub fn get(&self, room_id: u32) -> Option<Arc<RoomHandle>> {
        self.rooms.read().unwrap().get(&room_id).cloned()
    }

    pub fn list(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.rooms.read().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap().len()
    }

    /// Drops the reference and returns the ID to the allocator. Idempotent;
    /// safe to call for rooms that already vanished.
    pub fn remove(&self, room_id: u32) {
        let removed = self.rooms.write().unwrap().remove(&room_id);
        if removed.is_some() {
            self.alloc.free(room_id);
            info!("registry: room {} removed", room_id);
        }
    }

    /// Destroys rooms that have been empty and idle past the threshold.
    /// Destruction is asynchronous: the room tears itself down and reports
    /// back over the stop bus. Runs once a minute on the sweeper task; also
    /// callable directly.
    pub fn sweep_idle_rooms(&self) {
        let idle_after = Duration::from_secs(self.cfg.server.idle_room_timeout_secs);
        let candidates: Vec<Arc<RoomHandle>> = {
            let rooms = self.rooms.read().unwrap();
            rooms
                .values()
                .filter(|h| {
                    !h.shared.is_destroyed()
                        && h.shared.player_count() == 0
                        && h.shared.idle_for() >= idle_after
                })
                .cloned()
                .collect()
        };

        for handle in candidates {
            info!(
                "registry: sweeping idle room {} (idle {:?})",
                handle.shared.id,
                handle.shared.idle_for()
            );
            handle.destroy();
        }
    }

    /// Tears down every room, for server shutdown.
    pub fn destroy_all(&self) {
        let handles: Vec<Arc<RoomHandle>> = self.rooms.read().unwrap().values().cloned().collect();
        if !handles.is_empty() {
            error!("registry: destroying {} rooms on shutdown", handles.len());
        }
        for handle in handles {
            handle.destroy();
        }
    }
}
