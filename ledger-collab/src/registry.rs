//! Room registry: creation, lookup, deletion and retention.
//!
//! The map only holds [`RoomHandle`]s. Looking a room up clones its handle
//! and releases the lock before any command is sent, so a slow room never
//! blocks the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ledger_core::now_millis;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::RoomConfig;
use crate::error::RoomError;
use crate::protocol::{RoomSnapshot, RoomSummary};
use crate::room_id::RoomCode;
use crate::sequencer::RoomHandle;

/// Owns every live room of the process.
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomCode, RoomHandle>>,
    config: RoomConfig,
}

impl RoomManager {
    pub fn new(config: RoomConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    /// Create an empty room under a fresh code and start its sequencer.
    pub async fn create(&self) -> RoomHandle {
        let mut rooms = self.rooms.write().await;
        // Checked under the write lock so two creators cannot pick the same code.
        let code = loop {
            let candidate = RoomCode::generate();
            if !rooms.contains_key(&candidate) {
                break candidate;
            }
            log::debug!("Room code {candidate} already taken, retrying");
        };

        let handle = RoomHandle::spawn(code.clone(), &self.config, now_millis());
        rooms.insert(code.clone(), handle.clone());
        log::info!("Room {code} created ({} active)", rooms.len());
        handle
    }

    pub async fn get(&self, code: &str) -> Result<RoomHandle, RoomError> {
        let key = RoomCode::parse(code).map_err(|_| RoomError::RoomNotFound(code.to_string()))?;
        self.rooms
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| RoomError::RoomNotFound(key.to_string()))
    }

    /// Remove a room and stop its sequencer.
    pub async fn delete(&self, code: &str) -> Result<(), RoomError> {
        let key = RoomCode::parse(code).map_err(|_| RoomError::RoomNotFound(code.to_string()))?;
        let handle = self
            .rooms
            .write()
            .await
            .remove(&key)
            .ok_or_else(|| RoomError::RoomNotFound(key.to_string()))?;
        handle.close().await;
        log::info!("Room {key} deleted");
        Ok(())
    }

    /// Empty the room's state and logs in place.
    pub async fn reset(&self, code: &str) -> Result<u64, RoomError> {
        self.get(code).await?.reset().await
    }

    pub async fn summary(&self, code: &str) -> Result<RoomSummary, RoomError> {
        self.get(code).await?.summary().await
    }

    pub async fn full_state(&self, code: &str) -> Result<RoomSnapshot, RoomError> {
        self.get(code).await?.snapshot().await
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_codes(&self) -> Vec<RoomCode> {
        let mut codes: Vec<RoomCode> = self.rooms.read().await.keys().cloned().collect();
        codes.sort();
        codes
    }

    /// Delete rooms with no participants that are older than the retention
    /// window. Participants are never removed, so a room anyone joined is
    /// kept. Returns the swept codes.
    pub async fn sweep(&self, now: u64) -> Vec<RoomCode> {
        let retention = self.config.retention.as_millis() as u64;
        let expired: Vec<RoomHandle> = {
            let mut rooms = self.rooms.write().await;
            let codes: Vec<RoomCode> = rooms
                .values()
                .filter(|h| {
                    h.participant_count() == 0 && now.saturating_sub(h.created_at()) > retention
                })
                .map(|h| h.code().clone())
                .collect();
            codes.iter().filter_map(|code| rooms.remove(code)).collect()
        };

        let mut swept = Vec::with_capacity(expired.len());
        for handle in expired {
            handle.close().await;
            log::info!("Room {} swept (empty and expired)", handle.code());
            swept.push(handle.code().clone());
        }
        swept
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the manager is dropped.
    pub fn spawn_retention(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let swept = manager.sweep(now_millis()).await;
                if !swept.is_empty() {
                    log::info!("Retention sweep removed {} rooms", swept.len());
                }
            }
        })
    }
}
