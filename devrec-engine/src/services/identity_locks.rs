//! Per-identity advisory locks
//!
//! Serializes resolve → classify → apply for observations that name the same
//! physical device. An observation locks its serial and mac keys, or its api
//! id / ip key when it has neither. Keys are acquired in sorted order so two
//! observations sharing several keys cannot deadlock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::models::Observation;

#[derive(Debug, Default)]
pub struct IdentityLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held locks; dropping it releases every key
#[derive(Debug)]
pub struct IdentityGuard<'a> {
    owner: &'a IdentityLocks,
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock keys for `observation`, sorted and deduplicated
    pub fn keys_for(observation: &Observation) -> Vec<String> {
        let manufacturer = observation.manufacturer.trim().to_ascii_lowercase();
        let mut keys = Vec::new();

        if let Some(serial) = &observation.serial_number {
            keys.push(format!("serial:{}:{}", manufacturer, serial));
        }
        if let Some(mac) = &observation.mac_address {
            keys.push(format!("mac:{}", mac));
        }
        if keys.is_empty() {
            if let Some(api_id) = &observation.api_device_id {
                keys.push(format!("api:{}:{}", manufacturer, api_id));
            } else if let Some(ip) = observation.ip {
                keys.push(format!("ip:{}", ip));
            }
        }

        keys.sort();
        keys.dedup();
        keys
    }

    pub async fn acquire(&self, observation: &Observation) -> IdentityGuard<'_> {
        let keys = Self::keys_for(observation);
        let mut guards = Vec::with_capacity(keys.len());

        for key in &keys {
            let lock = self.entry(key);
            guards.push(lock.lock_owned().await);
        }

        IdentityGuard {
            owner: self,
            keys,
            guards,
        }
    }

    /// Number of keys currently tracked (held or awaited)
    pub fn tracked(&self) -> usize {
        self.table().len()
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.table()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forget keys nobody holds or waits on
    fn release(&self, keys: &[String]) {
        let mut table = self.table();
        for key in keys {
            if let Some(lock) = table.get(key) {
                // The table's own reference is the only one left
                if Arc::strong_count(lock) == 1 {
                    table.remove(key);
                }
            }
        }
    }
}

impl IdentityGuard<'_> {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        self.owner.release(&self.keys);
    }
}
