//! Two-way controller token ↔ device id mapping
//!
//! Backed by two independent concurrent maps. Each single-map operation is
//! atomic, but an update touches the two maps one after the other, so a
//! reader racing an update may briefly see only one direction of a pair (or
//! neither, during a move). Once updates quiesce the maps agree:
//! `token_to_device[t] == d` exactly when `device_to_token[d] == t`.
//!
//! Tokens without an assigned (non-negative) device id are never stored. A
//! device id belongs to at most one token; the most recent claim wins.

use dashmap::DashMap;

use crate::types::{ControllerToken, DeviceId};

#[derive(Debug, Default)]
pub struct DeviceMap {
    token_to_device: DashMap<ControllerToken, DeviceId>,
    device_to_token: DashMap<DeviceId, ControllerToken>,
}

impl DeviceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `token ↔ device_id`; unassigned ids are ignored
    ///
    /// Returns false if nothing was stored.
    pub fn insert(&self, token: &ControllerToken, device_id: DeviceId) -> bool {
        if !device_id.is_assigned() {
            return false;
        }

        if let Some(previous) = self.token_to_device.insert(token.clone(), device_id) {
            if previous != device_id {
                self.device_to_token.remove_if(&previous, |_, owner| owner == token);
            }
        }
        self.claim_device(token, device_id);
        true
    }

    /// Move `token` from `old` to `new`: remove the old pair, then insert the new one
    pub fn move_device(&self, token: &ControllerToken, old: DeviceId, new: DeviceId) -> bool {
        if !new.is_assigned() {
            return false;
        }

        self.device_to_token.remove_if(&old, |_, owner| owner == token);
        self.token_to_device.remove(token);
        self.claim_device(token, new);
        self.token_to_device.insert(token.clone(), new);
        true
    }

    /// Point `device_id` at `token`, evicting any other token holding it
    fn claim_device(&self, token: &ControllerToken, device_id: DeviceId) {
        if let Some(evicted) = self.device_to_token.insert(device_id, token.clone()) {
            if &evicted != token {
                self.token_to_device
                    .remove_if(&evicted, |_, id| *id == device_id);
            }
        }
    }

    /// Drop both directions for `token`, returning the id it was mapped to
    pub fn remove_token(&self, token: &ControllerToken) -> Option<DeviceId> {
        let (_, device_id) = self.token_to_device.remove(token)?;
        self.device_to_token.remove_if(&device_id, |_, owner| owner == token);
        Some(device_id)
    }

    pub fn device_id(&self, token: &ControllerToken) -> Option<DeviceId> {
        self.token_to_device.get(token).map(|entry| *entry.value())
    }

    pub fn token(&self, device_id: DeviceId) -> Option<ControllerToken> {
        self.device_to_token
            .get(&device_id)
            .map(|entry| entry.value().clone())
    }

    pub fn contains_device(&self, device_id: DeviceId) -> bool {
        self.device_to_token.contains_key(&device_id)
    }

    /// Snapshot of the mapped device ids, sorted
    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.device_to_token.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.token_to_device.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_to_device.is_empty() && self.device_to_token.is_empty()
    }

    pub fn clear(&self) {
        self.token_to_device.clear();
        self.device_to_token.clear();
    }

    /// Whether both directions agree exactly (only meaningful when quiescent)
    pub fn is_consistent(&self) -> bool {
        if self.token_to_device.len() != self.device_to_token.len() {
            return false;
        }

        self.token_to_device.iter().all(|entry| {
            self.device_to_token
                .get(entry.value())
                .map(|owner| owner.value() == entry.key())
                .unwrap_or(false)
        })
    }
}
