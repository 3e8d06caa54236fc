//! In-memory registry of processes spawned by the manager.
//!
//! Each service id maps to a slot holding at most one `ProcessHandle`. A slot
//! is guarded by its own async mutex, so holding the guard while checking
//! liveness, spawning and recording the new handle makes that sequence
//! atomic for the service without blocking other services.
//!
//! Slots are never removed. A handle whose process has died stays in its
//! slot until the next start replaces it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::process::ProcessHandle;

/// Exclusive access to one service's slot.
pub type SlotGuard = OwnedMutexGuard<ServiceSlot>;

#[derive(Debug, Default)]
pub struct ServiceSlot {
    handle: Option<ProcessHandle>,
}

impl ServiceSlot {
    pub fn get(&mut self) -> Option<&mut ProcessHandle> {
        self.handle.as_mut()
    }

    /// Records `handle`, returning the one it replaced.
    pub fn set(&mut self, handle: ProcessHandle) -> Option<ProcessHandle> {
        self.handle.replace(handle)
    }

    /// Pid of the recorded process if it is still running.
    pub fn alive_pid(&mut self) -> Option<u32> {
        let handle = self.handle.as_mut()?;
        handle.is_alive().then(|| handle.pid())
    }
}

/// Process-wide map from service id to its slot.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<ServiceSlot>>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to the slot for `service_id`.
    pub async fn lock(&self, service_id: &str) -> SlotGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.entry(service_id.to_string()).or_default().clone()
        };
        slot.lock_owned().await
    }
}
