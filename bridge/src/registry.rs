use crate::errors::{Error, Result};
use crate::model::{Device, DeviceUpdate};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

/// Device table keyed by `uid`.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn find_by_uid(&self, uid: &str) -> Result<Option<Device>>;

    async fn exists_by_uid(&self, uid: &str) -> Result<bool> {
        Ok(self.find_by_uid(uid).await?.is_some())
    }

    /// Inserts, or replaces name/type/status of the record with the same uid.
    async fn upsert(&self, device: Device) -> Result<Device>;

    /// Returns false if no record has this uid. Never creates one.
    async fn update_status(&self, uid: &str, status: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<Device>>;

    async fn find_by_id(&self, id: i64) -> Result<Option<Device>>;

    /// Returns the edited record, or `None` if no record has this id.
    async fn update(&self, id: i64, update: DeviceUpdate) -> Result<Option<Device>>;

    /// Returns false if no record had this id.
    async fn delete(&self, id: i64) -> Result<bool>;
}

/// Registry kept in process memory, used without a database and in tests.
pub struct InMemoryRegistry {
    devices: RwLock<HashMap<String, Device>>,
    next_id: AtomicI64,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryRegistry {
    async fn find_by_uid(&self, uid: &str) -> Result<Option<Device>> {
        let device = self
            .devices
            .read()
            .ok()
            .and_then(|map| map.get(uid).cloned());
        Ok(device)
    }

    async fn upsert(&self, device: Device) -> Result<Device> {
        if device.uid.trim().is_empty() {
            return Err(Error::Validation("device uid cannot be empty".to_string()));
        }

        let mut map = self
            .devices
            .write()
            .map_err(|_| Error::Validation("registry lock poisoned".to_string()))?;

        let stored = match map.get_mut(&device.uid) {
            Some(existing) => {
                existing.name = device.name;
                existing.device_type = device.device_type;
                existing.status = device.status;
                existing.clone()
            }
            None => {
                let stored = Device {
                    id: self.next_id.fetch_add(1, Ordering::SeqCst),
                    ..device
                };
                map.insert(stored.uid.clone(), stored.clone());
                stored
            }
        };
        Ok(stored)
    }

    async fn update_status(&self, uid: &str, status: &str) -> Result<bool> {
        let mut map = self
            .devices
            .write()
            .map_err(|_| Error::Validation("registry lock poisoned".to_string()))?;

        match map.get_mut(uid) {
            Some(device) => {
                device.status = status.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = self
            .devices
            .read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        devices.sort_by_key(|d| d.id);
        Ok(devices)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Device>> {
        let device = self
            .devices
            .read()
            .ok()
            .and_then(|map| map.values().find(|d| d.id == id).cloned());
        Ok(device)
    }

    async fn update(&self, id: i64, update: DeviceUpdate) -> Result<Option<Device>> {
        let mut map = self
            .devices
            .write()
            .map_err(|_| Error::Validation("registry lock poisoned".to_string()))?;

        Ok(map.values_mut().find(|d| d.id == id).map(|device| {
            update.apply(device);
            device.clone()
        }))
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let mut map = self
            .devices
            .write()
            .map_err(|_| Error::Validation("registry lock poisoned".to_string()))?;

        let before = map.len();
        map.retain(|_, d| d.id != id);
        Ok(map.len() < before)
    }
}
