//! Fake implementation of the cloud connector, to be used in tests.

use super::{CloudConnector, CloudError, Snapshot, Volume, VM};
use crate::util::gigabytes_to_bytes;
use std::{collections::HashMap, sync::Mutex};

pub const ZONE_ID: &str = "a1887604-237c-4212-a9cd-94620b7880fa";
pub const VOLUME_ID: &str = "ace9f28b-3081-40c1-8353-4cc3e3014072";
pub const VOLUME_NAME: &str = "vol-1";
pub const DISK_OFFERING_ID: &str = "9743fd77-0f5d-4ef9-b2f8-f194235c769c";
pub const NODE_ID: &str = "0d7107a3-94d2-44e7-89b8-8930881309a5";
pub const SNAPSHOT_ID: &str = "9d076136-657b-4c84-b279-455da3ea484c";
pub const SNAPSHOT_NAME: &str = "pvc-vol-snap-1";
pub const SNAPSHOT_VOLUME_ID: &str = "4f1f610d-6f17-4ff9-9228-e4062af93e54";
pub const SNAPSHOT_CREATED_AT: &str = "2025-07-07T16:13:06-0700";

struct State {
    volumes_by_id: HashMap<String, Volume>,
    snapshots_by_name: HashMap<String, Snapshot>,
    zones: Vec<String>,
}

/// In-memory connector with one seeded volume, VM and snapshot.
pub struct FakeCloudConnector {
    node: VM,
    state: Mutex<State>,
}

impl Default for FakeCloudConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCloudConnector {
    pub fn new() -> Self {
        let volume = Volume {
            id: VOLUME_ID.to_string(),
            name: VOLUME_NAME.to_string(),
            size: gigabytes_to_bytes(10),
            disk_offering_id: DISK_OFFERING_ID.to_string(),
            zone_id: ZONE_ID.to_string(),
            ..Default::default()
        };
        let snapshot = Snapshot {
            id: SNAPSHOT_ID.to_string(),
            name: SNAPSHOT_NAME.to_string(),
            size: gigabytes_to_bytes(10),
            zone_id: ZONE_ID.to_string(),
            volume_id: SNAPSHOT_VOLUME_ID.to_string(),
            created_at: SNAPSHOT_CREATED_AT.to_string(),
            ..Default::default()
        };
        Self {
            node: VM {
                id: NODE_ID.to_string(),
                zone_id: ZONE_ID.to_string(),
            },
            state: Mutex::new(State {
                volumes_by_id: HashMap::from([(volume.id.clone(), volume)]),
                snapshots_by_name: HashMap::from([(snapshot.name.clone(), snapshot)]),
                zones: vec![ZONE_ID.to_string()],
            }),
        }
    }

    /// Seed an additional volume.
    pub fn add_volume(&self, volume: Volume) {
        let mut state = self.state.lock().expect("not poisoned");
        state.volumes_by_id.insert(volume.id.clone(), volume);
    }

    /// Current state of a volume, if it exists.
    pub fn volume(&self, id: &str) -> Option<Volume> {
        let state = self.state.lock().expect("not poisoned");
        state.volumes_by_id.get(id).cloned()
    }
}

#[tonic::async_trait]
impl CloudConnector for FakeCloudConnector {
    async fn get_node_info(&self, _vm_name: &str) -> Result<VM, CloudError> {
        Ok(self.node.clone())
    }

    async fn get_vm_by_id(&self, vm_id: &str) -> Result<VM, CloudError> {
        if vm_id == self.node.id {
            Ok(self.node.clone())
        } else {
            Err(CloudError::NotFound)
        }
    }

    async fn list_zones_id(&self) -> Result<Vec<String>, CloudError> {
        Ok(self.state.lock().expect("not poisoned").zones.clone())
    }

    async fn get_volume_by_id(&self, volume_id: &str) -> Result<Volume, CloudError> {
        if volume_id.is_empty() {
            return Err(CloudError::InvalidArgument {
                reason: "invalid volume ID: empty string".to_string(),
            });
        }
        let state = self.state.lock().expect("not poisoned");
        state
            .volumes_by_id
            .get(volume_id)
            .cloned()
            .ok_or(CloudError::NotFound)
    }

    async fn get_volume_by_name(&self, name: &str) -> Result<Volume, CloudError> {
        if name.is_empty() {
            return Err(CloudError::InvalidArgument {
                reason: "invalid volume name: empty string".to_string(),
            });
        }
        let state = self.state.lock().expect("not poisoned");
        state
            .volumes_by_id
            .values()
            .find(|volume| volume.name == name)
            .cloned()
            .ok_or(CloudError::NotFound)
    }

    async fn create_volume(
        &self,
        disk_offering_id: &str,
        zone_id: &str,
        name: &str,
        size_gib: i64,
    ) -> Result<String, CloudError> {
        let volume = Volume {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            size: gigabytes_to_bytes(size_gib),
            disk_offering_id: disk_offering_id.to_string(),
            zone_id: zone_id.to_string(),
            ..Default::default()
        };
        let id = volume.id.clone();
        let mut state = self.state.lock().expect("not poisoned");
        state.volumes_by_id.insert(id.clone(), volume);
        Ok(id)
    }

    async fn delete_volume(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().expect("not poisoned");
        match state.volumes_by_id.remove(id) {
            Some(_) => Ok(()),
            None => Err(CloudError::NotFound),
        }
    }

    async fn attach_volume(&self, volume_id: &str, vm_id: &str) -> Result<String, CloudError> {
        let mut state = self.state.lock().expect("not poisoned");
        let volume = state
            .volumes_by_id
            .get_mut(volume_id)
            .ok_or(CloudError::NotFound)?;
        volume.virtual_machine_id = vm_id.to_string();
        volume.device_id = "1".to_string();
        Ok(volume.device_id.clone())
    }

    async fn detach_volume(&self, volume_id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().expect("not poisoned");
        let volume = state
            .volumes_by_id
            .get_mut(volume_id)
            .ok_or(CloudError::NotFound)?;
        volume.virtual_machine_id = String::new();
        volume.device_id = String::new();
        Ok(())
    }

    async fn expand_volume(&self, volume_id: &str, new_size_gib: i64) -> Result<(), CloudError> {
        let mut state = self.state.lock().expect("not poisoned");
        let volume = state
            .volumes_by_id
            .get_mut(volume_id)
            .ok_or(CloudError::NotFound)?;
        let new_size = gigabytes_to_bytes(new_size_gib);
        if new_size > volume.size {
            volume.size = new_size;
        }
        Ok(())
    }

    async fn create_volume_from_snapshot(
        &self,
        zone_id: &str,
        name: &str,
        _project_id: &str,
        _snapshot_id: &str,
        size_gib: i64,
    ) -> Result<Volume, CloudError> {
        let volume = Volume {
            id: format!("fake-vol-from-snap-{name}"),
            name: name.to_string(),
            size: gigabytes_to_bytes(size_gib),
            disk_offering_id: "fake-disk-offering".to_string(),
            zone_id: zone_id.to_string(),
            ..Default::default()
        };
        let mut state = self.state.lock().expect("not poisoned");
        state
            .volumes_by_id
            .insert(volume.id.clone(), volume.clone());
        Ok(volume)
    }

    async fn get_snapshot_by_id(&self, snapshot_id: &str) -> Result<Snapshot, CloudError> {
        let state = self.state.lock().expect("not poisoned");
        state
            .snapshots_by_name
            .values()
            .find(|snapshot| snapshot.id == snapshot_id)
            .cloned()
            .ok_or(CloudError::NotFound)
    }

    async fn get_snapshot_by_name(&self, name: &str) -> Result<Snapshot, CloudError> {
        if name.is_empty() {
            return Err(CloudError::InvalidArgument {
                reason: "invalid snapshot name: empty string".to_string(),
            });
        }
        let state = self.state.lock().expect("not poisoned");
        state
            .snapshots_by_name
            .get(name)
            .cloned()
            .ok_or(CloudError::NotFound)
    }

    async fn create_snapshot(&self, volume_id: &str, name: &str) -> Result<Snapshot, CloudError> {
        let mut state = self.state.lock().expect("not poisoned");
        if let Some(existing) = state.snapshots_by_name.get(name) {
            if existing.volume_id == volume_id {
                return Ok(existing.clone());
            }
            return Err(CloudError::AlreadyExists);
        }
        let snapshot = Snapshot {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            zone_id: ZONE_ID.to_string(),
            volume_id: volume_id.to_string(),
            created_at: SNAPSHOT_CREATED_AT.to_string(),
            ..Default::default()
        };
        state
            .snapshots_by_name
            .insert(name.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().expect("not poisoned");
        let name = state
            .snapshots_by_name
            .values()
            .find(|snapshot| snapshot.id == snapshot_id)
            .map(|snapshot| snapshot.name.clone());
        match name {
            Some(name) => {
                state.snapshots_by_name.remove(&name);
                Ok(())
            }
            None => Err(CloudError::NotFound),
        }
    }

    async fn list_snapshots(
        &self,
        volume_id: &str,
        snapshot_id: &str,
    ) -> Result<Vec<Snapshot>, CloudError> {
        let state = self.state.lock().expect("not poisoned");
        let mut snapshots: Vec<Snapshot> = state
            .snapshots_by_name
            .values()
            .filter(|snapshot| volume_id.is_empty() || snapshot.volume_id == volume_id)
            .filter(|snapshot| snapshot_id.is_empty() || snapshot.id == snapshot_id)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(snapshots)
    }
}
