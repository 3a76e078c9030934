//! CloudStack connector.
//!
//! Everything the services know about the cloud goes through the
//! [`CloudConnector`] trait. Cloud specific quirks (list-of-one lookups,
//! error code 4350 on deletes, asynchronous jobs) are normalized behind
//! this boundary; no caller above it inspects cloud error strings.

use snafu::Snafu;
use tonic::Status;

pub mod client;
pub mod config;
pub mod fake;

pub use client::CloudStackApiClient;
pub use config::CloudConfig;

/// A CloudStack volume. Immutable after creation except for its size
/// (expand) and attachment fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Volume {
    pub id: String,
    pub name: String,
    /// Size in bytes.
    pub size: i64,
    pub disk_offering_id: String,
    pub domain_id: String,
    pub project_id: String,
    pub zone_id: String,
    /// ID of the VM the volume is attached to; empty when detached.
    pub virtual_machine_id: String,
    /// Device ordinal as a decimal string; empty when detached.
    pub device_id: String,
}

/// A CloudStack volume snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    /// Size in bytes. May be zero at list time depending on cloud state.
    pub size: i64,
    pub domain_id: String,
    pub project_id: String,
    pub zone_id: String,
    pub volume_id: String,
    /// Cloud-formatted creation timestamp, `YYYY-MM-DDTHH:MM:SS±HHMM`.
    pub created_at: String,
}

/// A CloudStack virtual machine. Lifecycle is external; the driver only
/// observes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VM {
    pub id: String,
    pub zone_id: String,
}

/// The closed set of error kinds surfaced by the connector.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum CloudError {
    #[snafu(display("not found"))]
    NotFound,
    #[snafu(display("too many results"))]
    TooManyResults,
    #[snafu(display("already exists"))]
    AlreadyExists,
    #[snafu(display("{}", reason))]
    InvalidArgument { reason: String },
    #[snafu(display("volume {} is in state {}, not resizable", id, state))]
    NotResizable { id: String, state: String },
    #[snafu(display("CloudStack API error on {}: {}", command, text))]
    Api { command: String, text: String },
    #[snafu(display("request to CloudStack failed: {}", source))]
    Request { source: reqwest::Error },
    #[snafu(display("request signing failed: {}", source))]
    Signing { source: openssl::error::ErrorStack },
    #[snafu(display("unexpected CloudStack response for {}: {}", command, reason))]
    InvalidResponse { command: String, reason: String },
}

impl From<CloudError> for Status {
    fn from(error: CloudError) -> Self {
        match error {
            CloudError::NotFound => Status::not_found(error.to_string()),
            CloudError::AlreadyExists => Status::already_exists(error.to_string()),
            CloudError::InvalidArgument { .. } => Status::invalid_argument(error.to_string()),
            CloudError::NotResizable { .. } => Status::failed_precondition(error.to_string()),
            error => Status::internal(format!("CloudStack error: {error}")),
        }
    }
}

/// The CloudStack client surface the controller and node services depend
/// on.
#[tonic::async_trait]
pub trait CloudConnector: Send + Sync {
    /// Resolve the VM this plugin instance runs on: instance-metadata
    /// lookup first, then a by-name search.
    async fn get_node_info(&self, vm_name: &str) -> Result<VM, CloudError>;
    async fn get_vm_by_id(&self, vm_id: &str) -> Result<VM, CloudError>;

    /// IDs of the currently available zones.
    async fn list_zones_id(&self) -> Result<Vec<String>, CloudError>;

    async fn get_volume_by_id(&self, volume_id: &str) -> Result<Volume, CloudError>;
    async fn get_volume_by_name(&self, name: &str) -> Result<Volume, CloudError>;
    /// Create a volume and return its ID.
    async fn create_volume(
        &self,
        disk_offering_id: &str,
        zone_id: &str,
        name: &str,
        size_gib: i64,
    ) -> Result<String, CloudError>;
    async fn delete_volume(&self, id: &str) -> Result<(), CloudError>;
    /// Attach a volume and return the device ordinal as a decimal string.
    async fn attach_volume(&self, volume_id: &str, vm_id: &str) -> Result<String, CloudError>;
    async fn detach_volume(&self, volume_id: &str) -> Result<(), CloudError>;
    /// Grow the volume. Only volumes in state Allocated or Ready may be
    /// resized.
    async fn expand_volume(&self, volume_id: &str, new_size_gib: i64) -> Result<(), CloudError>;

    /// Create a volume seeded from a snapshot. An empty `project_id` omits
    /// the parameter.
    async fn create_volume_from_snapshot(
        &self,
        zone_id: &str,
        name: &str,
        project_id: &str,
        snapshot_id: &str,
        size_gib: i64,
    ) -> Result<Volume, CloudError>;
    async fn get_snapshot_by_id(&self, snapshot_id: &str) -> Result<Snapshot, CloudError>;
    async fn get_snapshot_by_name(&self, name: &str) -> Result<Snapshot, CloudError>;
    /// Snapshot a volume. Returns `AlreadyExists` when the name is taken by
    /// a snapshot of a different source volume; re-creating the same
    /// snapshot is idempotent.
    async fn create_snapshot(&self, volume_id: &str, name: &str) -> Result<Snapshot, CloudError>;
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError>;
    /// List snapshots; either filter may be empty, meaning unconstrained on
    /// that axis.
    async fn list_snapshots(
        &self,
        volume_id: &str,
        snapshot_id: &str,
    ) -> Result<Vec<Snapshot>, CloudError>;
}
