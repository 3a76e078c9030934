//! Volume operation serialization.
//!
//! The orchestrator is responsible for ensuring there is no more than one
//! call in-flight per volume at a given time. However it may lose state (for
//! example when it crashes and restarts) and issue multiple calls
//! simultaneously for the same volume, so each handler reserves the
//! identifiers it works on and rejects collisions with ABORTED. Delete and
//! expand additionally exclude each other per volume so that a resize is
//! never silently lost to a racing delete.

use once_cell::sync::OnceCell;
use snafu::Snafu;
use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};
use tracing::trace;

/// Serialization error variants.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("operation already exists for {}", id))]
    OperationInProgress { id: String },
    #[snafu(display("{:?} operation already in flight for {}", kind, id))]
    OperationKindHeld { kind: OperationKind, id: String },
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        tonic::Status::aborted(error.to_string())
    }
}

/// RAII reservation on a volume or snapshot identifier (ID or name).
/// While held, any other handler trying to reserve the same identifier
/// fails. Dropping the guard returns the reservation.
#[derive(Debug)]
pub struct VolumeOpGuard {
    key: String,
}

impl VolumeOpGuard {
    /// Try to reserve the given identifier, failing if an operation is
    /// already in progress for it.
    pub fn new(key: &str) -> Result<Self, Error> {
        let mut inventory = volume_serializer().lock().expect("not poisoned");
        if !inventory.insert(key.to_string()) {
            trace!(volume.key = key, "operation already exists for volume");
            return Err(Error::OperationInProgress {
                id: key.to_string(),
            });
        }
        trace!(volume.key = key, "new reservation");
        Ok(Self {
            key: key.to_string(),
        })
    }
}

impl Drop for VolumeOpGuard {
    fn drop(&mut self) {
        let mut inventory = volume_serializer().lock().expect("not poisoned");
        inventory.remove(&self.key);
    }
}

/// The set of identifiers with operations in flight. Presence is the sole
/// state, so the registry never grows with the number of distinct volumes
/// seen over the process lifetime.
fn volume_serializer() -> &'static Mutex<HashSet<String>> {
    static OPERATION_LIMITER: OnceCell<Mutex<HashSet<String>>> = OnceCell::new();

    OPERATION_LIMITER.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Volume operation kinds which exclude each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Delete,
    Expand,
}

/// RAII reservation of an operation kind on a volume. A volume may be held
/// by at most one kind at a time.
pub struct OperationGuard {
    key: String,
}

impl OperationGuard {
    /// Reserve the volume for deletion, failing if a delete or expand is
    /// already in flight.
    pub fn delete(id: &str) -> Result<Self, Error> {
        Self::acquire(OperationKind::Delete, id)
    }

    /// Reserve the volume for expansion, failing if a delete or expand is
    /// already in flight.
    pub fn expand(id: &str) -> Result<Self, Error> {
        Self::acquire(OperationKind::Expand, id)
    }

    fn acquire(kind: OperationKind, id: &str) -> Result<Self, Error> {
        let mut held = operation_serializer().lock().expect("not poisoned");
        if let Some(existing) = held.get(id) {
            trace!(volume.key = id, ?existing, "operation kind already held");
            return Err(Error::OperationKindHeld {
                kind: *existing,
                id: id.to_string(),
            });
        }
        held.insert(id.to_string(), kind);
        Ok(Self {
            key: id.to_string(),
        })
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut held = operation_serializer().lock().expect("not poisoned");
        held.remove(&self.key);
    }
}

fn operation_serializer() -> &'static Mutex<HashMap<String, OperationKind>> {
    static KIND_LIMITER: OnceCell<Mutex<HashMap<String, OperationKind>>> = OnceCell::new();

    KIND_LIMITER.get_or_init(|| Mutex::new(HashMap::new()))
}
