//! The CSI Controller service.
//!
//! Reconciles create/delete/publish/expand/snapshot calls against
//! CloudStack. The service is stateless: the cloud is authoritative and
//! the only in-process state is the lock registries in [`crate::limiter`].

use crate::{
    cloud::{self, CloudConnector, CloudError},
    csi::{
        self,
        controller_server::Controller,
        controller_service_capability,
        volume_capability::{access_mode::Mode, AccessType},
        volume_content_source,
    },
    limiter::{OperationGuard, VolumeOpGuard},
    topology::Topology,
    util::{gigabytes_to_bytes, round_up_bytes_to_gb},
    DEVICE_ID_CONTEXT_KEY, DISK_OFFERING_PARAMETER,
};
use rand::seq::SliceRandom;
use std::{collections::HashMap, sync::Arc};
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument};

/// Timestamp layout CloudStack uses for creation times: offset without a
/// colon, eg `2025-07-07T16:13:06-0700`.
const CREATED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// The controller half of the plugin.
pub struct ControllerService {
    connector: Arc<dyn CloudConnector>,
}

impl ControllerService {
    pub fn new(connector: Arc<dyn CloudConnector>) -> Self {
        Self { connector }
    }
}

/// The only access mode CloudStack can provide: a volume is attached to a
/// single VM at any given time.
const ONLY_ACCESS_MODE: Mode = Mode::SingleNodeWriter;

/// A capability is acceptable when it either carries no access mode or the
/// single supported one.
fn is_valid_volume_capabilities(capabilities: &[csi::VolumeCapability]) -> bool {
    capabilities.iter().all(|capability| {
        capability
            .access_mode
            .as_ref()
            .map(|access_mode| access_mode.mode == ONLY_ACCESS_MODE as i32)
            .unwrap_or(true)
    })
}

/// Determine the size of a new volume in GiB from the requested capacity
/// range. Defaults to 1 GiB; fails when the rounded-up size overshoots the
/// limit.
fn determine_size(capacity_range: Option<&csi::CapacityRange>) -> Result<i64, Status> {
    let mut size_gib = 0;
    if let Some(range) = capacity_range {
        size_gib = round_up_bytes_to_gb(range.required_bytes);
        if size_gib == 0 {
            size_gib = 1;
        }
        if range.limit_bytes > 0 && gigabytes_to_bytes(size_gib) > range.limit_bytes {
            return Err(Status::invalid_argument(format!(
                "after round-up, volume size {size_gib} GiB exceeds the limit specified of {} bytes",
                range.limit_bytes
            )));
        }
    }
    if size_gib == 0 {
        size_gib = 1;
    }
    Ok(size_gib)
}

/// Check whether an existing volume satisfies a create request. A mismatch
/// yields the diagnostic to report with ALREADY_EXISTS.
fn check_volume_suitable(
    volume: &cloud::Volume,
    disk_offering_id: &str,
    capacity_range: Option<&csi::CapacityRange>,
    accessibility: Option<&csi::TopologyRequirement>,
) -> Result<(), String> {
    if volume.disk_offering_id != disk_offering_id {
        return Err(format!(
            "disk offering {}; requested disk offering {}",
            volume.disk_offering_id, disk_offering_id
        ));
    }

    if let Some(range) = capacity_range {
        if range.limit_bytes > 0 && volume.size > range.limit_bytes {
            return Err(format!(
                "disk size {} bytes > requested limit size {} bytes",
                volume.size, range.limit_bytes
            ));
        }
        if range.required_bytes > 0 && volume.size < range.required_bytes {
            return Err(format!(
                "disk size {} bytes < requested required size {} bytes",
                volume.size, range.required_bytes
            ));
        }
    }

    if let Some(requirement) = accessibility {
        if !requirement.requisite.is_empty() {
            if requirement.requisite.len() > 1 {
                return Err("too many topology requirements".to_string());
            }
            let topology = Topology::try_from(&requirement.requisite[0])
                .map_err(|_| "cannot parse topology requirements".to_string())?;
            if topology.zone_id != volume.zone_id {
                return Err(format!(
                    "volume in zone {}, requested zone is {}",
                    volume.zone_id, topology.zone_id
                ));
            }
        }
    }

    Ok(())
}

/// Parse a cloud creation timestamp into a protobuf timestamp.
fn parse_created_at(created_at: &str) -> Result<prost_types::Timestamp, chrono::ParseError> {
    let parsed = chrono::DateTime::parse_from_str(created_at, CREATED_AT_FORMAT)?;
    Ok(prost_types::Timestamp {
        seconds: parsed.timestamp(),
        nanos: 0,
    })
}

#[tonic::async_trait]
impl Controller for ControllerService {
    #[instrument(err, skip_all, fields(volume.name = %request.get_ref().name))]
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let args = request.into_inner();
        tracing::trace!(request = ?args);

        if args.name.is_empty() {
            return Err(Status::invalid_argument("Volume name missing in request"));
        }
        let name = args.name.clone();

        if args.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "Volume capabilities missing in request",
            ));
        }
        if !is_valid_volume_capabilities(&args.volume_capabilities) {
            return Err(Status::invalid_argument(
                "Volume capabilities not supported. Only SINGLE_NODE_WRITER supported.",
            ));
        }

        let disk_offering_id = args
            .parameters
            .get(DISK_OFFERING_PARAMETER)
            .cloned()
            .unwrap_or_default();
        if disk_offering_id.is_empty() {
            return Err(Status::invalid_argument(format!(
                "Missing parameter {DISK_OFFERING_PARAMETER}"
            )));
        }

        let _guard = VolumeOpGuard::new(&name)?;

        // Check if a volume with that name already exists.
        match self.connector.get_volume_by_name(&name).await {
            Ok(volume) => {
                // The volume exists. Check if it suits the request.
                return match check_volume_suitable(
                    &volume,
                    &disk_offering_id,
                    args.capacity_range.as_ref(),
                    args.accessibility_requirements.as_ref(),
                ) {
                    Ok(()) => Ok(Response::new(csi::CreateVolumeResponse {
                        volume: Some(csi::Volume {
                            volume_id: volume.id,
                            capacity_bytes: volume.size,
                            volume_context: args.parameters.clone(),
                            content_source: None,
                            accessible_topology: vec![Topology::zone(volume.zone_id).into()],
                        }),
                    })),
                    Err(message) => Err(Status::already_exists(format!(
                        "Volume {name} already exists but does not satisfy request: {message}"
                    ))),
                };
            }
            Err(CloudError::NotFound) => {}
            Err(error) => return Err(Status::internal(format!("CloudStack error: {error}"))),
        }

        let snapshot_id = match &args.volume_content_source {
            Some(source) => match &source.r#type {
                Some(volume_content_source::Type::Snapshot(snapshot)) => {
                    snapshot.snapshot_id.clone()
                }
                _ => String::new(),
            },
            None => String::new(),
        };

        // Determine volume size using the requested capacity range.
        let mut size_gib = determine_size(args.capacity_range.as_ref())?;

        if !snapshot_id.is_empty() {
            info!(snapshot.id = %snapshot_id, "creating volume from snapshot");
            let snapshot = match self.connector.get_snapshot_by_id(&snapshot_id).await {
                Ok(snapshot) => snapshot,
                Err(CloudError::NotFound) => {
                    return Err(Status::not_found(format!(
                        "Snapshot {snapshot_id} not found"
                    )))
                }
                Err(error) => return Err(Status::internal(format!("Error {error}"))),
            };

            // A volume restored from a snapshot can never be smaller than
            // the snapshot itself.
            let snapshot_size_gib = round_up_bytes_to_gb(snapshot.size);
            if snapshot_size_gib > size_gib {
                size_gib = snapshot_size_gib;
            }

            let volume = self
                .connector
                .create_volume_from_snapshot(
                    &snapshot.zone_id,
                    &name,
                    &snapshot.project_id,
                    &snapshot_id,
                    size_gib,
                )
                .await
                .map_err(|error| {
                    Status::internal(format!(
                        "Cannot create volume from snapshot {snapshot_id}: {error}"
                    ))
                })?;

            return Ok(Response::new(csi::CreateVolumeResponse {
                volume: Some(csi::Volume {
                    volume_id: volume.id,
                    capacity_bytes: volume.size,
                    volume_context: args.parameters.clone(),
                    content_source: args.volume_content_source.clone(),
                    accessible_topology: vec![Topology::zone(volume.zone_id).into()],
                }),
            }));
        }

        // Determine the zone from the topology constraints, or pick one at
        // random when the request carries none.
        let requisite = args
            .accessibility_requirements
            .as_ref()
            .map(|requirement| requirement.requisite.as_slice())
            .unwrap_or_default();
        let zone_id = if requisite.is_empty() {
            let zones = self
                .connector
                .list_zones_id()
                .await
                .map_err(|error| Status::invalid_argument(error.to_string()))?;
            zones
                .choose(&mut rand::thread_rng())
                .cloned()
                .ok_or_else(|| Status::internal("No zone available"))?
        } else {
            if requisite.len() > 1 {
                return Err(Status::invalid_argument("Too many topology requirements"));
            }
            Topology::try_from(&requisite[0])
                .map_err(|_| Status::invalid_argument("Cannot parse topology requirements"))?
                .zone_id
        };

        info!(
            volume.name = %name,
            volume.size_gib = size_gib,
            offering.id = %disk_offering_id,
            zone.id = %zone_id,
            "creating new volume"
        );

        let volume_id = self
            .connector
            .create_volume(&disk_offering_id, &zone_id, &name, size_gib)
            .await
            .map_err(|error| Status::internal(format!("Cannot create volume {name}: {error}")))?;

        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(csi::Volume {
                volume_id,
                capacity_bytes: gigabytes_to_bytes(size_gib),
                volume_context: args.parameters.clone(),
                content_source: args.volume_content_source.clone(),
                accessible_topology: vec![Topology::zone(zone_id).into()],
            }),
        }))
    }

    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id))]
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let args = request.into_inner();
        tracing::trace!(request = ?args);

        if args.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        let volume_id = args.volume_id;

        let _guard = VolumeOpGuard::new(&volume_id)?;
        // Lock out the volume for expand while the delete is in flight.
        let _kind_guard = OperationGuard::delete(&volume_id)?;

        info!(volume.id = %volume_id, "deleting volume");

        match self.connector.delete_volume(&volume_id).await {
            // A delete of a volume the cloud no longer knows is a success.
            Ok(()) | Err(CloudError::NotFound) => {
                Ok(Response::new(csi::DeleteVolumeResponse {}))
            }
            Err(error) => Err(Status::internal(format!(
                "Cannot delete volume {volume_id}: {error}"
            ))),
        }
    }

    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id, node.id = %request.get_ref().node_id))]
    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let args = request.into_inner();
        tracing::trace!(request = ?args);

        if args.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        let volume_id = args.volume_id;

        if args.node_id.is_empty() {
            return Err(Status::invalid_argument("Node ID missing in request"));
        }
        let node_id = args.node_id;

        if args.readonly {
            return Err(Status::invalid_argument("Readonly not possible"));
        }

        let capability = args
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("Volume capability missing in request"))?;
        if capability
            .access_mode
            .as_ref()
            .map(|access_mode| access_mode.mode)
            != Some(ONLY_ACCESS_MODE as i32)
        {
            return Err(Status::invalid_argument("Access mode not accepted"));
        }

        let _guard = VolumeOpGuard::new(&volume_id)?;

        let volume = match self.connector.get_volume_by_id(&volume_id).await {
            Ok(volume) => volume,
            Err(CloudError::NotFound) => {
                return Err(Status::not_found(format!("Volume {volume_id} not found")))
            }
            Err(error) => return Err(Status::internal(format!("Error {error}"))),
        };

        if !volume.virtual_machine_id.is_empty() && volume.virtual_machine_id != node_id {
            return Err(Status::already_exists(
                "Volume already assigned to another node",
            ));
        }

        match self.connector.get_vm_by_id(&node_id).await {
            Ok(_) => {}
            Err(CloudError::NotFound) => {
                return Err(Status::not_found(format!("VM {node_id} not found")))
            }
            Err(error) => return Err(Status::internal(format!("Error {error}"))),
        }

        if volume.virtual_machine_id == node_id {
            debug!(
                volume.id = %volume_id,
                node.id = %node_id,
                device.id = %volume.device_id,
                "volume already attached to node"
            );
            let publish_context =
                HashMap::from([(DEVICE_ID_CONTEXT_KEY.to_string(), volume.device_id)]);
            return Ok(Response::new(csi::ControllerPublishVolumeResponse {
                publish_context,
            }));
        }

        info!(volume.id = %volume_id, node.id = %node_id, "attaching volume to node");

        let device_id = self
            .connector
            .attach_volume(&volume_id, &node_id)
            .await
            .map_err(|error| {
                Status::internal(format!("Cannot attach volume {volume_id}: {error}"))
            })?;

        let publish_context = HashMap::from([(DEVICE_ID_CONTEXT_KEY.to_string(), device_id)]);
        Ok(Response::new(csi::ControllerPublishVolumeResponse {
            publish_context,
        }))
    }

    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id, node.id = %request.get_ref().node_id))]
    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let args = request.into_inner();
        tracing::trace!(request = ?args);

        if args.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        let volume_id = args.volume_id;
        let node_id = args.node_id;

        let _guard = VolumeOpGuard::new(&volume_id)?;

        match self.connector.get_volume_by_id(&volume_id).await {
            // The volume is gone, so it is certainly not attached.
            Err(CloudError::NotFound) => {
                return Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
            }
            Err(error) => return Err(Status::internal(format!("Error {error}"))),
            Ok(volume) if !node_id.is_empty() && volume.virtual_machine_id != node_id => {
                // Present, but not attached to this particular node.
                return Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}));
            }
            Ok(_) => {}
        }

        match self.connector.get_vm_by_id(&node_id).await {
            Ok(_) => {}
            Err(CloudError::NotFound) => {
                // Volumes cannot stay attached to deleted VMs.
                debug!(volume.id = %volume_id, node.id = %node_id, "VM not found, unpublish is a no-op");
                return Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}));
            }
            Err(error) => return Err(Status::internal(format!("Error {error}"))),
        }

        info!(volume.id = %volume_id, node.id = %node_id, "detaching volume from node");

        self.connector
            .detach_volume(&volume_id)
            .await
            .map_err(|error| {
                Status::internal(format!("Cannot detach volume {volume_id}: {error}"))
            })?;

        Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
    }

    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id))]
    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let args = request.into_inner();
        tracing::trace!(request = ?args);

        if args.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID not provided"));
        }
        if args.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("Volume capabilities not provided"));
        }

        match self.connector.get_volume_by_id(&args.volume_id).await {
            Ok(_) => {}
            Err(CloudError::NotFound) => {
                return Err(Status::not_found(format!(
                    "Volume {} not found",
                    args.volume_id
                )))
            }
            Err(error) => return Err(Status::internal(format!("Error {error}"))),
        }

        let response = if is_valid_volume_capabilities(&args.volume_capabilities) {
            csi::ValidateVolumeCapabilitiesResponse {
                confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                    volume_context: args.volume_context,
                    volume_capabilities: args.volume_capabilities,
                    parameters: args.parameters,
                }),
                message: String::new(),
            }
        } else {
            csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: "Requested VolumeCapabilities are invalid".to_string(),
            }
        };

        Ok(Response::new(response))
    }

    async fn list_volumes(
        &self,
        _request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        let capabilities = vec![
            controller_service_capability::rpc::Type::CreateDeleteVolume,
            controller_service_capability::rpc::Type::PublishUnpublishVolume,
            controller_service_capability::rpc::Type::ExpandVolume,
            controller_service_capability::rpc::Type::CreateDeleteSnapshot,
            controller_service_capability::rpc::Type::ListSnapshots,
        ];

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities: capabilities
                .into_iter()
                .map(|capability| csi::ControllerServiceCapability {
                    r#type: Some(controller_service_capability::Type::Rpc(
                        controller_service_capability::Rpc {
                            r#type: capability as i32,
                        },
                    )),
                })
                .collect(),
        }))
    }

    #[instrument(err, skip_all, fields(snapshot.name = %request.get_ref().name, volume.id = %request.get_ref().source_volume_id))]
    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        let args = request.into_inner();
        tracing::trace!(request = ?args);

        if args.name.is_empty() {
            return Err(Status::invalid_argument("Snapshot name missing in request"));
        }
        if args.source_volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "SourceVolumeId missing in request",
            ));
        }

        let volume = match self.connector.get_volume_by_id(&args.source_volume_id).await {
            Ok(volume) => volume,
            Err(CloudError::InvalidArgument { .. }) => {
                return Err(Status::invalid_argument("Invalid volume ID"))
            }
            Err(CloudError::NotFound) => {
                return Err(Status::not_found(format!(
                    "Volume {} not found",
                    args.source_volume_id
                )))
            }
            Err(error) => return Err(Status::internal(format!("Error {error}"))),
        };

        let snapshot = match self.connector.create_snapshot(&volume.id, &args.name).await {
            Ok(snapshot) => snapshot,
            Err(CloudError::AlreadyExists) => {
                return Err(Status::already_exists(
                    "Snapshot name conflict: already exists for a different source volume",
                ))
            }
            Err(error) => {
                return Err(Status::internal(format!(
                    "Failed to create snapshot for volume {}: {error}",
                    volume.id
                )))
            }
        };

        let creation_time = parse_created_at(&snapshot.created_at).map_err(|error| {
            Status::internal(format!("Failed to parse snapshot creation time: {error}"))
        })?;

        Ok(Response::new(csi::CreateSnapshotResponse {
            snapshot: Some(csi::Snapshot {
                snapshot_id: snapshot.id,
                source_volume_id: volume.id,
                creation_time: Some(creation_time),
                ready_to_use: true,
                ..Default::default()
            }),
        }))
    }

    #[instrument(err, skip_all, fields(snapshot.id = %request.get_ref().snapshot_id))]
    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let args = request.into_inner();

        if args.snapshot_id.is_empty() {
            return Err(Status::invalid_argument("Snapshot ID missing in request"));
        }

        debug!(snapshot.id = %args.snapshot_id, "deleting snapshot");

        match self.connector.delete_snapshot(&args.snapshot_id).await {
            // Per the CSI spec, deleting an unknown snapshot is a success.
            Ok(()) | Err(CloudError::NotFound) => {
                Ok(Response::new(csi::DeleteSnapshotResponse {}))
            }
            Err(error) => Err(Status::internal(format!("Error {error}"))),
        }
    }

    #[instrument(err, skip_all)]
    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        let args = request.into_inner();
        tracing::trace!(request = ?args);

        let snapshots = self
            .connector
            .list_snapshots(&args.source_volume_id, &args.snapshot_id)
            .await
            .map_err(|error| Status::internal(format!("Failed to list snapshots: {error}")))?;

        // Pagination is implemented here; the cloud listing is not paged.
        let mut start = 0usize;
        if !args.starting_token.is_empty() {
            start = args
                .starting_token
                .parse::<usize>()
                .ok()
                .filter(|start| *start <= snapshots.len())
                .ok_or_else(|| Status::aborted("Invalid startingToken"))?;
        }
        let max_entries = args.max_entries.max(0) as usize;
        let mut end = snapshots.len();
        if max_entries > 0 && start + max_entries < end {
            end = start + max_entries;
        }
        let next_token = if end < snapshots.len() {
            end.to_string()
        } else {
            String::new()
        };

        let entries = snapshots[start..end]
            .iter()
            .map(|snapshot| csi::list_snapshots_response::Entry {
                snapshot: Some(csi::Snapshot {
                    snapshot_id: snapshot.id.clone(),
                    source_volume_id: snapshot.volume_id.clone(),
                    creation_time: parse_created_at(&snapshot.created_at).ok(),
                    ready_to_use: true,
                    ..Default::default()
                }),
            })
            .collect();

        Ok(Response::new(csi::ListSnapshotsResponse {
            entries,
            next_token,
        }))
    }

    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id))]
    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let args = request.into_inner();
        tracing::trace!(request = ?args);

        if args.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID not provided"));
        }
        let volume_id = args.volume_id;

        let capacity_range = args
            .capacity_range
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("Capacity range not provided"))?;

        let _guard = VolumeOpGuard::new(&volume_id)?;

        let size_gib = round_up_bytes_to_gb(capacity_range.required_bytes);
        if capacity_range.limit_bytes > 0
            && capacity_range.limit_bytes < gigabytes_to_bytes(size_gib)
        {
            return Err(Status::out_of_range(
                "Volume size exceeds the limit specified",
            ));
        }

        match self.connector.get_volume_by_id(&volume_id).await {
            Ok(_) => {}
            Err(CloudError::NotFound) => {
                return Err(Status::not_found(format!("Volume {volume_id} not found")))
            }
            Err(error) => {
                return Err(Status::internal(format!("GetVolume failed with error {error}")))
            }
        }

        // Lock out the volume for delete while the expand is in flight.
        let _kind_guard = OperationGuard::expand(&volume_id)?;

        match self.connector.expand_volume(&volume_id, size_gib).await {
            Ok(()) => {}
            Err(error @ CloudError::NotResizable { .. }) => return Err(Status::from(error)),
            Err(error) => {
                return Err(Status::internal(format!(
                    "Could not resize volume {volume_id} to size {size_gib}: {error}"
                )))
            }
        }

        info!(volume.id = %volume_id, volume.size_gib = size_gib, "volume successfully expanded");

        // Node expansion is not required for raw block volumes.
        let node_expansion_required = !matches!(
            args.volume_capability
                .as_ref()
                .and_then(|capability| capability.access_type.as_ref()),
            Some(AccessType::Block(_))
        );

        Ok(Response::new(csi::ControllerExpandVolumeResponse {
            capacity_bytes: gigabytes_to_bytes(size_gib),
            node_expansion_required,
        }))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::GIB;

    fn range(required_bytes: i64, limit_bytes: i64) -> Option<csi::CapacityRange> {
        Some(csi::CapacityRange {
            required_bytes,
            limit_bytes,
        })
    }

    #[test]
    fn determine_size_table() {
        let cases: &[(Option<csi::CapacityRange>, Option<i64>)] = &[
            (None, Some(1)),
            (range(0, 100 * GIB), Some(1)),
            (range(0, 1024 * 1024), None),
            (range(50 * GIB, 0), Some(50)),
            (range(25 * GIB, 100 * GIB), Some(25)),
            (range(30 * GIB, 30 * GIB), Some(30)),
            (range(3_000_000_000, 3_000_000_000), None),
            (range(4_000_000_000, 1_000_001_000), None),
        ];
        for (capacity_range, expected) in cases {
            let result = determine_size(capacity_range.as_ref());
            match expected {
                Some(size) => assert_eq!(result.unwrap(), *size),
                None => {
                    let status = result.unwrap_err();
                    assert_eq!(status.code(), tonic::Code::InvalidArgument);
                }
            }
        }
    }

    fn existing_volume() -> cloud::Volume {
        cloud::Volume {
            id: "v1".to_string(),
            name: "vol".to_string(),
            size: 10 * GIB,
            disk_offering_id: "offering-1".to_string(),
            zone_id: "zone-1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn suitability_accepts_matching_volume() {
        let volume = existing_volume();
        let requirement = csi::TopologyRequirement {
            requisite: vec![Topology::zone("zone-1").into()],
            preferred: vec![],
        };
        assert!(check_volume_suitable(
            &volume,
            "offering-1",
            range(0, 0).as_ref(),
            Some(&requirement),
        )
        .is_ok());
    }

    #[test]
    fn suitability_rejects_other_offering() {
        let volume = existing_volume();
        assert!(check_volume_suitable(&volume, "offering-2", None, None).is_err());
    }

    #[test]
    fn suitability_rejects_size_out_of_range() {
        let volume = existing_volume();
        // Volume is larger than the limit.
        assert!(
            check_volume_suitable(&volume, "offering-1", range(0, 5 * GIB).as_ref(), None)
                .is_err()
        );
        // Volume is smaller than required.
        assert!(
            check_volume_suitable(&volume, "offering-1", range(20 * GIB, 0).as_ref(), None)
                .is_err()
        );
    }

    #[test]
    fn suitability_rejects_other_zone() {
        let volume = existing_volume();
        let requirement = csi::TopologyRequirement {
            requisite: vec![Topology::zone("zone-2").into()],
            preferred: vec![],
        };
        assert!(
            check_volume_suitable(&volume, "offering-1", None, Some(&requirement)).is_err()
        );
    }

    #[test]
    fn created_at_parsing() {
        let timestamp = parse_created_at("2025-07-07T16:13:06-0700").unwrap();
        assert!(timestamp.seconds > 0);
        assert!(parse_created_at("2025-07-07 16:13:06").is_err());
    }
}
