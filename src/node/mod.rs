//! The CSI Node service.
//!
//! Maps CSI volume IDs to local block devices (see [`dev`]), stages and
//! publishes them through the host mount toolchain, resizes filesystems
//! after a controller expand, and reports volume statistics.

use crate::{
    cloud::CloudConnector,
    csi::{
        self,
        node_server::Node,
        node_service_capability,
        volume_capability::AccessType,
        NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
        NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
        NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
        NodePublishVolumeResponse, NodeServiceCapability, NodeStageVolumeRequest,
        NodeStageVolumeResponse, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
        NodeUnstageVolumeRequest, NodeUnstageVolumeResponse,
    },
    limiter::VolumeOpGuard,
    topology::Topology,
};
use nix::{errno::Errno, sys};
use std::{path::Path, sync::Arc};
use tonic::{Code, Request, Response, Status};
use tracing::{debug, error, info, trace};

mod dev;
mod error;
mod mount;

macro_rules! failure {
    (Code::$code:ident, $msg:literal) => {{ error!($msg); Status::new(Code::$code, $msg) }};
    (Code::$code:ident, $fmt:literal $(,$args:expr)+) => {{ let message = format!($fmt $(,$args)+); error!("{}", message); Status::new(Code::$code, message) }};
}

/// Filesystems this driver can format and mount.
const SUPPORTED_FILESYSTEMS: [&str; 4] = ["ext2", "ext3", "ext4", "xfs"];
const DEFAULT_FILESYSTEM: &str = "ext4";

/// The Csi Node implementation.
pub struct NodeService {
    connector: Arc<dyn CloudConnector>,
    node_name: String,
    max_volumes_per_node: i64,
}

impl NodeService {
    /// Creates a new node service for the VM named `node_name`.
    pub fn new(
        connector: Arc<dyn CloudConnector>,
        node_name: String,
        max_volumes_per_node: i64,
    ) -> NodeService {
        Self {
            connector,
            node_name,
            max_volumes_per_node,
        }
    }
}

/// Pick the filesystem for a mount capability, rejecting kinds this driver
/// cannot format.
fn stage_filesystem(mount_volume: &csi::volume_capability::MountVolume) -> Result<String, Status> {
    let fstype = if mount_volume.fs_type.is_empty() {
        DEFAULT_FILESYSTEM.to_string()
    } else {
        mount_volume.fs_type.clone()
    };
    if !SUPPORTED_FILESYSTEMS.contains(&fstype.as_str()) {
        return Err(Status::invalid_argument(format!(
            "unsupported filesystem type: {fstype}"
        )));
    }
    Ok(fstype)
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        let vm = self
            .connector
            .get_node_info(&self.node_name)
            .await
            .map_err(Status::from)?;

        debug!(node.id = %vm.id, zone.id = %vm.zone_id, "NodeGetInfo request");

        Ok(Response::new(NodeGetInfoResponse {
            node_id: vm.id,
            max_volumes_per_node: self.max_volumes_per_node,
            accessible_topology: Some(Topology::zone(vm.zone_id).into()),
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        let caps = vec![
            node_service_capability::rpc::Type::StageUnstageVolume,
            node_service_capability::rpc::Type::GetVolumeStats,
            node_service_capability::rpc::Type::ExpandVolume,
        ];

        debug!("NodeGetCapabilities request: {:?}", caps);

        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: caps
                .into_iter()
                .map(|capability| NodeServiceCapability {
                    r#type: Some(node_service_capability::Type::Rpc(
                        node_service_capability::Rpc {
                            r#type: capability as i32,
                        },
                    )),
                })
                .collect(),
        }))
    }

    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let msg = request.into_inner();

        trace!("node_stage_volume {:?}", msg);

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to stage volume: missing volume id"
            ));
        }

        if msg.staging_target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to stage volume {}: missing staging path",
                &msg.volume_id
            ));
        }

        let access_type = msg
            .volume_capability
            .as_ref()
            .and_then(|capability| capability.access_type.as_ref())
            .ok_or_else(|| {
                failure!(
                    Code::InvalidArgument,
                    "Failed to stage volume {}: missing volume capability",
                    &msg.volume_id
                )
            })?;

        let _guard = VolumeOpGuard::new(&msg.volume_id)?;

        let mnt = match access_type {
            AccessType::Mount(mnt) => mnt,
            AccessType::Block(_) => {
                // Block volumes are not staged.
                return Ok(Response::new(NodeStageVolumeResponse {}));
            }
        };
        let fstype = stage_filesystem(mnt)?;

        let device_path = dev::get_device_path(&msg.volume_id).await.map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to stage volume {}: error locating device: {}",
                &msg.volume_id,
                error
            )
        })?;

        tokio::fs::create_dir_all(&msg.staging_target_path)
            .await
            .map_err(|error| {
                failure!(
                    Code::Internal,
                    "Failed to create staging dir {}: {}",
                    &msg.staging_target_path,
                    error
                )
            })?;

        // Already staged from a previous attempt.
        if mount::path_mounted(&msg.staging_target_path).map_err(Status::from)? {
            debug!(volume.id = %msg.volume_id, "volume already staged");
            return Ok(Response::new(NodeStageVolumeResponse {}));
        }

        match mount::detect_filesystem(&device_path)
            .await
            .map_err(Status::from)?
        {
            None => {
                info!(device.path = %device_path, fstype = %fstype, "formatting device");
                mount::format_device(&device_path, &fstype)
                    .await
                    .map_err(Status::from)?;
            }
            Some(existing) if existing != fstype => {
                return Err(failure!(
                    Code::Internal,
                    "Failed to stage volume {}: device {} already formatted with {}, {} requested",
                    &msg.volume_id,
                    &device_path,
                    existing,
                    fstype
                ));
            }
            Some(_) => {}
        }

        mount::mount_device(
            &device_path,
            &msg.staging_target_path,
            &fstype,
            &mnt.mount_flags,
        )
        .await
        .map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to stage volume {}: mount failed: {}",
                &msg.volume_id,
                error
            )
        })?;

        info!(volume.id = %msg.volume_id, staging_path = %msg.staging_target_path, "volume staged");
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    /// This operation MUST be idempotent: unstaging an already unstaged
    /// volume succeeds.
    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let msg = request.into_inner();

        trace!("node_unstage_volume {:?}", msg);

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unstage volume: missing volume id"
            ));
        }

        if msg.staging_target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unstage volume {}: missing staging path",
                &msg.volume_id
            ));
        }

        let _guard = VolumeOpGuard::new(&msg.volume_id)?;

        if mount::path_mounted(&msg.staging_target_path).map_err(Status::from)? {
            mount::unmount(&msg.staging_target_path)
                .await
                .map_err(|error| {
                    failure!(
                        Code::Internal,
                        "Failed to unstage volume {}: {}",
                        &msg.volume_id,
                        error
                    )
                })?;
        }

        info!(volume.id = %msg.volume_id, "volume unstaged");
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let msg = request.into_inner();

        trace!("node_publish_volume {:?}", msg);

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume: missing volume id"
            ));
        }

        if msg.target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume {}: missing target path",
                &msg.volume_id
            ));
        }

        // The staging path is not optional, as we advertise
        // StageUnstageVolume.
        if msg.staging_target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume {}: missing staging path",
                &msg.volume_id
            ));
        }

        let access_type = msg
            .volume_capability
            .as_ref()
            .and_then(|capability| capability.access_type.as_ref())
            .ok_or_else(|| {
                failure!(
                    Code::InvalidArgument,
                    "Failed to publish volume {}: missing volume capability",
                    &msg.volume_id
                )
            })?;

        let _guard = VolumeOpGuard::new(&msg.volume_id)?;

        let mut flags = Vec::new();
        if msg.readonly {
            flags.push("ro".to_string());
        }

        match access_type {
            AccessType::Mount(mnt) => {
                flags.extend(mnt.mount_flags.iter().cloned());
                tokio::fs::create_dir_all(&msg.target_path)
                    .await
                    .map_err(|error| {
                        failure!(
                            Code::Internal,
                            "Failed to create mountpoint {} for volume {}: {}",
                            &msg.target_path,
                            &msg.volume_id,
                            error
                        )
                    })?;
                if mount::path_mounted(&msg.target_path).map_err(Status::from)? {
                    debug!(volume.id = %msg.volume_id, "volume already published");
                    return Ok(Response::new(NodePublishVolumeResponse {}));
                }
                mount::bind_mount(&msg.staging_target_path, &msg.target_path, &flags)
                    .await
                    .map_err(|error| {
                        failure!(
                            Code::Internal,
                            "Failed to publish volume {}: {}",
                            &msg.volume_id,
                            error
                        )
                    })?;
            }
            AccessType::Block(_) => {
                let device_path =
                    dev::get_device_path(&msg.volume_id).await.map_err(|error| {
                        failure!(
                            Code::Internal,
                            "Failed to publish volume {}: error locating device: {}",
                            &msg.volume_id,
                            error
                        )
                    })?;
                // The CO ensures the parent of the target exists; the
                // device node is bind-mounted over a plain file.
                if let Some(parent) = Path::new(&msg.target_path).parent() {
                    if !parent.exists() || !parent.is_dir() {
                        return Err(failure!(
                            Code::Internal,
                            "Failed to find parent dir for mountpoint {}, volume {}",
                            &msg.target_path,
                            &msg.volume_id
                        ));
                    }
                }
                if mount::path_mounted(&msg.target_path).map_err(Status::from)? {
                    debug!(volume.id = %msg.volume_id, "volume already published");
                    return Ok(Response::new(NodePublishVolumeResponse {}));
                }
                if !Path::new(&msg.target_path).exists() {
                    tokio::fs::File::create(&msg.target_path)
                        .await
                        .map_err(|error| {
                            failure!(
                                Code::Internal,
                                "Failed to create target file {} for volume {}: {}",
                                &msg.target_path,
                                &msg.volume_id,
                                error
                            )
                        })?;
                }
                mount::bind_mount(&device_path, &msg.target_path, &flags)
                    .await
                    .map_err(|error| {
                        failure!(
                            Code::Internal,
                            "Failed to publish volume {}: {}",
                            &msg.volume_id,
                            error
                        )
                    })?;
            }
        }

        info!(volume.id = %msg.volume_id, target_path = %msg.target_path, "volume published");
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    /// This operation MUST be idempotent. If the target path no longer
    /// exists, a previous unpublish already succeeded.
    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let msg = request.into_inner();

        trace!("node_unpublish_volume {:?}", msg);

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unpublish volume: missing volume id"
            ));
        }

        if msg.target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unpublish volume {}: missing target path",
                msg.volume_id
            ));
        }

        let _guard = VolumeOpGuard::new(&msg.volume_id)?;

        let target_path = Path::new(&msg.target_path);
        if target_path.exists() {
            if mount::path_mounted(&msg.target_path).map_err(Status::from)? {
                mount::unmount(&msg.target_path).await.map_err(|error| {
                    failure!(
                        Code::Internal,
                        "Failed to unpublish volume {}: {}",
                        &msg.volume_id,
                        error
                    )
                })?;
            }
            let removed = if target_path.is_dir() {
                tokio::fs::remove_dir(&msg.target_path).await
            } else {
                tokio::fs::remove_file(&msg.target_path).await
            };
            if let Err(error) = removed {
                if error.kind() != std::io::ErrorKind::NotFound {
                    return Err(failure!(
                        Code::Internal,
                        "Failed to remove mountpoint {} for volume {}: {}",
                        &msg.target_path,
                        &msg.volume_id,
                        error
                    ));
                }
            }
        }

        info!(volume.id = %msg.volume_id, "volume unpublished");
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    /// Get volume stats method evaluates and returns capacity metrics.
    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let msg = request.into_inner();
        trace!("node_get_volume_stats {:?}", msg);
        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to get volume stats: missing volume id"
            ));
        }
        if msg.volume_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to get volume stats: missing volume path"
            ));
        }

        let volume_path = Path::new(&msg.volume_path);
        if !volume_path.exists() {
            return Err(Status::new(Code::NotFound, "volume path doesn't exist"));
        }

        if volume_path.is_dir() {
            trace!("getting statfs metrics for {:?}", volume_path);
            match sys::statfs::statfs(volume_path) {
                Ok(info) => Ok(Response::new(NodeGetVolumeStatsResponse {
                    usage: vec![
                        csi::VolumeUsage {
                            total: info.blocks() as i64 * info.block_size(),
                            unit: csi::volume_usage::Unit::Bytes as i32,
                            available: info.blocks_available() as i64 * info.block_size(),
                            used: (info.blocks() - info.blocks_free()) as i64
                                * info.block_size(),
                        },
                        csi::VolumeUsage {
                            total: info.files() as i64,
                            unit: csi::volume_usage::Unit::Inodes as i32,
                            available: info.files_free() as i64,
                            used: (info.files() - info.files_free()) as i64,
                        },
                    ],
                    volume_condition: None,
                })),
                Err(err) => match err {
                    Errno::ENOENT => Err(Status::new(Code::NotFound, err.to_string())),
                    Errno::EIO => Err(Status::new(Code::Internal, err.to_string())),
                    Errno::ENOSYS => Err(Status::new(Code::Unavailable, err.to_string())),
                    Errno::ENOTDIR => Err(Status::new(Code::Internal, err.to_string())),
                    _ => Err(Status::new(Code::InvalidArgument, err.to_string())),
                },
            }
        } else {
            // Raw block volumes expose only their total size.
            let total = mount::block_size_bytes(&msg.volume_path)
                .await
                .map_err(Status::from)?;
            Ok(Response::new(NodeGetVolumeStatsResponse {
                usage: vec![csi::VolumeUsage {
                    total,
                    unit: csi::volume_usage::Unit::Bytes as i32,
                    available: 0,
                    used: 0,
                }],
                volume_condition: None,
            }))
        }
    }

    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let msg = request.into_inner();

        trace!("node_expand_volume {:?}", msg);

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to expand volume: missing volume id"
            ));
        }
        if msg.volume_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to expand volume {}: missing volume path",
                &msg.volume_id
            ));
        }

        let _guard = VolumeOpGuard::new(&msg.volume_id)?;

        let capacity_bytes = msg
            .capacity_range
            .as_ref()
            .map(|range| range.required_bytes)
            .unwrap_or_default();

        // Raw block volumes grow with the device; there is no filesystem
        // to resize.
        if matches!(
            msg.volume_capability
                .as_ref()
                .and_then(|capability| capability.access_type.as_ref()),
            Some(AccessType::Block(_))
        ) {
            return Ok(Response::new(NodeExpandVolumeResponse { capacity_bytes }));
        }

        let device_path = dev::get_device_path(&msg.volume_id).await.map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to expand volume {}: error locating device: {}",
                &msg.volume_id,
                error
            )
        })?;

        mount::resize_filesystem(&device_path, &msg.volume_path)
            .await
            .map_err(|error| {
                failure!(
                    Code::Internal,
                    "Failed to expand volume {}: {}",
                    &msg.volume_id,
                    error
                )
            })?;

        info!(volume.id = %msg.volume_id, "volume filesystem expanded");
        Ok(Response::new(NodeExpandVolumeResponse { capacity_bytes }))
    }
}
