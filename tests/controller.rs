//! Controller RPC scenarios exercised against the fake cloud connector.
//!
//! Each test seeds its own volumes with identifiers unique to the test, so
//! the process-wide operation locks never collide across tests.

use cloudstack_csi_driver::{
    cloud::{fake, CloudConnector, Volume},
    controller::ControllerService,
    csi::{
        self,
        controller_server::Controller,
        volume_capability::{access_mode::Mode as AccessMode, AccessType},
        volume_content_source,
    },
    limiter::VolumeOpGuard,
    topology::Topology,
    util::gigabytes_to_bytes,
    DEVICE_ID_CONTEXT_KEY, DISK_OFFERING_PARAMETER, ZONE_TOPOLOGY_KEY,
};
use std::{collections::HashMap, sync::Arc};
use tonic::{Code, Request};

fn service() -> (Arc<fake::FakeCloudConnector>, ControllerService) {
    let connector = Arc::new(fake::FakeCloudConnector::new());
    (connector.clone(), ControllerService::new(connector))
}

fn mount_capability(mode: AccessMode) -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(AccessType::Mount(
            csi::volume_capability::MountVolume::default(),
        )),
        access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
    }
}

fn block_capability() -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(AccessType::Block(
            csi::volume_capability::BlockVolume::default(),
        )),
        access_mode: Some(csi::volume_capability::AccessMode {
            mode: AccessMode::SingleNodeWriter as i32,
        }),
    }
}

fn create_request(name: &str, offering: &str) -> csi::CreateVolumeRequest {
    csi::CreateVolumeRequest {
        name: name.to_string(),
        volume_capabilities: vec![mount_capability(AccessMode::SingleNodeWriter)],
        parameters: HashMap::from([(
            DISK_OFFERING_PARAMETER.to_string(),
            offering.to_string(),
        )]),
        ..Default::default()
    }
}

fn requisite(zone: &str) -> Option<csi::TopologyRequirement> {
    Some(csi::TopologyRequirement {
        requisite: vec![Topology::zone(zone).into()],
        preferred: vec![],
    })
}

fn seeded_volume(id: &str, name: &str) -> Volume {
    Volume {
        id: id.to_string(),
        name: name.to_string(),
        size: gigabytes_to_bytes(10),
        disk_offering_id: fake::DISK_OFFERING_ID.to_string(),
        zone_id: fake::ZONE_ID.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_new_volume_in_random_zone() {
    let (connector, controller) = service();
    let mut request = create_request("create-new-vol", fake::DISK_OFFERING_ID);
    request.capacity_range = Some(csi::CapacityRange {
        required_bytes: gigabytes_to_bytes(5),
        limit_bytes: 0,
    });

    let response = controller
        .create_volume(Request::new(request))
        .await
        .unwrap()
        .into_inner();
    let volume = response.volume.unwrap();
    assert_eq!(volume.capacity_bytes, gigabytes_to_bytes(5));
    assert_eq!(
        volume.accessible_topology[0].segments[ZONE_TOPOLOGY_KEY],
        fake::ZONE_ID
    );
    // The cloud now knows the volume.
    assert!(connector.volume(&volume.volume_id).is_some());
}

#[tokio::test]
async fn create_volume_is_idempotent() {
    let (connector, controller) = service();
    connector.add_volume(seeded_volume("recreate-vol-id", "recreate-vol"));

    let mut request = create_request("recreate-vol", fake::DISK_OFFERING_ID);
    request.capacity_range = Some(csi::CapacityRange {
        required_bytes: 0,
        limit_bytes: 0,
    });
    request.accessibility_requirements = requisite(fake::ZONE_ID);

    let response = controller
        .create_volume(Request::new(request))
        .await
        .unwrap()
        .into_inner();
    let volume = response.volume.unwrap();
    assert_eq!(volume.volume_id, "recreate-vol-id");
    assert_eq!(volume.capacity_bytes, gigabytes_to_bytes(10));
    assert_eq!(
        volume.accessible_topology[0].segments[ZONE_TOPOLOGY_KEY],
        fake::ZONE_ID
    );
}

#[tokio::test]
async fn create_volume_collides_on_other_offering() {
    let (connector, controller) = service();
    connector.add_volume(seeded_volume("collide-vol-id", "collide-vol"));

    let request = create_request("collide-vol", "another-offering");
    let status = controller
        .create_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::AlreadyExists);
}

#[tokio::test]
async fn create_volume_collides_on_other_zone() {
    let (connector, controller) = service();
    connector.add_volume(seeded_volume("zone-collide-vol-id", "zone-collide-vol"));

    let mut request = create_request("zone-collide-vol", fake::DISK_OFFERING_ID);
    request.accessibility_requirements = requisite("some-other-zone");
    let status = controller
        .create_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::AlreadyExists);
}

#[tokio::test]
async fn create_volume_validates_arguments() {
    let (_, controller) = service();

    // Missing name.
    let status = controller
        .create_volume(Request::new(create_request("", fake::DISK_OFFERING_ID)))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // Missing disk offering parameter.
    let mut request = create_request("validate-vol", fake::DISK_OFFERING_ID);
    request.parameters.clear();
    let status = controller
        .create_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // No capabilities at all.
    let mut request = create_request("validate-vol", fake::DISK_OFFERING_ID);
    request.volume_capabilities.clear();
    let status = controller
        .create_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // Multi-writer access mode.
    let mut request = create_request("validate-vol", fake::DISK_OFFERING_ID);
    request.volume_capabilities = vec![mount_capability(AccessMode::MultiNodeMultiWriter)];
    let status = controller
        .create_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // Round-up exceeds the limit.
    let mut request = create_request("validate-vol", fake::DISK_OFFERING_ID);
    request.capacity_range = Some(csi::CapacityRange {
        required_bytes: 3_000_000_000,
        limit_bytes: 3_000_000_000,
    });
    let status = controller
        .create_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn create_volume_from_snapshot_bumps_to_snapshot_size() {
    let (_, controller) = service();
    let mut request = create_request("from-snap-vol", fake::DISK_OFFERING_ID);
    // Ask for less than the 10 GiB snapshot; the volume must not be
    // smaller than its source.
    request.capacity_range = Some(csi::CapacityRange {
        required_bytes: gigabytes_to_bytes(5),
        limit_bytes: 0,
    });
    request.volume_content_source = Some(csi::VolumeContentSource {
        r#type: Some(volume_content_source::Type::Snapshot(
            volume_content_source::SnapshotSource {
                snapshot_id: fake::SNAPSHOT_ID.to_string(),
            },
        )),
    });

    let response = controller
        .create_volume(Request::new(request.clone()))
        .await
        .unwrap()
        .into_inner();
    let volume = response.volume.unwrap();
    assert_eq!(volume.capacity_bytes, gigabytes_to_bytes(10));
    assert_eq!(volume.content_source, request.volume_content_source);
    assert_eq!(
        volume.accessible_topology[0].segments[ZONE_TOPOLOGY_KEY],
        fake::ZONE_ID
    );
}

#[tokio::test]
async fn create_volume_from_unknown_snapshot_is_not_found() {
    let (_, controller) = service();
    let mut request = create_request("from-missing-snap-vol", fake::DISK_OFFERING_ID);
    request.volume_content_source = Some(csi::VolumeContentSource {
        r#type: Some(volume_content_source::Type::Snapshot(
            volume_content_source::SnapshotSource {
                snapshot_id: "no-such-snapshot".to_string(),
            },
        )),
    });

    let status = controller
        .create_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn delete_absent_volume_succeeds() {
    let (_, controller) = service();
    let response = controller
        .delete_volume(Request::new(csi::DeleteVolumeRequest {
            volume_id: "delete-absent-vol".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert_eq!(response.into_inner(), csi::DeleteVolumeResponse {});
}

#[tokio::test]
async fn delete_volume_removes_it() {
    let (connector, controller) = service();
    connector.add_volume(seeded_volume("delete-me-id", "delete-me"));

    controller
        .delete_volume(Request::new(csi::DeleteVolumeRequest {
            volume_id: "delete-me-id".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert!(connector.volume("delete-me-id").is_none());
}

#[tokio::test]
async fn delete_volume_respects_identifier_lock() {
    let (connector, controller) = service();
    connector.add_volume(seeded_volume("locked-vol-id", "locked-vol"));

    let _guard = VolumeOpGuard::new("locked-vol-id").unwrap();
    let status = controller
        .delete_volume(Request::new(csi::DeleteVolumeRequest {
            volume_id: "locked-vol-id".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Aborted);
    // The failed call must not have eaten the reservation.
    assert!(connector.volume("locked-vol-id").is_some());
}

fn publish_request(volume_id: &str, node_id: &str) -> csi::ControllerPublishVolumeRequest {
    csi::ControllerPublishVolumeRequest {
        volume_id: volume_id.to_string(),
        node_id: node_id.to_string(),
        volume_capability: Some(mount_capability(AccessMode::SingleNodeWriter)),
        readonly: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn publish_attaches_detached_volume() {
    let (connector, controller) = service();
    connector.add_volume(seeded_volume("attach-vol-id", "attach-vol"));

    let response = controller
        .controller_publish_volume(Request::new(publish_request("attach-vol-id", fake::NODE_ID)))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.publish_context[DEVICE_ID_CONTEXT_KEY], "1");
    assert_eq!(
        connector.volume("attach-vol-id").unwrap().virtual_machine_id,
        fake::NODE_ID
    );
}

#[tokio::test]
async fn publish_rejects_volume_attached_elsewhere() {
    let (connector, controller) = service();
    let mut volume = seeded_volume("stolen-vol-id", "stolen-vol");
    volume.virtual_machine_id = "some-other-vm".to_string();
    volume.device_id = "2".to_string();
    connector.add_volume(volume);

    let status = controller
        .controller_publish_volume(Request::new(publish_request("stolen-vol-id", fake::NODE_ID)))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::AlreadyExists);
}

#[tokio::test]
async fn publish_already_attached_returns_recorded_device() {
    let (connector, controller) = service();
    let mut volume = seeded_volume("attached-vol-id", "attached-vol");
    volume.virtual_machine_id = fake::NODE_ID.to_string();
    volume.device_id = "3".to_string();
    connector.add_volume(volume);

    let response = controller
        .controller_publish_volume(Request::new(publish_request(
            "attached-vol-id",
            fake::NODE_ID,
        )))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.publish_context[DEVICE_ID_CONTEXT_KEY], "3");
}

#[tokio::test]
async fn publish_validates_arguments() {
    let (_, controller) = service();

    let mut request = publish_request("publish-validate-vol", fake::NODE_ID);
    request.readonly = true;
    let status = controller
        .controller_publish_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let mut request = publish_request("publish-validate-vol", fake::NODE_ID);
    request.volume_capability = Some(mount_capability(AccessMode::MultiNodeReaderOnly));
    let status = controller
        .controller_publish_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let status = controller
        .controller_publish_volume(Request::new(publish_request("publish-validate-vol", "")))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn publish_unknown_vm_is_not_found() {
    let (connector, controller) = service();
    connector.add_volume(seeded_volume("no-vm-vol-id", "no-vm-vol"));

    let status = controller
        .controller_publish_volume(Request::new(publish_request("no-vm-vol-id", "no-such-vm")))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn unpublish_is_idempotent() {
    let (connector, controller) = service();

    // Unknown volume: success.
    controller
        .controller_unpublish_volume(Request::new(csi::ControllerUnpublishVolumeRequest {
            volume_id: "unpublish-absent-vol".to_string(),
            node_id: fake::NODE_ID.to_string(),
            ..Default::default()
        }))
        .await
        .unwrap();

    // Attached to a different node: success, and the attachment stays.
    let mut volume = seeded_volume("unpublish-other-vol-id", "unpublish-other-vol");
    volume.virtual_machine_id = "some-other-vm".to_string();
    volume.device_id = "2".to_string();
    connector.add_volume(volume);
    controller
        .controller_unpublish_volume(Request::new(csi::ControllerUnpublishVolumeRequest {
            volume_id: "unpublish-other-vol-id".to_string(),
            node_id: fake::NODE_ID.to_string(),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert_eq!(
        connector
            .volume("unpublish-other-vol-id")
            .unwrap()
            .virtual_machine_id,
        "some-other-vm"
    );
}

#[tokio::test]
async fn unpublish_detaches_volume() {
    let (connector, controller) = service();
    let mut volume = seeded_volume("unpublish-vol-id", "unpublish-vol");
    volume.virtual_machine_id = fake::NODE_ID.to_string();
    volume.device_id = "1".to_string();
    connector.add_volume(volume);

    controller
        .controller_unpublish_volume(Request::new(csi::ControllerUnpublishVolumeRequest {
            volume_id: "unpublish-vol-id".to_string(),
            node_id: fake::NODE_ID.to_string(),
            ..Default::default()
        }))
        .await
        .unwrap();
    let volume = connector.volume("unpublish-vol-id").unwrap();
    assert!(volume.virtual_machine_id.is_empty());
    assert!(volume.device_id.is_empty());
}

#[tokio::test]
async fn validate_volume_capabilities_confirms_single_writer() {
    let (connector, controller) = service();
    connector.add_volume(seeded_volume("validate-caps-vol-id", "validate-caps-vol"));

    let response = controller
        .validate_volume_capabilities(Request::new(csi::ValidateVolumeCapabilitiesRequest {
            volume_id: "validate-caps-vol-id".to_string(),
            volume_capabilities: vec![mount_capability(AccessMode::SingleNodeWriter)],
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(response.confirmed.is_some());
    assert!(response.message.is_empty());

    // An unsupported mode yields a message, not an error.
    let response = controller
        .validate_volume_capabilities(Request::new(csi::ValidateVolumeCapabilitiesRequest {
            volume_id: "validate-caps-vol-id".to_string(),
            volume_capabilities: vec![mount_capability(AccessMode::MultiNodeMultiWriter)],
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(response.confirmed.is_none());
    assert!(!response.message.is_empty());
}

#[tokio::test]
async fn expand_volume_grows_and_reports_node_expansion() {
    let (connector, controller) = service();
    connector.add_volume(seeded_volume("expand-vol-id", "expand-vol"));

    let response = controller
        .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
            volume_id: "expand-vol-id".to_string(),
            capacity_range: Some(csi::CapacityRange {
                required_bytes: gigabytes_to_bytes(20),
                limit_bytes: 0,
            }),
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.capacity_bytes, gigabytes_to_bytes(20));
    assert!(response.node_expansion_required);
    assert_eq!(
        connector.volume("expand-vol-id").unwrap().size,
        gigabytes_to_bytes(20)
    );
}

#[tokio::test]
async fn expand_block_volume_needs_no_node_expansion() {
    let (connector, controller) = service();
    connector.add_volume(seeded_volume("expand-block-vol-id", "expand-block-vol"));

    let response = controller
        .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
            volume_id: "expand-block-vol-id".to_string(),
            capacity_range: Some(csi::CapacityRange {
                required_bytes: gigabytes_to_bytes(20),
                limit_bytes: 0,
            }),
            volume_capability: Some(block_capability()),
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!response.node_expansion_required);
}

#[tokio::test]
async fn expand_volume_rejects_limit_overflow() {
    let (connector, controller) = service();
    connector.add_volume(seeded_volume("expand-limit-vol-id", "expand-limit-vol"));

    let status = controller
        .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
            volume_id: "expand-limit-vol-id".to_string(),
            capacity_range: Some(csi::CapacityRange {
                required_bytes: gigabytes_to_bytes(20),
                limit_bytes: gigabytes_to_bytes(10),
            }),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::OutOfRange);
}

#[tokio::test]
async fn expand_absent_volume_is_not_found() {
    let (_, controller) = service();
    let status = controller
        .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
            volume_id: "expand-absent-vol".to_string(),
            capacity_range: Some(csi::CapacityRange {
                required_bytes: gigabytes_to_bytes(20),
                limit_bytes: 0,
            }),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn snapshot_name_reuse_on_other_volume_collides() {
    let (connector, controller) = service();
    connector.add_volume(seeded_volume("snap-source-a-id", "snap-source-a"));
    connector.add_volume(seeded_volume("snap-source-b-id", "snap-source-b"));

    let request_a = csi::CreateSnapshotRequest {
        source_volume_id: "snap-source-a-id".to_string(),
        name: "shared-snap-name".to_string(),
        ..Default::default()
    };
    let first = controller
        .create_snapshot(Request::new(request_a.clone()))
        .await
        .unwrap()
        .into_inner();
    let snapshot = first.snapshot.unwrap();
    assert_eq!(snapshot.source_volume_id, "snap-source-a-id");
    assert!(snapshot.ready_to_use);
    assert!(snapshot.creation_time.is_some());

    // Same name, different source volume.
    let status = controller
        .create_snapshot(Request::new(csi::CreateSnapshotRequest {
            source_volume_id: "snap-source-b-id".to_string(),
            name: "shared-snap-name".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::AlreadyExists);

    // Same name, same source volume: idempotent.
    let second = controller
        .create_snapshot(Request::new(request_a))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(second.snapshot.unwrap().snapshot_id, snapshot.snapshot_id);
}

#[tokio::test]
async fn create_snapshot_of_unknown_volume_is_not_found() {
    let (_, controller) = service();
    let status = controller
        .create_snapshot(Request::new(csi::CreateSnapshotRequest {
            source_volume_id: "no-such-volume".to_string(),
            name: "orphan-snap".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn delete_absent_snapshot_succeeds() {
    let (_, controller) = service();
    controller
        .delete_snapshot(Request::new(csi::DeleteSnapshotRequest {
            snapshot_id: "no-such-snapshot".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap();
}

#[tokio::test]
async fn list_snapshots_pagination_walk() {
    let (connector, controller) = service();
    for name in ["walk-snap-a", "walk-snap-b", "walk-snap-c", "walk-snap-d"] {
        connector
            .create_snapshot(fake::SNAPSHOT_VOLUME_ID, name)
            .await
            .unwrap();
    }

    let full = controller
        .list_snapshots(Request::new(csi::ListSnapshotsRequest::default()))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(full.entries.len(), 5);
    assert!(full.next_token.is_empty());

    // Walking the pages reproduces the full listing in order.
    let mut walked = Vec::new();
    let mut starting_token = String::new();
    loop {
        let page = controller
            .list_snapshots(Request::new(csi::ListSnapshotsRequest {
                max_entries: 2,
                starting_token: starting_token.clone(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        walked.extend(page.entries);
        if page.next_token.is_empty() {
            break;
        }
        starting_token = page.next_token;
    }
    assert_eq!(walked, full.entries);
}

#[tokio::test]
async fn list_snapshots_rejects_invalid_token() {
    let (_, controller) = service();

    for token in ["garbage", "100"] {
        let status = controller
            .list_snapshots(Request::new(csi::ListSnapshotsRequest {
                starting_token: token.to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Aborted, "token {token}");
    }
}

#[tokio::test]
async fn list_snapshots_filters_by_snapshot_id() {
    let (_, controller) = service();
    let response = controller
        .list_snapshots(Request::new(csi::ListSnapshotsRequest {
            snapshot_id: fake::SNAPSHOT_ID.to_string(),
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.entries.len(), 1);
    let snapshot = response.entries[0].snapshot.as_ref().unwrap();
    assert_eq!(snapshot.snapshot_id, fake::SNAPSHOT_ID);
    assert_eq!(snapshot.source_volume_id, fake::SNAPSHOT_VOLUME_ID);
}

#[tokio::test]
async fn controller_capabilities_are_advertised() {
    let (_, controller) = service();
    let response = controller
        .controller_get_capabilities(Request::new(csi::ControllerGetCapabilitiesRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.capabilities.len(), 5);
}
