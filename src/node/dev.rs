//! Block device discovery across hypervisor presentations.
//!
//! XenServer exposes an attached volume as `/dev/xvdX`, VMware as
//! `/dev/sdX`, and KVM publishes a by-id link derived from the volume UUID.
//! A freshly attached disk may take a while to appear, so discovery retries
//! under exponential backoff, nudging the SCSI hosts and udev between
//! attempts.

use super::{error::DeviceError, mount};
use std::{path::Path, time::Duration};
use tokio::process::Command;
use tracing::{debug, trace, warn};

const DISK_ID_PATH: &str = "/dev/disk/by-id";
const SCSI_HOST_PATH: &str = "/sys/class/scsi_host";

/// by-id prefixes used by the KVM hypervisor flavors.
const KVM_SOURCE_PREFIXES: [&str; 3] = ["virtio-", "scsi-", "scsi-0QEMU_QEMU_HARDDISK_"];

const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_FACTOR: f64 = 1.5;
const BACKOFF_STEPS: u32 = 20;

/// Find the local block device backing the given volume, retrying under
/// exponential backoff until it appears or the attempts run out. The RPC
/// deadline bounds the overall wait through request cancellation.
pub(crate) async fn get_device_path(volume_id: &str) -> Result<String, DeviceError> {
    let mut delay = BACKOFF_INITIAL;
    for step in 0..BACKOFF_STEPS {
        if let Some(path) = device_path_by_serial_id(volume_id).await? {
            debug!(volume.id = volume_id, device.path = %path, "device path found");
            return Ok(path);
        }
        // Nothing yet: ask the SCSI hosts to rescan and let udev settle
        // before the next attempt.
        probe_volume().await;
        if step + 1 < BACKOFF_STEPS {
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(BACKOFF_FACTOR);
        }
    }
    Err(DeviceError::new(&format!(
        "failed to find device for volume {volume_id} within the allotted time"
    )))
}

async fn device_path_by_serial_id(volume_id: &str) -> Result<Option<String>, DeviceError> {
    // XenServer probe.
    if let Some(path) = probe_letter_devices("/dev/xvd", volume_id).await {
        return Ok(Some(path));
    }
    // VMware probe.
    if let Some(path) = probe_letter_devices("/dev/sd", volume_id).await {
        return Ok(Some(path));
    }
    // KVM publishes the volume under its libvirt serial.
    let serial = disk_uuid_to_serial(volume_id);
    Ok(kvm_device_path(Path::new(DISK_ID_PATH), &serial))
}

/// Probe `<prefix>b` through `<prefix>z`. `a` is skipped: that is the root
/// disk.
async fn probe_letter_devices(prefix: &str, volume_id: &str) -> Option<String> {
    for letter in b'b'..=b'z' {
        let device_path = format!("{prefix}{}", letter as char);
        trace!(volume.id = volume_id, device.path = %device_path, "checking device path");
        if !Path::new(&device_path).exists() {
            continue;
        }
        if verify_device(&device_path).await {
            return Some(device_path);
        }
    }
    None
}

/// A candidate is only taken when it is an unmounted block device with
/// readable udev properties.
async fn verify_device(device_path: &str) -> bool {
    match mount::is_block_device(device_path) {
        Ok(true) => {}
        _ => return false,
    }
    match mount::device_mounted(device_path) {
        Ok(false) => {}
        _ => return false,
    }
    match Command::new("udevadm")
        .args(["info", "--query=property", device_path])
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(error) => {
            debug!(device.path = device_path, %error, "udevadm query failed");
            false
        }
    }
}

/// First existing by-id path among the KVM prefixes.
fn kvm_device_path(disk_id_dir: &Path, serial: &str) -> Option<String> {
    KVM_SOURCE_PREFIXES
        .iter()
        .map(|prefix| disk_id_dir.join(format!("{prefix}{serial}")))
        .find(|path| path.exists())
        .map(|path| path.to_string_lossy().into_owned())
}

/// Reproduce the CloudStack KVM translation of a volume UUID to a libvirt
/// disk serial: hyphens removed, truncated to 20 characters when longer.
/// The truncation is a compatibility requirement of the hypervisor driver.
fn disk_uuid_to_serial(uuid: &str) -> String {
    let without_hyphen = uuid.replace('-', "");
    if without_hyphen.len() < 20 {
        without_hyphen
    } else {
        without_hyphen[..20].to_string()
    }
}

/// Ask every SCSI host to rescan, then trigger udev so fresh devices get
/// their nodes and links.
async fn probe_volume() {
    debug!("scanning SCSI hosts");
    match std::fs::read_dir(SCSI_HOST_PATH) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let scan = entry.path().join("scan");
                if let Err(error) = tokio::fs::write(&scan, "- - -").await {
                    warn!(path = %scan.display(), %error, "failed to rescan scsi host");
                }
            }
        }
        Err(error) => warn!(%error, "failed to read {SCSI_HOST_PATH}"),
    }
    if let Err(error) = Command::new("udevadm").arg("trigger").output().await {
        warn!(%error, "error running udevadm trigger");
    }
}
