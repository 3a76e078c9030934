//! Host mount, format and resize operations, delegated to the node OS
//! toolchain.

use super::error::DeviceError;
use std::process::Output;
use tokio::process::Command;
use tracing::trace;

const PROC_MOUNTS: &str = "/proc/mounts";

/// Check a command's exit status, surfacing stderr on failure.
fn ack_command_output(output: Output, binary: &str) -> Result<(), DeviceError> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(DeviceError::new(&format!(
        "{binary} failed: {}",
        stderr.trim()
    )))
}

async fn run(binary: &str, args: &[&str]) -> Result<Output, DeviceError> {
    trace!(binary, ?args, "running host command");
    Command::new(binary)
        .args(args)
        .output()
        .await
        .map_err(|error| DeviceError::new(&format!("failed to execute {binary}: {error}")))
}

/// The filesystem currently on the device, if any.
pub(crate) async fn detect_filesystem(device: &str) -> Result<Option<String>, DeviceError> {
    let output = run("blkid", &["-o", "value", "-s", "TYPE", device]).await?;
    // blkid exits non-zero when the device carries no recognisable
    // signature; that simply means the device is unformatted.
    if !output.status.success() {
        return Ok(None);
    }
    let fstype = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok(if fstype.is_empty() { None } else { Some(fstype) })
}

/// Create a filesystem on the device using its fs util.
pub(crate) async fn format_device(device: &str, fstype: &str) -> Result<(), DeviceError> {
    let binary = format!("mkfs.{fstype}");
    let output = run(&binary, &[device]).await?;
    ack_command_output(output, &binary)
}

/// Mount a device on a target directory.
pub(crate) async fn mount_device(
    device: &str,
    target: &str,
    fstype: &str,
    flags: &[String],
) -> Result<(), DeviceError> {
    let options = flags.join(",");
    let mut args = vec!["-t", fstype];
    if !options.is_empty() {
        args.push("-o");
        args.push(&options);
    }
    args.push(device);
    args.push(target);
    let output = run("mount", &args).await?;
    ack_command_output(output, "mount")
}

/// Bind-mount a source path (directory or device node) onto a target.
pub(crate) async fn bind_mount(
    source: &str,
    target: &str,
    flags: &[String],
) -> Result<(), DeviceError> {
    let options = flags.join(",");
    let mut args = vec!["--bind"];
    if !options.is_empty() {
        args.push("-o");
        args.push(&options);
    }
    args.push(source);
    args.push(target);
    let output = run("mount", &args).await?;
    ack_command_output(output, "mount")
}

/// Unmount a target path.
pub(crate) async fn unmount(target: &str) -> Result<(), DeviceError> {
    let output = run("umount", &[target]).await?;
    ack_command_output(output, "umount")
}

/// Whether anything is mounted at the given path.
pub(crate) fn path_mounted(target: &str) -> Result<bool, DeviceError> {
    mounts_field_contains(1, target)
}

/// Whether the given device is mounted anywhere.
pub(crate) fn device_mounted(device: &str) -> Result<bool, DeviceError> {
    mounts_field_contains(0, device)
}

fn mounts_field_contains(field: usize, value: &str) -> Result<bool, DeviceError> {
    let mounts = std::fs::read_to_string(PROC_MOUNTS)?;
    Ok(mounts
        .lines()
        .any(|line| line.split_whitespace().nth(field) == Some(value)))
}

/// Size of a block device in bytes.
pub(crate) async fn block_size_bytes(device: &str) -> Result<i64, DeviceError> {
    let output = run("blockdev", &["--getsize64", device]).await?;
    let size = String::from_utf8_lossy(&output.stdout).trim().to_string();
    ack_command_output(output, "blockdev")?;
    Ok(size.parse::<i64>()?)
}

/// Whether the given path is a block device.
pub(crate) fn is_block_device(path: &str) -> Result<bool, DeviceError> {
    use nix::sys::stat::SFlag;
    let stat = nix::sys::stat::stat(path)?;
    Ok(stat.st_mode & SFlag::S_IFMT.bits() == SFlag::S_IFBLK.bits())
}

/// Grow the filesystem on the device to fill it. ext* resizes by device,
/// xfs by mount point.
pub(crate) async fn resize_filesystem(
    device: &str,
    mount_path: &str,
) -> Result<(), DeviceError> {
    match detect_filesystem(device).await? {
        Some(fstype) if fstype.starts_with("ext") => {
            let output = run("resize2fs", &[device]).await?;
            ack_command_output(output, "resize2fs")
        }
        Some(fstype) if fstype == "xfs" => {
            let output = run("xfs_growfs", &[mount_path]).await?;
            ack_command_output(output, "xfs_growfs")
        }
        Some(fstype) => Err(DeviceError::new(&format!(
            "cannot resize filesystem {fstype} on {device}"
        ))),
        None => Err(DeviceError::new(&format!(
            "no filesystem found on {device}"
        ))),
    }
}
