//! Removable-device discovery on Linux via `/sys/block`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::device::Device;

/// Reads one attribute file from `/sys/block/<device>/`.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Finds the parent device of a partition (`/dev/sda1` → `/dev/sda`), used
/// to exclude the system drive's whole disk.
fn parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.find('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// Scans `/sys/block` for removable, non-zero-size devices, excluding loop
/// devices and the disk the root filesystem lives on. Linux has no raw
/// versus buffered node split, so the device path doubles as the raw path.
pub(super) fn scan() -> io::Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let system_disk_parent = disks
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .map(|d| parent_device_path(&PathBuf::from("/dev/").join(d.name())));

    let mut devices = Vec::new();

    for entry in fs::read_dir("/sys/block")?.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().to_string();
        let device_path = PathBuf::from("/dev/").join(&name);

        if name.starts_with("loop") || Some(&device_path) == system_disk_parent.as_ref() {
            continue;
        }

        let removable = read_sys_file(&name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);
        if !removable {
            continue;
        }

        // Zero sectors usually means an empty card reader.
        let size_sectors = read_sys_file(&name, "size")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        if size_sectors == 0 {
            continue;
        }

        let size_gb = (size_sectors * 512) as f64 / (1024.0 * 1024.0 * 1024.0);
        let label = format!("{name} ({size_gb:.1} GB)");

        devices.push(Device::new(name, device_path, label));
    }

    Ok(devices)
}
