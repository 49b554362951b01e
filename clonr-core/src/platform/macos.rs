//! Removable-device discovery on macOS via `diskutil list`.

use std::io;
use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;

use crate::device::Device;

/// Whole-disk header lines, e.g. `/dev/disk2 (external, physical):`.
static DISK_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^/dev/(disk\d+) \(([^)]*)\):").unwrap());

/// The whole-disk size column, e.g. `*31.9 GB`.
static DISK_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([\d.]+ [KMGT]B)").unwrap());

/// Parses `diskutil list` output into devices. Only external physical disks
/// qualify; the raw `/dev/rdiskN` node is always selected over the buffered
/// `/dev/diskN` form.
fn parse_listing(listing: &str) -> Vec<Device> {
    let mut devices = Vec::new();

    for section in listing.split("\n\n") {
        let Some(header) = DISK_HEADER.captures(section) else {
            continue;
        };
        let identifier = header[1].to_string();
        let kind = &header[2];
        if !kind.contains("external") {
            continue;
        }

        let size = DISK_SIZE
            .captures(section)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "unknown size".to_string());

        devices.push(Device::new(
            identifier.clone(),
            format!("/dev/r{identifier}"),
            format!("{identifier} ({size})"),
        ));
    }

    devices
}

pub(super) fn scan() -> io::Result<Vec<Device>> {
    let output = Command::new("diskutil").arg("list").output()?;
    if !output.status.success() {
        return Err(io::Error::other("diskutil list exited non-zero"));
    }
    Ok(parse_listing(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
/dev/disk0 (internal, physical):
   #:                       TYPE NAME                    SIZE       IDENTIFIER
   0:      GUID_partition_scheme                        *500.3 GB   disk0

/dev/disk4 (external, physical):
   #:                       TYPE NAME                    SIZE       IDENTIFIER
   0:     FDisk_Partition_Scheme                        *31.9 GB    disk4
   1:             Windows_FAT_32 boot                    268.4 MB   disk4s1
";

    #[test]
    fn external_disks_only() {
        let devices = parse_listing(LISTING);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].identifier, "disk4");
    }

    #[test]
    fn raw_node_wins_over_buffered() {
        let devices = parse_listing(LISTING);
        assert_eq!(devices[0].raw_path.to_string_lossy(), "/dev/rdisk4");
    }

    #[test]
    fn label_carries_the_whole_disk_size() {
        let devices = parse_listing(LISTING);
        assert_eq!(devices[0].display_label, "disk4 (31.9 GB)");
    }
}
