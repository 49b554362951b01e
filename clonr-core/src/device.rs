//! The cross-platform block device value object.

use std::fmt;
use std::path::PathBuf;

/// A candidate removable block device discovered on the system.
///
/// Instances are produced fresh on each enumeration call and are immutable
/// after construction; nothing caches them.
#[derive(Clone, Debug)]
pub struct Device {
    /// Platform-specific short name (e.g. "disk4" on macOS, "sdb" on Linux).
    pub identifier: String,
    /// The path to hand to the copy tool. On platforms that distinguish raw
    /// from buffered device nodes this is the raw form.
    pub raw_path: PathBuf,
    /// Human-readable `name (size)` string. Display only; never used for
    /// matching or equality.
    pub display_label: String,
    /// True for the sentinel returned when enumeration failed; the front-end
    /// should offer manual path entry instead of a real device.
    pub is_placeholder: bool,
}

impl Device {
    pub fn new(
        identifier: impl Into<String>,
        raw_path: impl Into<PathBuf>,
        display_label: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            raw_path: raw_path.into(),
            display_label: display_label.into(),
            is_placeholder: false,
        }
    }

    /// The "detection failed, enter a path manually" sentinel. Enumeration
    /// never fails its caller; it degrades to this.
    pub fn placeholder() -> Self {
        Self {
            identifier: String::new(),
            raw_path: PathBuf::new(),
            display_label: "No devices detected (enter a device path manually)".to_string(),
            is_placeholder: true,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_placeholder {
            write!(f, "{}", self.display_label)
        } else {
            write!(f, "{:<15} {}", self.raw_path.display(), self.display_label)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_has_no_path() {
        let d = Device::placeholder();
        assert!(d.is_placeholder);
        assert!(d.raw_path.as_os_str().is_empty());
    }

    #[test]
    fn display_includes_path_and_label() {
        let d = Device::new("disk4", "/dev/rdisk4", "disk4 (31.9 GB)");
        let row = d.to_string();
        assert!(row.contains("/dev/rdisk4"));
        assert!(row.contains("31.9 GB"));
    }
}
