//! Locating and installing the image-shrinking tool.
//!
//! Shrinking truncates an image's unused trailing space with PiShrink. The
//! script is fetched once from upstream on first use. Nothing in here is
//! allowed to fail an operation: every problem returns `None` and the
//! controller skips the stage with a warning.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use tracing::warn;

/// Upstream location of the shrink script.
pub const PISHRINK_URL: &str =
    "https://raw.githubusercontent.com/Drewsif/PiShrink/master/pishrink.sh";

/// Where the script gets installed: `$CLONR_SHRINK_PATH` when set, else
/// `~/.clonr/pishrink.sh`.
pub fn installed_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("CLONR_SHRINK_PATH") {
        return Some(PathBuf::from(path));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".clonr").join("pishrink.sh"))
}

/// Returns a runnable shrink script, downloading it on first use. `None`
/// means shrink is unavailable this run; the caller degrades to skipping
/// the stage.
pub fn ensure_tool() -> Option<PathBuf> {
    let path = installed_path()?;
    if path.is_file() {
        return Some(path);
    }

    if let Some(dir) = path.parent() {
        if let Err(e) = fs::create_dir_all(dir) {
            warn!(error = %e, "could not create shrink tool directory");
            return None;
        }
    }

    // Fetching through curl keeps the crate free of an HTTP stack; the rest
    // of the pipeline already delegates to external tools.
    let fetched = Command::new("curl")
        .args(["-fsSL", "-o"])
        .arg(&path)
        .arg(PISHRINK_URL)
        .status();

    match fetched {
        Ok(status) if status.success() => {}
        Ok(status) => {
            warn!(?status, "shrink tool download failed");
            let _ = fs::remove_file(&path);
            return None;
        }
        Err(e) => {
            warn!(error = %e, "could not run curl to fetch the shrink tool");
            return None;
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(&path, fs::Permissions::from_mode(0o755)) {
            warn!(error = %e, "could not mark the shrink tool executable");
            let _ = fs::remove_file(&path);
            return None;
        }
    }

    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env mutation is process-global, so the override paths share one test.
    #[test]
    fn env_override_and_installed_fast_path() {
        unsafe { std::env::set_var("CLONR_SHRINK_PATH", "/opt/tools/pishrink.sh") };
        assert_eq!(
            installed_path(),
            Some(PathBuf::from("/opt/tools/pishrink.sh"))
        );

        // An already-present script is reused without any download.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("pishrink.sh");
        fs::write(&script, "#!/bin/bash\n").unwrap();
        unsafe { std::env::set_var("CLONR_SHRINK_PATH", &script) };
        assert_eq!(ensure_tool(), Some(script));

        unsafe { std::env::remove_var("CLONR_SHRINK_PATH") };
    }
}
