//! Recognized image formats and the compressed-restore pipeline decision.

use std::path::Path;

/// Suffixes accepted as restore sources. `.img`, `.iso` and `.dmg` are raw
/// images; `.gz` and `.zip` are fed through an external decompressor.
pub const IMAGE_SUFFIXES: &[&str] = &["img", "iso", "dmg", "gz", "zip"];

/// External decompressor for a compressed image source: command plus the
/// arguments that stream the decompressed bytes to stdout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decompressor {
    pub command: &'static str,
    pub args: Vec<String>,
}

fn suffix_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Whether the path carries a recognized image suffix.
pub fn is_image(path: &Path) -> bool {
    IMAGE_SUFFIXES.contains(&suffix_of(path).as_str())
}

/// Picks the decompressor for a compressed source, or `None` for a raw
/// image. Decided once at copy-stage entry, never re-evaluated mid-stream.
pub fn decompressor(path: &Path) -> Option<Decompressor> {
    let source = path.to_string_lossy().to_string();
    match suffix_of(path).as_str() {
        "gz" => Some(Decompressor {
            command: "gzip",
            args: vec!["-dc".to_string(), source],
        }),
        "zip" => Some(Decompressor {
            command: "unzip",
            args: vec!["-p".to_string(), source],
        }),
        _ => None,
    }
}
