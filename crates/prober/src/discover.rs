//! Discovery of audio files under a batch root.
//!
//! Every visible direct subdirectory of the root becomes one group holding the
//! audio files found anywhere below it. Audio files lying directly in the root
//! form one extra group, [`LOOSE_GROUP`], renamed with a `_root` suffix when
//! a subdirectory already carries that name.

use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Audio file extensions accepted for probing (case-insensitive matching).
pub const AUDIO_EXTENSIONS: &[&str] = &[".mp3", ".flac", ".wav", ".m4a", ".aac", ".ogg", ".wma"];

/// Group name for files directly under the root
pub const LOOSE_GROUP: &str = "individual_files";

/// Files sharing one report, in discovery order.
#[derive(Debug, Clone, PartialEq)]
pub struct FileGroup {
    pub name: String,
    pub files: Vec<PathBuf>,
}

/// Checks if a file has an audio extension (case-insensitive).
pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            AUDIO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |n| n.starts_with('.'))
}

/// Collects the groups under `root`, ordered by name with the loose-files
/// group last. Groups without eligible files are left out, so a missing or
/// empty root yields no groups.
pub fn discover_groups(root: &Path) -> Vec<FileGroup> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "cannot read batch root");
            return Vec::new();
        }
    };

    let mut subdirs = Vec::new();
    let mut loose = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            if !is_hidden(&path) {
                subdirs.push(path);
            }
        } else if path.is_file() && is_audio_file(&path) {
            loose.push(path);
        }
    }
    subdirs.sort();
    loose.sort();

    let mut groups: Vec<FileGroup> = subdirs
        .into_iter()
        .filter_map(|dir| {
            let name = dir.file_name()?.to_string_lossy().into_owned();
            let files = collect_audio_files(&dir);
            (!files.is_empty()).then_some(FileGroup { name, files })
        })
        .collect();

    if !loose.is_empty() {
        groups.push(FileGroup {
            name: loose_group_name(&groups),
            files: loose,
        });
    }
    groups
}

/// Name for the loose-files group that no subdirectory group already uses.
/// Compared case-insensitively since report files are named after groups.
fn loose_group_name(groups: &[FileGroup]) -> String {
    let mut name = LOOSE_GROUP.to_string();
    while groups.iter().any(|g| g.name.eq_ignore_ascii_case(&name)) {
        name.push_str("_root");
    }
    name
}

/// Recursively collects audio files below `dir`, skipping hidden directories.
pub fn collect_audio_files(dir: &Path) -> Vec<PathBuf> {
    let walker = WalkDir::new(dir).into_iter().filter_entry(|entry| {
        // Allow the starting directory even if it starts with '.'
        !(entry.file_type().is_dir() && entry.depth() > 0 && is_hidden(entry.path()))
    });

    let mut files: Vec<PathBuf> = walker
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file() && is_audio_file(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}
