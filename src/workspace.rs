//! Direct file access inside a project directory.
//!
//! Every path handed to these functions has already been resolved by the
//! path boundary; nothing here re-interprets client input. The functions are
//! synchronous and meant to be called through `spawn_blocking` from request
//! handlers.

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::error::GatewayError;

/// Refuse to serve files larger than this.
pub const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Directory names never shown to the editor.
const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "dist",
    "build",
    ".svelte-kit",
    "__pycache__",
    ".venv",
];

/// Maximum recursion depth for `tree`.
const MAX_TREE_DEPTH: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct TreeEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeEntry>>,
}

pub fn exists(path: &Path) -> bool {
    path.exists()
}

pub fn read(path: &Path) -> Result<Vec<u8>, GatewayError> {
    let meta = fs::metadata(path).map_err(|_| GatewayError::NotFound)?;
    if meta.len() > MAX_FILE_BYTES {
        return Err(GatewayError::FileTooLarge);
    }
    Ok(fs::read(path)?)
}

/// Write a file, creating missing parent directories.
pub fn write(path: &Path, content: &[u8]) -> Result<(), GatewayError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

/// Delete a file or directory tree.
pub fn delete(path: &Path) -> Result<(), GatewayError> {
    let meta = fs::metadata(path).map_err(|_| GatewayError::NotFound)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// List one directory level, directories first, each group name-sorted.
/// Hidden entries are skipped except the `.env` family, along with the
/// ignored build/vendor directories.
pub fn list_directory(dir: &Path, root: &Path) -> Result<Vec<TreeEntry>, GatewayError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_visible(&name) {
            continue;
        }
        let full = entry.path();
        let rel = full
            .strip_prefix(root)
            .unwrap_or(&full)
            .to_string_lossy()
            .into_owned();
        let kind = if entry.file_type()?.is_dir() {
            "directory"
        } else {
            "file"
        };
        entries.push(TreeEntry {
            name,
            kind,
            path: rel,
            children: None,
        });
    }
    entries.sort_by(|a, b| {
        if a.kind == b.kind {
            a.name.cmp(&b.name)
        } else if a.kind == "directory" {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Greater
        }
    });
    Ok(entries)
}

/// Recursive listing of a project root, capped at `MAX_TREE_DEPTH` levels.
pub fn tree(root: &Path) -> Result<Vec<TreeEntry>, GatewayError> {
    build_tree(root, root, 0)
}

fn build_tree(dir: &Path, root: &Path, depth: usize) -> Result<Vec<TreeEntry>, GatewayError> {
    if depth > MAX_TREE_DEPTH {
        return Ok(Vec::new());
    }
    let mut entries = list_directory(dir, root)?;
    for entry in &mut entries {
        if entry.kind == "directory" {
            entry.children = Some(build_tree(&dir.join(&entry.name), root, depth + 1)?);
        }
    }
    Ok(entries)
}

fn is_visible(name: &str) -> bool {
    if IGNORED_DIRS.contains(&name) {
        return false;
    }
    !(name.starts_with('.') && !name.starts_with(".env"))
}
