//! Path confinement for client-supplied project names and file paths.
//!
//! Every filesystem or process operation that accepts a client path goes
//! through this module first; callers never trust a validation performed on
//! a different form of the same path.

use std::path::{Component, Path, PathBuf};

use crate::error::GatewayError;

/// Check a project reference against the allowed charset.
///
/// The charset is the only gate keeping a reference from naming anything
/// outside the projects root, so separators, dots and empty names are
/// rejected outright.
pub fn validate_project_ref(name: &str) -> Result<(), GatewayError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(GatewayError::InvalidProjectRef);
    }
    Ok(())
}

/// Map a validated project reference to its root directory.
pub fn project_root(projects_dir: &Path, project: &str) -> Result<PathBuf, GatewayError> {
    validate_project_ref(project)?;
    Ok(projects_dir.join(project))
}

/// Resolve a client-supplied relative path inside a project.
///
/// The relative path is reduced to plain name components; any parent, rooted
/// or prefixed component fails with `PathTraversal`, however it is nested.
/// An empty path resolves to the project root itself. When the target (or
/// its closest existing ancestor) can be canonicalized, the canonical form
/// must stay under the canonical project root, so a symlink inside the
/// project cannot point the resolution outside it.
pub fn resolve(
    projects_dir: &Path,
    project: &str,
    relative: &str,
) -> Result<PathBuf, GatewayError> {
    let root = project_root(projects_dir, project)?;

    let mut clean = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(GatewayError::PathTraversal)
            }
        }
    }
    let resolved = root.join(clean);

    if let Ok(canonical_root) = root.canonicalize() {
        if let Some(canonical) = canonicalize_existing_ancestor(&resolved, &root) {
            if !canonical.starts_with(&canonical_root) {
                return Err(GatewayError::PathTraversal);
            }
        }
    }
    Ok(resolved)
}

/// Canonicalize `path`, falling back to its closest existing ancestor inside
/// `root`. Returns `None` when nothing between `path` and `root` exists yet.
fn canonicalize_existing_ancestor(path: &Path, root: &Path) -> Option<PathBuf> {
    let mut probe = path;
    loop {
        if let Ok(canonical) = probe.canonicalize() {
            return Some(canonical);
        }
        match probe.parent() {
            Some(parent) if parent.starts_with(root) => probe = parent,
            _ => return None,
        }
    }
}
