//! Virtual FTP paths and their mapping onto the listener root.
//!
//! Sessions see a virtual tree rooted at `/`. Every path a client names is
//! first normalized lexically against the session's working directory, then
//! mapped under the real root directory. The mapping refuses anything that
//! would land outside the root, including via symlinks.

use anyhow::{anyhow, bail, Result};
use std::path::{Path, PathBuf};

/// Resolve `arg` against the virtual working directory `cwd`.
///
/// `.` is dropped and `..` pops one level; popping past `/` stays at `/`.
/// The result always starts with `/` and never ends with one (except `/`).
pub fn join_virtual(cwd: &str, arg: &str) -> Result<String> {
    if arg.contains('\0') {
        bail!("path contains NUL byte");
    }
    let mut parts: Vec<&str> = Vec::new();
    let start = if arg.starts_with('/') { "" } else { cwd };
    for segment in start.split('/').chain(arg.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Parent directory and final component of a normalized virtual path.
pub fn split_virtual(virt: &str) -> (String, String) {
    match virt.rfind('/') {
        Some(0) => ("/".to_string(), virt[1..].to_string()),
        Some(pos) => (virt[..pos].to_string(), virt[pos + 1..].to_string()),
        None => ("/".to_string(), virt.to_string()),
    }
}

/// Map a normalized virtual path onto the real root.
///
/// `root` must already be canonical. Existing targets are canonicalized to
/// resolve symlinks; new targets have their parent canonicalized. The result
/// must stay under `root`.
pub fn normalize_under_root(root: &Path, virt: &str) -> Result<PathBuf> {
    let mut joined = root.to_path_buf();
    for segment in virt.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            bail!("path {:?} is not normalized", virt);
        }
        // Reject separators the host OS would interpret inside a component
        #[cfg(windows)]
        if segment.contains('\\') || segment.contains(':') {
            bail!("path component {:?} not allowed", segment);
        }
        joined.push(segment);
    }

    let final_path = if joined.exists() {
        joined
            .canonicalize()
            .map_err(|e| anyhow!("failed to canonicalize {:?}: {}", joined, e))?
    } else if let Some(parent) = joined.parent().filter(|p| p.exists()) {
        let canonical_parent = parent
            .canonicalize()
            .map_err(|e| anyhow!("failed to canonicalize parent {:?}: {}", parent, e))?;
        match joined.file_name() {
            Some(name) => canonical_parent.join(name),
            None => canonical_parent,
        }
    } else {
        joined
    };

    if !final_path.starts_with(root) {
        bail!("path {:?} escapes root {:?}", virt, root);
    }
    Ok(final_path)
}
