// Keystone Tool Server — File Capabilities
// Reads and writes under allowlisted roots only. Realpath resolution is
// mandatory before the allowlist check, so symlinks and ../ tricks cannot
// escape a root.

use crate::atoms::error::{EngineError, EngineResult};
use log::info;
use std::path::{Path, PathBuf};

/// Resolve a path and verify it sits under one of the allowed roots. For
/// paths that don't exist yet (writes), the nearest existing ancestor is
/// resolved instead and the remainder re-appended.
pub fn validate_path(raw: &str, allowed_roots: &[PathBuf]) -> EngineResult<PathBuf> {
    let requested = Path::new(raw);
    if !requested.is_absolute() {
        return Err(EngineError::Security(format!("relative paths are not allowed: {raw}")));
    }

    let resolved = resolve_with_missing_tail(requested)?;
    let permitted = allowed_roots.iter().any(|root| {
        // Roots are compared canonically too, when they exist
        let canonical_root = root.canonicalize().unwrap_or_else(|_| root.clone());
        resolved.starts_with(&canonical_root)
    });
    if !permitted {
        return Err(EngineError::Security(format!(
            "path escapes the allowed roots: {raw}"
        )));
    }
    Ok(resolved)
}

fn resolve_with_missing_tail(path: &Path) -> EngineResult<PathBuf> {
    if let Ok(real) = path.canonicalize() {
        return Ok(real);
    }
    // Walk up to the nearest existing ancestor, canonicalize that, then
    // re-attach the missing components.
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => {
                tail.push(name.to_os_string());
                existing.pop();
            }
            None => return Err(EngineError::Security("unresolvable path".into())),
        }
    }
    let mut real = existing.canonicalize()?;
    for part in tail.iter().rev() {
        real.push(part);
    }
    Ok(real)
}

pub fn read_file(raw: &str, allowed_roots: &[PathBuf]) -> EngineResult<String> {
    let path = validate_path(raw, allowed_roots)?;
    let content = std::fs::read_to_string(&path)?;
    info!("[tools] read_file {} ({} bytes)", path.display(), content.len());
    Ok(content)
}

pub fn write_file(raw: &str, content: &str, allowed_roots: &[PathBuf]) -> EngineResult<()> {
    let path = validate_path(raw, allowed_roots)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, content)?;
    info!("[tools] write_file {} ({} bytes)", path.display(), content.len());
    Ok(())
}
