// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sandbox that constrains all file access to the allowed roots.
//!
//! Every user-supplied relative path is resolved against the workspace and
//! the configured extra roots. Resolution is lexical first (`.`/`..`
//! normalization, no escape), then physical: no component on the resolved
//! path may be a symlink. Oversized files are refused with the same error
//! kind so callers cannot distinguish probe outcomes.

use std::path::{Component, Path, PathBuf};

use crate::error::MemoryError;
use crate::types::SourceKind;

/// One allowed root directory.
#[derive(Debug, Clone)]
pub struct AllowedRoot {
    pub path: PathBuf,
    /// Source tag for files found directly under this root.
    pub kind: RootKind,
}

/// Family of an allowed root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    Workspace,
    Extra,
}

impl RootKind {
    /// Base source tag; the scanner refines `Workspace` into `Memory` for
    /// files under `memory/` and the top-level sentinels.
    pub fn base_source(&self) -> SourceKind {
        match self {
            Self::Workspace => SourceKind::Workspace,
            Self::Extra => SourceKind::Extra,
        }
    }
}

/// A path that passed the gate.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    /// Absolute on-disk path.
    pub abs: PathBuf,
    /// Normalized root-relative path, forward slashes.
    pub rel: String,
    pub root_kind: RootKind,
}

/// The sandbox gate shared by `readFile` and the scanner's per-entry guard.
#[derive(Debug, Clone)]
pub struct PathGate {
    roots: Vec<AllowedRoot>,
    max_file_bytes: u64,
}

impl PathGate {
    pub fn new(workspace: &Path, extra_paths: &[PathBuf], max_file_bytes: u64) -> Self {
        let mut roots = vec![AllowedRoot {
            path: workspace.to_path_buf(),
            kind: RootKind::Workspace,
        }];
        for extra in extra_paths {
            roots.push(AllowedRoot {
                path: extra.clone(),
                kind: RootKind::Extra,
            });
        }
        Self {
            roots,
            max_file_bytes,
        }
    }

    pub fn roots(&self) -> &[AllowedRoot] {
        &self.roots
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }

    /// Resolve a user-supplied relative path to an absolute path inside one
    /// of the allowed roots. The first root containing the file wins.
    pub fn resolve(&self, rel_path: &str) -> Result<ResolvedPath, MemoryError> {
        let normalized = normalize_rel(rel_path)
            .ok_or_else(|| MemoryError::PathDenied(rel_path.to_string()))?;

        for root in &self.roots {
            let abs = root.path.join(&normalized);
            if !abs.is_file() {
                continue;
            }
            self.check_within_root(&abs, &root.path, rel_path)?;

            let meta = std::fs::metadata(&abs)
                .map_err(|_| MemoryError::PathDenied(rel_path.to_string()))?;
            if meta.len() > self.max_file_bytes {
                return Err(MemoryError::PathDenied(rel_path.to_string()));
            }

            return Ok(ResolvedPath {
                abs,
                rel: normalized.to_string_lossy().replace('\\', "/"),
                root_kind: root.kind,
            });
        }

        Err(MemoryError::PathDenied(rel_path.to_string()))
    }

    /// Per-entry guard used by the scanner: verify an absolute path that was
    /// discovered under `root` is symlink-free below the root.
    pub fn check_within_root(
        &self,
        abs: &Path,
        root: &Path,
        display: &str,
    ) -> Result<(), MemoryError> {
        let rel = abs
            .strip_prefix(root)
            .map_err(|_| MemoryError::PathDenied(display.to_string()))?;

        // Symlink-following is disabled: refuse any link component, even one
        // whose target stays inside the root.
        let mut current = root.to_path_buf();
        for component in rel.components() {
            current.push(component);
            let meta = std::fs::symlink_metadata(&current)
                .map_err(|_| MemoryError::PathDenied(display.to_string()))?;
            if meta.file_type().is_symlink() {
                return Err(MemoryError::PathDenied(display.to_string()));
            }
        }
        Ok(())
    }
}

/// Lexically normalize a relative path: forward slashes, `.` removed, `..`
/// never allowed to climb above the root. Absolute paths are rejected.
fn normalize_rel(rel_path: &str) -> Option<PathBuf> {
    if rel_path.is_empty() {
        return None;
    }
    let candidate = Path::new(rel_path);
    let mut normalized = PathBuf::new();
    let mut depth: usize = 0;

    for component in candidate.components() {
        match component {
            Component::Normal(part) => {
                normalized.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                normalized.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    if depth == 0 {
        return None;
    }
    Some(normalized)
}
