// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Protected-path refusal for file-mutating tools.
//!
//! A protected entry is tracked by both its canonical path and its inode
//! identity (device, inode), so a rename or symlink swap between check and
//! use still hits the inode match.

use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::tool::ToolError;

#[derive(Debug, Default)]
pub struct ProtectedPaths {
    paths: HashSet<PathBuf>,
    inodes: HashSet<(u64, u64)>,
}

impl ProtectedPaths {
    /// Build the cache from configured path strings.  Entries that do not
    /// exist contribute only their canonicalised-as-given path; existing
    /// entries also contribute their inode identity.
    pub fn new(entries: &[String]) -> Self {
        let mut paths = HashSet::new();
        let mut inodes = HashSet::new();
        for entry in entries {
            let p = PathBuf::from(entry);
            let canon = p.canonicalize().unwrap_or_else(|_| p.clone());
            if let Ok(meta) = std::fs::metadata(&canon) {
                inodes.insert((meta.dev(), meta.ino()));
            }
            paths.insert(canon);
        }
        Self { paths, inodes }
    }

    /// Refuse mutation of a protected target.  The candidate is
    /// canonicalised (falling back to the parent for not-yet-existing
    /// files) and compared against both path and inode sets.
    pub fn check_mutable(&self, target: &Path) -> Result<(), ToolError> {
        let canon = match target.canonicalize() {
            Ok(c) => c,
            Err(_) => {
                // New file: canonicalise the parent and re-attach the name.
                let parent = target.parent().unwrap_or(Path::new("."));
                let file = target.file_name();
                match (parent.canonicalize(), file) {
                    (Ok(p), Some(f)) => p.join(f),
                    _ => target.to_path_buf(),
                }
            }
        };

        if self.paths.contains(&canon) {
            return Err(ToolError::ProtectedPath(canon.display().to_string()));
        }
        if let Ok(meta) = std::fs::metadata(&canon) {
            if self.inodes.contains(&(meta.dev(), meta.ino())) {
                return Err(ToolError::ProtectedPath(canon.display().to_string()));
            }
        }
        // A protected directory protects everything under it.
        for p in &self.paths {
            if canon.starts_with(p) && p != &canon && p.is_dir() {
                return Err(ToolError::ProtectedPath(canon.display().to_string()));
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprotected_path_is_mutable() {
        let dir = tempfile::tempdir().unwrap();
        let pp = ProtectedPaths::new(&[]);
        assert!(pp.check_mutable(&dir.path().join("a.txt")).is_ok());
    }

    #[test]
    fn protected_file_is_refused_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("secret.env");
        std::fs::write(&secret, "k=v").unwrap();
        let pp = ProtectedPaths::new(&[secret.display().to_string()]);
        assert!(matches!(
            pp.check_mutable(&secret),
            Err(ToolError::ProtectedPath(_))
        ));
    }

    #[test]
    fn protected_file_is_refused_through_rename() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("secret.env");
        std::fs::write(&secret, "k=v").unwrap();
        let pp = ProtectedPaths::new(&[secret.display().to_string()]);

        // Renaming keeps the inode; the inode match still refuses.
        let moved = dir.path().join("renamed.env");
        std::fs::rename(&secret, &moved).unwrap();
        assert!(matches!(
            pp.check_mutable(&moved),
            Err(ToolError::ProtectedPath(_))
        ));
    }

    #[test]
    fn files_under_protected_directory_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("secrets");
        std::fs::create_dir(&sub).unwrap();
        let inner = sub.join("token");
        std::fs::write(&inner, "t").unwrap();
        let pp = ProtectedPaths::new(&[sub.display().to_string()]);
        assert!(pp.check_mutable(&inner).is_err());
    }

    #[test]
    fn nonexistent_target_in_unprotected_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let pp = ProtectedPaths::new(&["/etc/shadow".to_string()]);
        assert!(pp.check_mutable(&dir.path().join("new.txt")).is_ok());
    }
}
