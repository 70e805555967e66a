// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! On-disk layout of the sync cache.

use std::path::{Path, PathBuf};

use crate::config::DEFAULT_CACHE_DIR;

/// Paths of every database the sync layer opens.
///
/// ```text
/// {root}/
///   http-cache/responses.redb   # HTTP response cache
///   snapshots.redb              # repository persistent tier
///   prefs.redb                  # namespaced preferences (auth token)
/// ```
#[derive(Debug, Clone)]
pub struct CachePaths {
    root: PathBuf,
}

impl Default for CachePaths {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_DIR)
    }
}

impl CachePaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the HTTP response cache.
    pub fn http_cache_dir(&self) -> PathBuf {
        self.root.join("http-cache")
    }

    pub fn responses_db(&self) -> PathBuf {
        self.http_cache_dir().join("responses.redb")
    }

    pub fn snapshots_db(&self) -> PathBuf {
        self.root.join("snapshots.redb")
    }

    pub fn prefs_db(&self) -> PathBuf {
        self.root.join("prefs.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_use_cache_root() {
        let paths = CachePaths::default();
        assert_eq!(paths.root(), Path::new("./wallet-cache"));
    }

    #[test]
    fn database_paths_are_correct() {
        let paths = CachePaths::new("/tmp/sync");
        assert_eq!(paths.http_cache_dir(), PathBuf::from("/tmp/sync/http-cache"));
        assert_eq!(
            paths.responses_db(),
            PathBuf::from("/tmp/sync/http-cache/responses.redb")
        );
        assert_eq!(paths.snapshots_db(), PathBuf::from("/tmp/sync/snapshots.redb"));
        assert_eq!(paths.prefs_db(), PathBuf::from("/tmp/sync/prefs.redb"));
    }
}
