//! On-disk layout of a node directory

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Well-known paths inside one node directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDir {
    root: PathBuf,
}

impl NodeDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.tahoe`
    pub fn default_location() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tahoe")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("tahoe.cfg")
    }

    pub fn node_url(&self) -> PathBuf {
        self.root.join("node.url")
    }

    pub fn pidfile(&self) -> PathBuf {
        self.root.join("twistd.pid")
    }

    pub fn icon_url(&self) -> PathBuf {
        self.root.join("icon.url")
    }

    pub fn private(&self) -> PathBuf {
        self.root.join("private")
    }

    pub fn api_auth_token(&self) -> PathBuf {
        self.private().join("api_auth_token")
    }

    pub fn aliases(&self) -> PathBuf {
        self.private().join("aliases")
    }

    pub fn rootcap(&self) -> PathBuf {
        self.private().join("rootcap")
    }

    pub fn magic_folders_yaml(&self) -> PathBuf {
        self.private().join("magic_folders.yaml")
    }

    pub fn collective_dircap(&self) -> PathBuf {
        self.private().join("collective_dircap")
    }

    pub fn magic_folder_dircap(&self) -> PathBuf {
        self.private().join("magic_folder_dircap")
    }

    /// Parent of the nested subclient node directories
    pub fn magic_folders_dir(&self) -> PathBuf {
        self.root.join("magic-folders")
    }
}

/// Sorted subdirectories of `basedir` that contain a `tahoe.cfg`.
///
/// An unreadable or missing `basedir` yields an empty list.
pub fn get_nodedirs(basedir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(basedir) else {
        return Vec::new();
    };
    let mut nodedirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir() && path.join("tahoe.cfg").is_file())
        .inspect(|path| debug!("Found nodedir: {}", path.display()))
        .collect();
    nodedirs.sort();
    nodedirs
}
