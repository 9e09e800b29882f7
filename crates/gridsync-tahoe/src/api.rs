//! The node's capability API as seen by the gateway
//!
//! [`GridApi`] is the seam between gateway logic and the HTTP transport;
//! [`crate::client::CapabilityClient`] is the production implementation.

use crate::capability::Capability;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One `?t=json` listing: `["dirnode" | "filenode", {...}]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node(pub String, pub NodeData);

impl Node {
    pub fn kind(&self) -> &str {
        &self.0
    }

    pub fn data(&self) -> &NodeData {
        &self.1
    }

    pub fn children(&self) -> &BTreeMap<String, Node> {
        &self.1.children
    }

    pub fn is_directory(&self) -> bool {
        self.0 == "dirnode"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rw_uri: Option<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ro_uri: Option<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutable: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl NodeData {
    /// The strongest capability offered for this entry
    pub fn best_uri(&self) -> Option<&Capability> {
        self.rw_uri.as_ref().or(self.ro_uri.as_ref())
    }

    /// `metadata.tahoe.linkmotime`, truncated to whole seconds
    pub fn link_mtime(&self) -> Option<i64> {
        self.metadata
            .as_ref()?
            .get("tahoe")?
            .get("linkmotime")?
            .as_f64()
            .map(|t| t as i64)
    }
}

/// Capability API of one node.
///
/// Reads that only report state return `Ok(None)` when the node is not
/// connected or unreachable; callers treat that as "unknown".
#[async_trait]
pub trait GridApi: Send + Sync {
    /// Point the client at a running node
    fn connect(&self, nodeurl: &str, api_token: &str) -> Result<()>;

    fn node_url(&self) -> Option<String>;

    /// Create an unattached mutable directory
    async fn mkdir(&self) -> Result<Capability>;

    async fn upload(&self, local_path: &Path) -> Result<Capability>;

    async fn download(&self, cap: &Capability, local_path: &Path) -> Result<()>;

    async fn link(&self, dircap: &Capability, childname: &str, childcap: &Capability) -> Result<()>;

    async fn unlink(&self, dircap: &Capability, childname: &str) -> Result<()>;

    async fn get_json(&self, cap: &Capability) -> Result<Option<Node>>;

    /// Raw welcome/status page body; `structured` requests `?t=json`
    async fn status_page(&self, structured: bool) -> Result<Option<String>>;

    /// `POST /magic_folder` status, optionally scoped to one folder
    async fn magic_folder_status(&self, name: Option<&str>) -> Result<Option<serde_json::Value>>;
}
