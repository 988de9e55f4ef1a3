//! Serializable description of a built topology.
//!
//! A manifest records which role each port plays so that tooling outside
//! the test process (a client library, a debugging shell script) can find
//! the nodes. It is written as TOML next to the topology's data.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ports::host_strings;
use crate::slots::SlotRange;
use crate::{Error, Result};

const MANIFEST_FILE: &str = "topology.toml";

/// Which shape of topology a manifest describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    /// One standalone server.
    Server,
    /// A primary with replicas.
    Replication,
    /// Sentinels watching replication groups.
    Sentinel,
    /// A hash-slot cluster.
    Cluster,
}

/// Role of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Standalone server, replication primary or cluster master.
    Primary,
    /// Replicates a primary named by `replica_of`.
    Replica,
    Sentinel,
}

/// One process in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestNode {
    pub name: String,
    pub role: NodeRole,
    pub port: u16,

    /// Replication group, for sentinel setups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Port of the primary this node replicates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_of: Option<u16>,

    /// Hash slots owned, for cluster masters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots: Option<SlotRange>,
}

impl ManifestNode {
    pub fn new(name: impl Into<String>, role: NodeRole, port: u16) -> Self {
        Self {
            name: name.into(),
            role,
            port,
            group: None,
            replica_of: None,
            slots: None,
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn replicating(mut self, port: u16) -> Self {
        self.replica_of = Some(port);
        self
    }

    pub fn owning(mut self, slots: SlotRange) -> Self {
        self.slots = Some(slots);
        self
    }
}

/// Roles and ports of every process in a topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyManifest {
    pub kind: TopologyKind,
    pub nodes: Vec<ManifestNode>,
}

impl TopologyManifest {
    pub fn new(kind: TopologyKind, nodes: Vec<ManifestNode>) -> Self {
        Self { kind, nodes }
    }

    /// Ports of nodes with `role`, in manifest order.
    pub fn ports_with_role(&self, role: NodeRole) -> Vec<u16> {
        self.nodes
            .iter()
            .filter(|n| n.role == role)
            .map(|n| n.port)
            .collect()
    }

    /// Every port, in manifest order.
    pub fn ports(&self) -> Vec<u16> {
        self.nodes.iter().map(|n| n.port).collect()
    }

    /// `localhost:<port>` for every node.
    pub fn host_strings(&self) -> Vec<String> {
        host_strings(&self.ports())
    }

    /// Path of the manifest inside `dir`.
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// Writes the manifest into `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = Self::path_in(dir);
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(path)
    }

    /// Reads the manifest saved in `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = Self::path_in(dir);
        if !path.exists() {
            return Err(Error::ManifestNotFound(dir.to_path_buf()));
        }
        let content = fs::read_to_string(&path)?;
        Ok(toml::from_str(&content)?)
    }
}
