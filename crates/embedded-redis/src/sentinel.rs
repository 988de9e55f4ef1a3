//! Sentinels watching one or more replication groups.

use std::sync::Arc;

use async_trait::async_trait;

use crate::instance::{SentinelConfig, ServerConfig};
use crate::manifest::{ManifestNode, NodeRole, TopologyKind, TopologyManifest};
use crate::ports::{DEFAULT_SENTINEL_PORT, DEFAULT_SERVER_PORT, PortAllocator};
use crate::process::ProcessHandle;
use crate::replication::ReplicationGroup;
use crate::settings::HarnessSettings;
use crate::topology::{AggregateTopology, Topology};
use crate::{Error, Result};

/// Sentinels plus the replication groups they monitor.
///
/// Sentinels start first and stop last; each tier is handled
/// concurrently.
#[derive(Debug)]
pub struct SentinelTopology {
    sentinels: Vec<Arc<ProcessHandle>>,
    groups: Vec<Arc<ReplicationGroup>>,
    aggregate: AggregateTopology,
}

impl SentinelTopology {
    pub fn builder() -> SentinelTopologyBuilder {
        SentinelTopologyBuilder::default()
    }

    /// Assembles already-built parts.
    pub fn new(sentinels: Vec<Arc<ProcessHandle>>, groups: Vec<Arc<ReplicationGroup>>) -> Self {
        let aggregate = AggregateTopology::new()
            .with_tier(
                "sentinels",
                sentinels
                    .iter()
                    .map(|s| Arc::clone(s) as Arc<dyn Topology>)
                    .collect(),
            )
            .with_tier(
                "servers",
                groups
                    .iter()
                    .map(|g| Arc::clone(g) as Arc<dyn Topology>)
                    .collect(),
            );
        Self {
            sentinels,
            groups,
            aggregate,
        }
    }

    pub fn sentinels(&self) -> &[Arc<ProcessHandle>] {
        &self.sentinels
    }

    pub fn groups(&self) -> &[Arc<ReplicationGroup>] {
        &self.groups
    }

    pub fn sentinel_ports(&self) -> Vec<u16> {
        self.sentinels.iter().map(|s| s.port()).collect()
    }

    pub fn server_ports(&self) -> Vec<u16> {
        self.groups.iter().flat_map(|g| g.ports()).collect()
    }

    pub fn manifest(&self) -> TopologyManifest {
        let sentinels = self
            .sentinels
            .iter()
            .map(|s| ManifestNode::new(s.name(), NodeRole::Sentinel, s.port()));
        let servers = self.groups.iter().flat_map(|g| g.manifest_nodes());
        TopologyManifest::new(TopologyKind::Sentinel, sentinels.chain(servers).collect())
    }
}

#[async_trait]
impl Topology for SentinelTopology {
    async fn start(&self) -> Result<()> {
        self.aggregate.start().await
    }

    async fn stop(&self) -> Result<()> {
        self.aggregate.stop().await
    }

    fn is_active(&self) -> bool {
        self.aggregate.is_active()
    }

    fn ports(&self) -> Vec<u16> {
        self.aggregate.ports()
    }
}

#[derive(Debug, Clone)]
struct GroupRequest {
    name: String,
    replicas: usize,
}

/// Builder for [`SentinelTopology`].
///
/// Server ports are handed out group by group in declaration order
/// (primary first), then sentinel ports.
#[derive(Debug, Clone)]
pub struct SentinelTopologyBuilder {
    server: ServerConfig,
    sentinel: SentinelConfig,
    host: String,
    server_ports: PortAllocator,
    sentinel_ports: PortAllocator,
    sentinel_count: usize,
    quorum: u32,
    groups: Vec<GroupRequest>,
}

impl Default for SentinelTopologyBuilder {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            sentinel: SentinelConfig::default(),
            host: "127.0.0.1".to_string(),
            server_ports: PortAllocator::sequential(DEFAULT_SERVER_PORT),
            sentinel_ports: PortAllocator::sequential(DEFAULT_SENTINEL_PORT),
            sentinel_count: 1,
            quorum: 1,
            groups: Vec::new(),
        }
    }
}

impl SentinelTopologyBuilder {
    /// Server and sentinel templates plus host taken from `settings`.
    pub fn with_settings(mut self, settings: &HarnessSettings) -> Result<Self> {
        self.server = ServerConfig::from_settings(settings)?;
        self.sentinel = SentinelConfig::from_settings(settings)?;
        self.host.clone_from(&settings.bind_host);
        Ok(self)
    }

    /// Template for every server. Port and replication are overridden.
    pub fn with_server_config(mut self, config: ServerConfig) -> Self {
        self.server = config;
        self
    }

    /// Template for every sentinel. Port and monitored groups are added.
    pub fn with_sentinel_config(mut self, config: SentinelConfig) -> Self {
        self.sentinel = config;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn sentinel_count(mut self, count: usize) -> Self {
        self.sentinel_count = count;
        self
    }

    pub fn sentinel_starting_port(mut self, port: u16) -> Self {
        self.sentinel_ports = PortAllocator::sequential(port);
        self
    }

    /// Uses exactly these sentinel ports, one sentinel each.
    pub fn sentinel_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.sentinel_ports = PortAllocator::predefined(ports);
        self.sentinel_count = self.sentinel_ports.remaining().unwrap_or(0);
        self
    }

    pub fn server_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.server_ports = PortAllocator::predefined(ports);
        self
    }

    pub fn ephemeral_sentinels(mut self) -> Self {
        self.sentinel_ports = PortAllocator::Ephemeral;
        self
    }

    pub fn ephemeral_servers(mut self) -> Self {
        self.server_ports = PortAllocator::Ephemeral;
        self
    }

    pub fn ephemeral(self) -> Self {
        self.ephemeral_sentinels().ephemeral_servers()
    }

    pub fn quorum_size(mut self, quorum: u32) -> Self {
        self.quorum = quorum;
        self
    }

    /// Adds a group named `name` with `replicas` replicas.
    pub fn replication_group(mut self, name: impl Into<String>, replicas: usize) -> Self {
        self.groups.push(GroupRequest {
            name: name.into(),
            replicas,
        });
        self
    }

    pub fn build(mut self) -> Result<SentinelTopology> {
        if self.sentinel_count == 0 {
            return Err(Error::InvalidTopology(
                "Sentinel topology requires at least one sentinel.".to_string(),
            ));
        }

        let mut groups = Vec::with_capacity(self.groups.len());
        for request in &self.groups {
            let primary = self.server_ports.next_port()?;
            let replicas = self.server_ports.take(request.replicas)?;
            groups.push(Arc::new(ReplicationGroup::build(
                request.name.clone(),
                &self.server,
                &self.host,
                primary,
                &replicas,
            )?));
        }

        let monitored = groups.iter().fold(self.sentinel.clone(), |config, group| {
            config.monitoring(group.name(), group.primary_port(), self.quorum)
        });

        let sentinels = self
            .sentinel_ports
            .take(self.sentinel_count)?
            .into_iter()
            .map(|port| monitored.clone().with_port(port).build().map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(SentinelTopology::new(sentinels, groups))
    }
}
