//! A primary with zero or more replicas.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::info;

use crate::instance::ServerConfig;
use crate::manifest::{ManifestNode, NodeRole};
use crate::process::ProcessHandle;
use crate::topology::Topology;
use crate::{Error, Result};

/// A named primary server and the replicas following it.
///
/// The primary starts before any replica and stops after all of them.
#[derive(Debug)]
pub struct ReplicationGroup {
    name: String,
    primary: Arc<ProcessHandle>,
    replicas: Vec<Arc<ProcessHandle>>,
}

impl ReplicationGroup {
    /// Groups existing handles. Every replica's launch command must
    /// replicate from the primary's port.
    pub fn new(
        name: impl Into<String>,
        primary: Arc<ProcessHandle>,
        replicas: Vec<Arc<ProcessHandle>>,
    ) -> Result<Self> {
        let name = name.into();
        let primary_port = primary.port();
        for replica in &replicas {
            match replica.command().replica_of() {
                Some((_, port)) if port == primary_port => {}
                _ => {
                    return Err(Error::InvalidTopology(format!(
                        "replica {} of group {name} does not replicate from primary port {primary_port}",
                        replica.name()
                    )));
                }
            }
        }
        Ok(Self {
            name,
            primary,
            replicas,
        })
    }

    /// Builds a primary on `primary_port` and one replica per entry of
    /// `replica_ports`, all from `template`.
    pub fn build(
        name: impl Into<String>,
        template: &ServerConfig,
        host: &str,
        primary_port: u16,
        replica_ports: &[u16],
    ) -> Result<Self> {
        let primary = Arc::new(template.clone().with_port(primary_port).build()?);
        let replicas = replica_ports
            .iter()
            .map(|&port| {
                template
                    .clone()
                    .with_port(port)
                    .with_slave_of(host, primary_port)
                    .build()
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(name, primary, replicas)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary(&self) -> &Arc<ProcessHandle> {
        &self.primary
    }

    pub fn replicas(&self) -> &[Arc<ProcessHandle>] {
        &self.replicas
    }

    pub fn primary_port(&self) -> u16 {
        self.primary.port()
    }

    /// Manifest entries for the primary and its replicas.
    pub fn manifest_nodes(&self) -> Vec<ManifestNode> {
        let primary_port = self.primary_port();
        std::iter::once(
            ManifestNode::new(self.primary.name(), NodeRole::Primary, primary_port)
                .in_group(&self.name),
        )
        .chain(self.replicas.iter().map(|r| {
            ManifestNode::new(r.name(), NodeRole::Replica, r.port())
                .in_group(&self.name)
                .replicating(primary_port)
        }))
        .collect()
    }
}

#[async_trait]
impl Topology for ReplicationGroup {
    async fn start(&self) -> Result<()> {
        info!(group = %self.name, replicas = self.replicas.len(), "starting replication group");
        self.primary.start().await?;
        join_all(self.replicas.iter().map(|r| r.start()))
            .await
            .into_iter()
            .collect()
    }

    async fn stop(&self) -> Result<()> {
        info!(group = %self.name, "stopping replication group");
        let replicas: Result<()> = join_all(self.replicas.iter().map(|r| r.stop()))
            .await
            .into_iter()
            .collect();
        let primary = self.primary.stop().await;
        replicas.and(primary)
    }

    fn is_active(&self) -> bool {
        self.primary.is_active() && self.replicas.iter().all(|r| r.is_active())
    }

    fn ports(&self) -> Vec<u16> {
        std::iter::once(self.primary.port())
            .chain(self.replicas.iter().map(|r| r.port()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> ServerConfig {
        ServerConfig::new().with_executable("/bin/sh")
    }

    #[test]
    fn build_points_replicas_at_primary() {
        let group = ReplicationGroup::build("mymaster", &template(), "127.0.0.1", 6379, &[6380, 6381]).unwrap();

        assert_eq!(group.ports(), vec![6379, 6380, 6381]);
        for replica in group.replicas() {
            assert_eq!(
                replica.command().replica_of(),
                Some(("127.0.0.1".to_string(), 6379))
            );
        }
        assert_eq!(group.primary().command().replica_of(), None);
    }

    #[test]
    fn mismatched_replica_is_rejected() {
        let primary = Arc::new(template().with_port(6379).build().unwrap());
        let stray = Arc::new(
            template()
                .with_port(6380)
                .with_slave_of("127.0.0.1", 7000)
                .build()
                .unwrap(),
        );
        let err = ReplicationGroup::new("g", primary, vec![stray]).unwrap_err();
        assert!(matches!(err, Error::InvalidTopology(_)));
    }

    #[test]
    fn manifest_lists_roles() {
        let group = ReplicationGroup::build("g", &template(), "127.0.0.1", 7000, &[7001]).unwrap();
        let nodes = group.manifest_nodes();
        assert_eq!(nodes[0].role, NodeRole::Primary);
        assert_eq!(nodes[1].replica_of, Some(7000));
        assert_eq!(nodes[1].group.as_deref(), Some("g"));
    }

    #[test]
    fn fresh_group_is_inactive() {
        let group = ReplicationGroup::build("g", &template(), "127.0.0.1", 7000, &[]).unwrap();
        assert!(!group.is_active());
        assert_eq!(group.ports(), vec![7000]);
    }
}
