//! Administrative RPC used while wiring a cluster together.
//!
//! The cluster topology talks to nodes only through [`ClusterConnector`]
//! and [`ClusterClient`], so the coordination protocol can be exercised
//! without real servers. [`RespConnector`] is the implementation backed
//! by [`AdminClient`].

use std::time::Duration;

use async_trait::async_trait;
use embedded_redis_wire::{AdminClient, WireError};

use crate::{Error, Result};

/// Health reported by `CLUSTER INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Ok,
    Fail,
}

/// Admin operations on one node.
#[async_trait]
pub trait ClusterClient: Send {
    async fn authenticate(&mut self, password: &str) -> Result<()>;

    /// `CLUSTER MEET host port`.
    async fn meet(&mut self, host: &str, port: u16) -> Result<()>;

    /// `CLUSTER ADDSLOTS` with every slot given.
    async fn add_slots(&mut self, slots: &[u16]) -> Result<()>;

    /// This node's cluster id.
    async fn node_id(&mut self) -> Result<String>;

    /// Whether this node's view of the cluster includes `node_id`.
    async fn knows_node(&mut self, node_id: &str) -> Result<bool>;

    /// `CLUSTER REPLICATE node_id`.
    async fn replicate_from(&mut self, node_id: &str) -> Result<()>;

    async fn cluster_state(&mut self) -> Result<ClusterState>;
}

/// Opens admin connections.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn ClusterClient>>;
}

/// Connects over TCP and speaks RESP.
#[derive(Debug, Clone)]
pub struct RespConnector {
    connect_timeout: Duration,
}

impl RespConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for RespConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl ClusterConnector for RespConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn ClusterClient>> {
        let client = AdminClient::connect_timeout(host, port, self.connect_timeout)
            .await
            .map_err(|source| Error::Rpc {
                peer: format!("{host}:{port}"),
                source,
            })?;
        Ok(Box::new(client))
    }
}

fn rpc(client: &AdminClient) -> impl FnOnce(WireError) -> Error + '_ {
    move |source| Error::Rpc {
        peer: client.peer().to_string(),
        source,
    }
}

#[async_trait]
impl ClusterClient for AdminClient {
    async fn authenticate(&mut self, password: &str) -> Result<()> {
        let res = self.auth(password).await;
        res.map_err(rpc(self))
    }

    async fn meet(&mut self, host: &str, port: u16) -> Result<()> {
        let res = self.cluster_meet(host, port).await;
        res.map_err(rpc(self))
    }

    async fn add_slots(&mut self, slots: &[u16]) -> Result<()> {
        let res = self.cluster_add_slots(slots).await;
        res.map_err(rpc(self))
    }

    async fn node_id(&mut self) -> Result<String> {
        let res = self.cluster_myid().await;
        res.map_err(rpc(self))
    }

    async fn knows_node(&mut self, node_id: &str) -> Result<bool> {
        let res = self.cluster_nodes().await;
        let nodes = res.map_err(rpc(self))?;
        Ok(nodes
            .lines()
            .any(|line| line.split_whitespace().next() == Some(node_id)))
    }

    async fn replicate_from(&mut self, node_id: &str) -> Result<()> {
        let res = self.cluster_replicate(node_id).await;
        res.map_err(rpc(self))
    }

    async fn cluster_state(&mut self) -> Result<ClusterState> {
        let res = self.cluster_info().await;
        let info = res.map_err(rpc(self))?;
        Ok(if info.is_ok() {
            ClusterState::Ok
        } else {
            ClusterState::Fail
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted connector that simulates cluster nodes in memory.

    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Shared simulated state: which nodes know which, and the call log.
    #[derive(Debug, Default)]
    pub struct FakeCluster {
        pub log: Mutex<Vec<String>>,
        known: Mutex<HashMap<u16, HashSet<String>>>,
        /// Number of `cluster_state` polls answered `fail` before `ok`.
        pub fail_polls: Mutex<usize>,
        /// Answer `fail` forever.
        pub never_converge: bool,
        /// Replicas learn about a met node only after this many polls.
        pub gossip_delay: usize,
        /// `cluster_state` never answers.
        pub hang_on_state: bool,
        polls: Mutex<HashMap<u16, usize>>,
    }

    impl FakeCluster {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn with(fail_polls: usize, never_converge: bool, gossip_delay: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_polls: Mutex::new(fail_polls),
                never_converge,
                gossip_delay,
                ..Self::default()
            })
        }

        /// Every node accepts admin calls but never answers `CLUSTER INFO`.
        pub fn hanging() -> Arc<Self> {
            Arc::new(Self {
                hang_on_state: true,
                ..Self::default()
            })
        }

        pub fn id_of(port: u16) -> String {
            format!("node-{port}")
        }

        pub fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    pub struct FakeClient {
        port: u16,
        cluster: Arc<FakeCluster>,
    }

    #[async_trait]
    impl ClusterClient for FakeClient {
        async fn authenticate(&mut self, password: &str) -> Result<()> {
            self.cluster.record(format!("{} auth {password}", self.port));
            Ok(())
        }

        async fn meet(&mut self, host: &str, port: u16) -> Result<()> {
            self.cluster.record(format!("{} meet {host}:{port}", self.port));
            self.cluster
                .known
                .lock()
                .unwrap()
                .entry(self.port)
                .or_default()
                .insert(FakeCluster::id_of(port));
            Ok(())
        }

        async fn add_slots(&mut self, slots: &[u16]) -> Result<()> {
            let (first, last) = (slots.first().copied(), slots.last().copied());
            self.cluster.record(format!(
                "{} addslots {}-{} ({})",
                self.port,
                first.unwrap_or_default(),
                last.unwrap_or_default(),
                slots.len()
            ));
            Ok(())
        }

        async fn node_id(&mut self) -> Result<String> {
            self.cluster.record(format!("{} myid", self.port));
            Ok(FakeCluster::id_of(self.port))
        }

        async fn knows_node(&mut self, node_id: &str) -> Result<bool> {
            let mut polls = self.cluster.polls.lock().unwrap();
            let count = polls.entry(self.port).or_default();
            *count += 1;
            let known = self
                .cluster
                .known
                .lock()
                .unwrap()
                .get(&self.port)
                .is_some_and(|ids| ids.contains(node_id));
            let visible = known && *count > self.cluster.gossip_delay;
            self.cluster
                .record(format!("{} knows {node_id} {visible}", self.port));
            Ok(visible)
        }

        async fn replicate_from(&mut self, node_id: &str) -> Result<()> {
            self.cluster
                .record(format!("{} replicate {node_id}", self.port));
            Ok(())
        }

        async fn cluster_state(&mut self) -> Result<ClusterState> {
            self.cluster.record(format!("{} state", self.port));
            if self.cluster.hang_on_state {
                futures::future::pending::<()>().await;
            }
            if self.cluster.never_converge {
                return Ok(ClusterState::Fail);
            }
            let mut remaining = self.cluster.fail_polls.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(ClusterState::Fail);
            }
            Ok(ClusterState::Ok)
        }
    }

    #[async_trait]
    impl ClusterConnector for Arc<FakeCluster> {
        async fn connect(&self, _host: &str, port: u16) -> Result<Box<dyn ClusterClient>> {
            Ok(Box::new(FakeClient {
                port,
                cluster: Arc::clone(self),
            }))
        }
    }
}
