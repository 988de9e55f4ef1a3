//! Hash-slot cluster coordinator.
//!
//! Startup protocol:
//!
//! 1. Start every master.
//! 2. Join masters in a ring: node `i` meets node `i + 1`, the last meets
//!    the first.
//! 3. Give each master its slot range and record its node id.
//! 4. Start the replicas. Each one meets its master, waits until gossip
//!    has made the master known to it, then replicates from it.
//! 5. Poll `CLUSTER INFO` on the first node until the state is `ok`.
//!
//! Nothing is retried. A failed step fails `start()` and leaves whatever
//! was already running for the caller to `stop()`.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::instance::ServerConfig;
use crate::manifest::{ManifestNode, NodeRole, TopologyKind, TopologyManifest};
use crate::ports::{DEFAULT_SERVER_PORT, PortAllocator};
use crate::process::ProcessHandle;
use crate::rpc::{ClusterClient, ClusterConnector, ClusterState, RespConnector};
use crate::settings::HarnessSettings;
use crate::slots::{self, SlotAllocation, SlotRange};
use crate::topology::Topology;
use crate::{Error, Result};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn settle(results: Vec<Result<()>>) -> Result<()> {
    results.into_iter().collect()
}

/// A slot-sharded Redis cluster.
pub struct SlotClusterTopology {
    nodes: Vec<Arc<ProcessHandle>>,
    allocation: SlotAllocation,
    node_ids: RwLock<Vec<Option<String>>>,
    connector: Arc<dyn ClusterConnector>,
    host: String,
    password: Option<String>,
    poll_interval: Duration,
    convergence_timeout: Option<Duration>,
    _scratch: Option<TempDir>,
}

impl fmt::Debug for SlotClusterTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotClusterTopology")
            .field("nodes", &self.nodes)
            .field("allocation", &self.allocation)
            .field("host", &self.host)
            .field("poll_interval", &self.poll_interval)
            .field("convergence_timeout", &self.convergence_timeout)
            .finish_non_exhaustive()
    }
}

impl SlotClusterTopology {
    /// Lays out `nodes` as masters and replicas. The first
    /// `len / (replicas_per_master + 1)` nodes become masters.
    pub fn new(
        nodes: Vec<Arc<ProcessHandle>>,
        replicas_per_master: usize,
        connector: Arc<dyn ClusterConnector>,
    ) -> Result<Self> {
        let allocation = SlotAllocation::compute(nodes.len(), replicas_per_master)?;
        Ok(Self {
            node_ids: RwLock::new(vec![None; nodes.len()]),
            nodes,
            allocation,
            connector,
            host: "127.0.0.1".to_string(),
            password: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            convergence_timeout: None,
            _scratch: None,
        })
    }

    /// Address nodes use to reach each other.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sent with `AUTH` on every admin connection.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound on the whole startup after masters are up. `None` waits
    /// forever.
    pub fn with_convergence_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.convergence_timeout = timeout;
        self
    }

    fn with_scratch(mut self, scratch: TempDir) -> Self {
        self._scratch = Some(scratch);
        self
    }

    pub fn allocation(&self) -> &SlotAllocation {
        &self.allocation
    }

    pub fn nodes(&self) -> &[Arc<ProcessHandle>] {
        &self.nodes
    }

    pub fn masters(&self) -> &[Arc<ProcessHandle>] {
        &self.nodes[..self.allocation.master_count()]
    }

    pub fn replicas(&self) -> &[Arc<ProcessHandle>] {
        &self.nodes[self.allocation.master_count()..]
    }

    /// Directory holding node state files, when the topology owns one.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self._scratch.as_ref().map(|d| d.path().to_path_buf())
    }

    /// Node id learned for master `index`. `None` before `start()` has
    /// assigned its slots.
    pub fn node_id(&self, index: usize) -> Option<String> {
        let ids = self.node_ids.read().unwrap_or_else(PoisonError::into_inner);
        ids.get(index).cloned().flatten()
    }

    fn set_node_id(&self, index: usize, id: Option<String>) {
        let mut ids = self.node_ids.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = ids.get_mut(index) {
            *slot = id;
        }
    }

    pub fn manifest(&self) -> TopologyManifest {
        let nodes = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| match self.allocation.master_of(i) {
                Some(master) => ManifestNode::new(node.name(), NodeRole::Replica, node.port())
                    .replicating(self.nodes[master].port()),
                None => {
                    let entry = ManifestNode::new(node.name(), NodeRole::Primary, node.port());
                    match self.allocation.slots_of(i) {
                        Some(range) => entry.owning(range),
                        None => entry,
                    }
                }
            })
            .collect();
        TopologyManifest::new(TopologyKind::Cluster, nodes)
    }

    async fn client(&self, index: usize) -> Result<Box<dyn ClusterClient>> {
        let port = self.nodes[index].port();
        let mut client = self.connector.connect(&self.host, port).await?;
        if let Some(password) = &self.password {
            client.authenticate(password).await?;
        }
        Ok(client)
    }

    fn check_deadline(&self, began: Instant) -> Result<()> {
        let elapsed = began.elapsed();
        match self.convergence_timeout {
            Some(limit) if elapsed >= limit => Err(Error::ConvergenceTimeout { elapsed }),
            _ => Ok(()),
        }
    }

    async fn meet_ring(&self) -> Result<()> {
        let masters = self.allocation.master_count();
        if masters < 2 {
            return Ok(());
        }
        for i in 0..masters {
            let peer = self.nodes[(i + 1) % masters].port();
            debug!(node = self.nodes[i].port(), peer, "cluster meet");
            self.client(i).await?.meet(&self.host, peer).await?;
        }
        Ok(())
    }

    async fn assign_slots(&self) -> Result<()> {
        for assignment in self.allocation.masters() {
            let SlotRange { start, end } = assignment.slots;
            let mut client = self.client(assignment.node).await?;
            debug!(node = self.nodes[assignment.node].port(), start, end, "adding slots");
            client.add_slots(&assignment.slots.slots()).await?;
            let id = client.node_id().await?;
            debug!(node = self.nodes[assignment.node].port(), id = %id, "master id");
            self.set_node_id(assignment.node, Some(id));
        }
        Ok(())
    }

    async fn attach_replica(&self, replica: usize, began: Instant) -> Result<()> {
        let master = self.allocation.master_of(replica).ok_or_else(|| {
            Error::InvalidTopology(format!("node {replica} is not a replica"))
        })?;
        let master_id = self.node_id(master).ok_or_else(|| {
            Error::InvalidTopology(format!("master {master} has no node id"))
        })?;
        let master_port = self.nodes[master].port();

        let mut client = self.client(replica).await?;
        debug!(node = self.nodes[replica].port(), master = master_port, "cluster meet");
        client.meet(&self.host, master_port).await?;

        while !client.knows_node(&master_id).await? {
            self.check_deadline(began)?;
            tokio::time::sleep(self.poll_interval).await;
        }

        debug!(node = self.nodes[replica].port(), master = %master_id, "replicating");
        client.replicate_from(&master_id).await
    }

    async fn await_convergence(&self, began: Instant) -> Result<()> {
        let mut client = self.client(0).await?;
        loop {
            let state = client.cluster_state().await?;
            debug!(?state, "cluster state");
            if state == ClusterState::Ok {
                info!(elapsed = ?began.elapsed(), "cluster converged");
                return Ok(());
            }
            self.check_deadline(began)?;
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl Topology for SlotClusterTopology {
    async fn start(&self) -> Result<()> {
        info!(
            nodes = self.nodes.len(),
            masters = self.allocation.master_count(),
            "starting cluster"
        );
        settle(join_all(self.masters().iter().map(|n| n.start())).await)?;

        let began = Instant::now();
        let converge = async {
            self.meet_ring().await?;
            self.assign_slots().await?;

            settle(join_all(self.replicas().iter().map(|n| n.start())).await)?;
            for replica in self.allocation.master_count()..self.nodes.len() {
                self.attach_replica(replica, began).await?;
            }

            self.await_convergence(began).await
        };

        // Also bounds an RPC to a node that accepted the connection but
        // never replies.
        match self.convergence_timeout {
            Some(limit) => tokio::time::timeout(limit, converge)
                .await
                .map_err(|_| Error::ConvergenceTimeout {
                    elapsed: began.elapsed(),
                })?,
            None => converge.await,
        }
    }

    async fn stop(&self) -> Result<()> {
        info!(nodes = self.nodes.len(), "stopping cluster");
        let replicas = settle(join_all(self.replicas().iter().map(|n| n.stop())).await);
        let masters = settle(join_all(self.masters().iter().map(|n| n.stop())).await);
        for i in 0..self.nodes.len() {
            self.set_node_id(i, None);
        }
        replicas.and(masters)
    }

    fn is_active(&self) -> bool {
        self.nodes.iter().all(|n| n.is_active())
    }

    fn ports(&self) -> Vec<u16> {
        self.nodes.iter().map(|n| n.port()).collect()
    }
}

/// Builder for [`SlotClusterTopology`] from a server template.
///
/// Each node gets cluster mode settings and its own directory inside a
/// scratch directory owned by the topology, so `nodes-<port>.conf` and
/// persistence files never leak between runs.
#[derive(Clone)]
pub struct ClusterConfig {
    server: ServerConfig,
    ports: PortAllocator,
    node_count: usize,
    replicas_per_master: usize,
    host: String,
    password: Option<String>,
    node_timeout_ms: u64,
    poll_interval: Duration,
    convergence_timeout: Option<Duration>,
    scratch_root: Option<PathBuf>,
    connector: Arc<dyn ClusterConnector>,
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("ports", &self.ports)
            .field("node_count", &self.node_count)
            .field("replicas_per_master", &self.replicas_per_master)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            ports: PortAllocator::sequential(DEFAULT_SERVER_PORT),
            node_count: 6,
            replicas_per_master: 1,
            host: "127.0.0.1".to_string(),
            password: None,
            node_timeout_ms: 2000,
            poll_interval: DEFAULT_POLL_INTERVAL,
            convergence_timeout: None,
            scratch_root: None,
            connector: Arc::new(RespConnector::default()),
        }
    }
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Template, host, timeouts and poll cadence taken from `settings`.
    pub fn from_settings(settings: &HarnessSettings) -> Result<Self> {
        Ok(Self {
            server: ServerConfig::from_settings(settings)?,
            host: settings.bind_host.clone(),
            node_timeout_ms: settings.cluster_node_timeout_ms,
            poll_interval: settings.poll_interval(),
            convergence_timeout: settings.convergence_timeout(),
            ..Self::default()
        })
    }

    pub fn with_server_config(mut self, config: ServerConfig) -> Self {
        self.server = config;
        self
    }

    pub fn with_node_count(mut self, count: usize) -> Self {
        self.node_count = count;
        self
    }

    pub fn with_replicas_per_master(mut self, replicas: usize) -> Self {
        self.replicas_per_master = replicas;
        self
    }

    pub fn with_starting_port(mut self, port: u16) -> Self {
        self.ports = PortAllocator::sequential(port);
        self
    }

    /// Uses exactly these ports, one node each.
    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports = PortAllocator::predefined(ports);
        self.node_count = self.ports.remaining().unwrap_or(0);
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ports = PortAllocator::Ephemeral;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets `requirepass`/`masterauth` on every node and authenticates
    /// admin connections.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_node_timeout_ms(mut self, ms: u64) -> Self {
        self.node_timeout_ms = ms;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_convergence_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.convergence_timeout = timeout;
        self
    }

    /// Parent directory for the scratch directory. Defaults to the system
    /// temp dir.
    pub fn with_scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(dir.into());
        self
    }

    /// Replaces the admin RPC implementation.
    pub fn with_connector(mut self, connector: Arc<dyn ClusterConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Config for the node on `port`, stored under `dir`.
    pub fn node_config(&self, port: u16, dir: PathBuf) -> ServerConfig {
        let mut config = self
            .server
            .clone()
            .with_port(port)
            .with_data_dir(dir)
            .with_setting("cluster-enabled yes")
            .with_setting(format!("cluster-config-file nodes-{port}.conf"))
            .with_setting(format!("cluster-node-timeout {}", self.node_timeout_ms))
            .with_setting("appendonly yes")
            .with_setting(format!("dbfilename dump-{port}.rdb"));
        if let Some(password) = &self.password {
            config = config
                .with_setting(format!("requirepass {password}"))
                .with_setting(format!("masterauth {password}"));
        }
        config
    }

    /// Validates the shape, allocates ports and builds every node.
    pub fn build(&self) -> Result<SlotClusterTopology> {
        slots::validate(self.node_count, self.replicas_per_master)?;

        let mut dir_builder = tempfile::Builder::new();
        dir_builder.prefix("embedded-redis-cluster");
        let scratch = match &self.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                dir_builder.tempdir_in(root)?
            }
            None => dir_builder.tempdir()?,
        };

        let mut ports = self.ports.clone();
        let nodes = ports
            .take(self.node_count)?
            .into_iter()
            .map(|port| {
                let dir = scratch.path().join(format!("node-{port}"));
                std::fs::create_dir_all(&dir)?;
                self.node_config(port, dir).build().map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut topology = SlotClusterTopology::new(
            nodes,
            self.replicas_per_master,
            Arc::clone(&self.connector),
        )?
        .with_host(self.host.clone())
        .with_poll_interval(self.poll_interval)
        .with_convergence_timeout(self.convergence_timeout)
        .with_scratch(scratch);
        if let Some(password) = &self.password {
            topology = topology.with_password(password.clone());
        }
        Ok(topology)
    }
}
