//! Embedded Redis for integration tests.
//!
//! Launches real `redis-server` processes and wires them into topologies:
//! - Single servers and sentinels ([`ProcessHandle`])
//! - Primary/replica groups ([`ReplicationGroup`])
//! - Sentinels watching replication groups ([`SentinelTopology`])
//! - Hash-slot clusters ([`SlotClusterTopology`])
//!
//! Every topology implements [`Topology`]. `start()` returns once every
//! process has printed its ready banner (and, for clusters, once the
//! cluster reports a healthy state); `stop()` returns once every process
//! has exited.
//!
//! ```no_run
//! use embedded_redis::{ClusterConfig, HarnessSettings, Topology};
//!
//! # async fn run() -> embedded_redis::Result<()> {
//! let settings = HarnessSettings::load()?;
//! let cluster = ClusterConfig::from_settings(&settings)?
//!     .with_starting_port(7000)
//!     .build()?;
//!
//! cluster.start().await?;
//! // ... point a cluster client at cluster.ports() ...
//! cluster.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Child processes are killed if their handle is dropped while running.

pub mod cluster;
pub mod error;
pub mod exec;
pub mod instance;
pub mod manifest;
pub mod ports;
pub mod process;
pub mod replication;
pub mod rpc;
pub mod sentinel;
pub mod settings;
pub mod slots;
pub mod topology;

pub use cluster::{ClusterConfig, SlotClusterTopology};
pub use error::{Error, Result};
pub use exec::{Arch, ExecutableKey, ExecutableTable, Os, Platform};
pub use instance::{
    ExecutableSource, InstanceKind, LaunchCommand, MonitoredGroup, ReadyPatterns, SentinelConfig,
    ServerConfig,
};
pub use manifest::{ManifestNode, NodeRole, TopologyKind, TopologyManifest};
pub use ports::{PortAllocator, host_strings};
pub use process::{ProcessHandle, ProcessState};
pub use replication::ReplicationGroup;
pub use rpc::{ClusterClient, ClusterConnector, ClusterState, RespConnector};
pub use sentinel::{SentinelTopology, SentinelTopologyBuilder};
pub use settings::{HarnessSettings, SettingsLoader};
pub use slots::{CLUSTER_HASH_SLOTS, SlotAllocation, SlotRange};
pub use topology::{AggregateTopology, Topology};

/// Builds and starts a standalone server on `port`.
pub async fn start_server(settings: &HarnessSettings, port: u16) -> Result<ProcessHandle> {
    let server = ServerConfig::from_settings(settings)?.with_port(port).build()?;
    server.start().await?;
    Ok(server)
}

/// Builds and starts a cluster. On failure the partly started nodes are
/// killed when the topology is dropped.
pub async fn start_cluster(config: &ClusterConfig) -> Result<SlotClusterTopology> {
    let cluster = config.build()?;
    cluster.start().await?;
    Ok(cluster)
}
