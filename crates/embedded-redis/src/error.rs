//! Error types for embedded Redis topologies.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building, starting, or stopping instances and
/// topologies.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Instance builder misuse or failure while preparing a launch.
    #[error("Build error: {0}")]
    Build(String),

    /// Topology failed a construction-time check.
    #[error("{0}")]
    InvalidTopology(String),

    /// A port allocator has no ports left.
    #[error("Run out of Redis ports!")]
    PortsExhausted,

    /// No executable is registered for this platform and version.
    #[error("No Redis executable registered for {platform} (version {version})")]
    UnsupportedPlatform { platform: String, version: String },

    /// The resolved executable does not exist on disk.
    #[error("Redis executable not found at {0}")]
    ExecutableNotFound(PathBuf),

    /// Layered settings could not be loaded.
    #[error("Settings error: {0}")]
    Settings(String),

    /// `start()` called on an instance that is already running.
    #[error("Instance {0} is already running")]
    AlreadyRunning(String),

    /// The OS refused to launch the process.
    #[error("Failed to spawn {instance}: {source}")]
    ProcessSpawnFailed {
        instance: String,
        source: std::io::Error,
    },

    /// The ready stream ended before the ready pattern matched.
    #[error("Can't start {0}: process exited before becoming ready. Check logs for details.")]
    StartupStreamEnded(String),

    /// The ready pattern did not match within the configured bound.
    #[error("Instance {instance} not ready after {waited:?}")]
    ReadyTimeout { instance: String, waited: Duration },

    /// Waiting for the process to exit failed, so termination is unconfirmed.
    #[error("Stopping {instance} was interrupted: {source}")]
    StopInterrupted {
        instance: String,
        source: std::io::Error,
    },

    /// The cluster never reported a healthy state.
    #[error("Cluster did not converge within {elapsed:?}")]
    ConvergenceTimeout { elapsed: Duration },

    /// Administrative RPC to a node failed.
    #[error("RPC to {peer} failed: {source}")]
    Rpc {
        peer: String,
        source: embedded_redis_wire::WireError,
    },

    /// No topology manifest has been saved in this directory.
    #[error("No topology manifest in {0}")]
    ManifestNotFound(PathBuf),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Result type for embedded Redis operations.
pub type Result<T> = std::result::Result<T, Error>;
