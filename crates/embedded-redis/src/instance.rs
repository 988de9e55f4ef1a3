//! Instance configuration: what to launch and how to tell it is ready.
//!
//! [`ServerConfig`] and [`SentinelConfig`] are plain values. Every
//! `build()` resolves the executable, writes a fresh config file when
//! inline settings are used, and returns a new [`ProcessHandle`]; the
//! config itself is never mutated by building.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use tempfile::TempPath;

use crate::exec::ExecutableTable;
use crate::ports::{DEFAULT_SENTINEL_PORT, DEFAULT_SERVER_PORT};
use crate::process::{LaunchSpec, ProcessHandle};
use crate::settings::HarnessSettings;
use crate::{Error, Result};

const SERVER_CONF_PREFIX: &str = "embedded-redis-server";
const SENTINEL_CONF_PREFIX: &str = "embedded-redis-sentinel";

const CONF_FILE_ALREADY_SET: &str = "Redis configuration is already set using redis conf file!";
const SETTINGS_ALREADY_SET: &str =
    "Redis configuration is already partially build using setting(String) method!";

/// What kind of process an instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    Server,
    Sentinel,
}

impl InstanceKind {
    /// Patterns that mark this kind as ready across server versions.
    pub fn default_ready_patterns(self) -> &'static [&'static str] {
        match self {
            // 2.x: "The server is now ready to accept connections on port"
            // 3.x+: "Ready to accept connections"
            InstanceKind::Server => &[r"(?i)ready to accept connections"],
            // older builds print "Sentinel runid is", newer "Sentinel ID is"
            InstanceKind::Sentinel => &[r"Sentinel (runid|ID) is"],
        }
    }

    fn label(self) -> &'static str {
        match self {
            InstanceKind::Server => "redis-server",
            InstanceKind::Sentinel => "redis-sentinel",
        }
    }
}

/// Regular expressions tested against each line of the ready stream.
/// Any match marks the instance ready.
#[derive(Debug, Clone)]
pub struct ReadyPatterns {
    patterns: Vec<Regex>,
}

impl ReadyPatterns {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                Regex::new(p.as_ref())
                    .map_err(|e| Error::Build(format!("invalid ready pattern {:?}: {e}", p.as_ref())))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// The built-in patterns for `kind`.
    pub fn for_kind(kind: InstanceKind) -> Self {
        let patterns = kind
            .default_ready_patterns()
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self { patterns }
    }

    /// Adds another accepted pattern.
    pub fn with_pattern(mut self, pattern: &str) -> Result<Self> {
        let re = Regex::new(pattern)
            .map_err(|e| Error::Build(format!("invalid ready pattern {pattern:?}: {e}")))?;
        self.patterns.push(re);
        Ok(self)
    }

    pub fn matches(&self, line: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(line))
    }
}

/// Executable path plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    argv: Vec<String>,
}

impl LaunchCommand {
    /// `argv[0]` is the executable.
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            return Err(Error::Build("launch command has no executable".to_string()));
        }
        Ok(Self { argv })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn program(&self) -> &Path {
        Path::new(&self.argv[0])
    }

    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    /// The executable's parent directory.
    pub fn working_dir(&self) -> Option<&Path> {
        self.program()
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// Value following `--port`, if present.
    pub fn port(&self) -> Option<u16> {
        self.flag_values("--port", 1)
            .and_then(|v| v[0].parse().ok())
    }

    /// `(host, port)` following `--slaveof`, if present.
    pub fn replica_of(&self) -> Option<(String, u16)> {
        let v = self.flag_values("--slaveof", 2)?;
        Some((v[0].clone(), v[1].parse().ok()?))
    }

    fn flag_values(&self, flag: &str, count: usize) -> Option<&[String]> {
        let at = self.argv.iter().position(|a| a == flag)?;
        self.argv.get(at + 1..at + 1 + count)
    }
}

/// Where the executable comes from.
#[derive(Debug, Clone)]
pub enum ExecutableSource {
    /// Resolve through a table for the current platform.
    Table(ExecutableTable),
    /// Use this path as is.
    Path(PathBuf),
}

impl ExecutableSource {
    fn resolve(&self) -> Result<PathBuf> {
        match self {
            ExecutableSource::Table(table) => table.resolve_current(),
            ExecutableSource::Path(path) => Ok(std::path::absolute(path)?),
        }
    }
}

impl Default for ExecutableSource {
    fn default() -> Self {
        ExecutableSource::Table(ExecutableTable::default())
    }
}

/// Either a user-supplied config file or inline lines written to a
/// generated one.
#[derive(Debug, Clone, Default)]
enum ConfigSource {
    #[default]
    None,
    File(PathBuf),
    Inline(Vec<String>),
}

/// Parts shared by server and sentinel configs.
#[derive(Debug, Clone)]
struct Common {
    executable: ExecutableSource,
    config: ConfigSource,
    misuse: Option<&'static str>,
    extra_ready: Vec<String>,
    ready_timeout: Option<Duration>,
    stop_grace: Duration,
}

impl Default for Common {
    fn default() -> Self {
        Self {
            executable: ExecutableSource::default(),
            config: ConfigSource::None,
            misuse: None,
            extra_ready: Vec::new(),
            ready_timeout: None,
            stop_grace: Duration::from_secs(1),
        }
    }
}

impl Common {
    fn from_settings(settings: &HarnessSettings) -> Result<Self> {
        Ok(Self {
            executable: ExecutableSource::Table(settings.executables()?),
            ready_timeout: settings.ready_timeout(),
            stop_grace: settings.stop_grace(),
            ..Self::default()
        })
    }

    fn config_file(&mut self, path: PathBuf) {
        match self.config {
            ConfigSource::Inline(_) => self.misuse = self.misuse.or(Some(SETTINGS_ALREADY_SET)),
            _ => self.config = ConfigSource::File(path),
        }
    }

    fn setting(&mut self, line: String) {
        match &mut self.config {
            ConfigSource::File(_) => self.misuse = self.misuse.or(Some(CONF_FILE_ALREADY_SET)),
            ConfigSource::Inline(lines) => lines.push(line),
            ConfigSource::None => self.config = ConfigSource::Inline(vec![line]),
        }
    }

    fn check(&self) -> Result<()> {
        match self.misuse {
            Some(msg) => Err(Error::Build(msg.to_string())),
            None => Ok(()),
        }
    }

    fn ready_patterns(&self, kind: InstanceKind) -> Result<ReadyPatterns> {
        self.extra_ready
            .iter()
            .try_fold(ReadyPatterns::for_kind(kind), |p, extra| p.with_pattern(extra))
    }
}

/// Writes `lines` to a temp file that is removed when the returned path drops.
fn write_config_file(prefix: &str, port: u16, lines: &[String]) -> Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix(&format!("{prefix}_{port}"))
        .suffix(".conf")
        .tempfile()?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    file.flush()?;
    Ok(file.into_temp_path())
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Configuration for a `redis-server` instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    common: Common,
    port: u16,
    slave_of: Option<(String, u16)>,
    data_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            common: Common::default(),
            port: DEFAULT_SERVER_PORT,
            slave_of: None,
            data_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executable, timeouts and ready bound taken from `settings`.
    pub fn from_settings(settings: &HarnessSettings) -> Result<Self> {
        Ok(Self {
            common: Common::from_settings(settings)?,
            ..Self::default()
        })
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.common.executable = ExecutableSource::Path(path.into());
        self
    }

    pub fn with_executables(mut self, table: ExecutableTable) -> Self {
        self.common.executable = ExecutableSource::Table(table);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Makes this server a replica of `host:port`.
    pub fn with_slave_of(mut self, host: impl Into<String>, port: u16) -> Self {
        self.slave_of = Some((host.into(), port));
        self
    }

    /// Passed as `--dir`, so persistence files land there.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Uses an existing config file. Cannot be mixed with [`Self::with_setting`].
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.common.config_file(path.into());
        self
    }

    /// Adds a line to the generated config file. Cannot be mixed with
    /// [`Self::with_config_file`].
    pub fn with_setting(mut self, line: impl Into<String>) -> Self {
        self.common.setting(line.into());
        self
    }

    /// Accepts an extra ready pattern, for builds with unusual banners.
    pub fn with_ready_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.common.extra_ready.push(pattern.into());
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.common.ready_timeout = Some(timeout);
        self
    }

    /// How long `stop()` waits after SIGTERM before killing the process.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.common.stop_grace = grace;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn slave_of(&self) -> Option<(&str, u16)> {
        self.slave_of.as_ref().map(|(h, p)| (h.as_str(), *p))
    }

    /// Assembles `[exe, conf?, --port n, --dir d?, --slaveof host port?]`.
    pub fn command(&self, executable: &Path, config_file: Option<&Path>) -> Result<LaunchCommand> {
        let mut argv = vec![path_arg(executable)];
        if let Some(conf) = config_file {
            argv.push(path_arg(conf));
        }
        argv.push("--port".to_string());
        argv.push(self.port.to_string());
        if let Some(dir) = &self.data_dir {
            argv.push("--dir".to_string());
            argv.push(path_arg(dir));
        }
        if let Some((host, port)) = &self.slave_of {
            argv.push("--slaveof".to_string());
            argv.push(host.clone());
            argv.push(port.to_string());
        }
        LaunchCommand::new(argv)
    }

    /// Builds a fresh, stopped handle.
    pub fn build(&self) -> Result<ProcessHandle> {
        self.common.check()?;
        let executable = self.common.executable.resolve()?;

        let (config_path, temp) = match &self.common.config {
            ConfigSource::None => (None, None),
            ConfigSource::File(path) => (Some(path.clone()), None),
            ConfigSource::Inline(lines) => {
                let temp = write_config_file(SERVER_CONF_PREFIX, self.port, lines)
                    .map_err(|e| Error::Build(format!("Could not build server instance: {e}")))?;
                (Some(temp.to_path_buf()), Some(temp))
            }
        };

        let command = self.command(&executable, config_path.as_deref())?;
        let spec = LaunchSpec {
            name: format!("{}:{}", InstanceKind::Server.label(), self.port),
            kind: InstanceKind::Server,
            command,
            ports: vec![self.port],
            ready: self.common.ready_patterns(InstanceKind::Server)?,
            ready_timeout: self.common.ready_timeout,
            stop_grace: self.common.stop_grace,
            config_file: temp,
        };
        Ok(ProcessHandle::new(spec))
    }
}

/// One replication group a sentinel watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredGroup {
    pub name: String,
    pub master_port: u16,
    pub quorum: u32,
}

/// Configuration for a `redis-server --sentinel` instance.
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    common: Common,
    port: u16,
    groups: Vec<MonitoredGroup>,
    down_after_ms: u64,
    failover_timeout_ms: u64,
    parallel_syncs: u32,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            common: Common::default(),
            port: DEFAULT_SENTINEL_PORT,
            groups: Vec::new(),
            down_after_ms: 60_000,
            failover_timeout_ms: 180_000,
            parallel_syncs: 1,
        }
    }
}

impl SentinelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &HarnessSettings) -> Result<Self> {
        Ok(Self {
            common: Common::from_settings(settings)?,
            ..Self::default()
        })
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.common.executable = ExecutableSource::Path(path.into());
        self
    }

    pub fn with_executables(mut self, table: ExecutableTable) -> Self {
        self.common.executable = ExecutableSource::Table(table);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Watches the group `name` whose primary listens on `master_port`.
    pub fn monitoring(mut self, name: impl Into<String>, master_port: u16, quorum: u32) -> Self {
        self.groups.push(MonitoredGroup {
            name: name.into(),
            master_port,
            quorum,
        });
        self
    }

    pub fn with_down_after_ms(mut self, ms: u64) -> Self {
        self.down_after_ms = ms;
        self
    }

    pub fn with_failover_timeout_ms(mut self, ms: u64) -> Self {
        self.failover_timeout_ms = ms;
        self
    }

    pub fn with_parallel_syncs(mut self, n: u32) -> Self {
        self.parallel_syncs = n;
        self
    }

    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.common.config_file(path.into());
        self
    }

    pub fn with_setting(mut self, line: impl Into<String>) -> Self {
        self.common.setting(line.into());
        self
    }

    pub fn with_ready_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.common.extra_ready.push(pattern.into());
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.common.ready_timeout = Some(timeout);
        self
    }

    /// How long `stop()` waits after SIGTERM before killing the process.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.common.stop_grace = grace;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn groups(&self) -> &[MonitoredGroup] {
        &self.groups
    }

    /// Lines of the generated sentinel config. Without explicit groups or
    /// inline settings the default `mymaster` group on 6379 is watched.
    pub fn config_lines(&self) -> Vec<String> {
        let inline = match &self.common.config {
            ConfigSource::Inline(lines) => lines.clone(),
            _ => Vec::new(),
        };

        let default_group;
        let groups = if self.groups.is_empty() && inline.is_empty() {
            default_group = [MonitoredGroup {
                name: "mymaster".to_string(),
                master_port: DEFAULT_SERVER_PORT,
                quorum: 1,
            }];
            &default_group[..]
        } else {
            &self.groups[..]
        };

        let mut lines = Vec::new();
        for g in groups {
            lines.push(format!(
                "sentinel monitor {} 127.0.0.1 {} {}",
                g.name, g.master_port, g.quorum
            ));
            lines.push(format!(
                "sentinel down-after-milliseconds {} {}",
                g.name, self.down_after_ms
            ));
            lines.push(format!(
                "sentinel failover-timeout {} {}",
                g.name, self.failover_timeout_ms
            ));
            lines.push(format!(
                "sentinel parallel-syncs {} {}",
                g.name, self.parallel_syncs
            ));
        }
        lines.extend(inline);
        lines.push(format!("port {}", self.port));
        lines
    }

    /// Assembles `[exe, conf, --sentinel, --port n]`.
    pub fn command(&self, executable: &Path, config_file: &Path) -> Result<LaunchCommand> {
        LaunchCommand::new(vec![
            path_arg(executable),
            path_arg(config_file),
            "--sentinel".to_string(),
            "--port".to_string(),
            self.port.to_string(),
        ])
    }

    pub fn build(&self) -> Result<ProcessHandle> {
        self.common.check()?;
        let executable = self.common.executable.resolve()?;

        // Sentinel rewrites its config file, so it always gets one.
        let (config_path, temp) = match &self.common.config {
            ConfigSource::File(path) => (path.clone(), None),
            ConfigSource::None | ConfigSource::Inline(_) => {
                let temp = write_config_file(SENTINEL_CONF_PREFIX, self.port, &self.config_lines())
                    .map_err(|e| Error::Build(format!("Could not build sentinel instance: {e}")))?;
                (temp.to_path_buf(), Some(temp))
            }
        };

        let command = self.command(&executable, &config_path)?;
        let spec = LaunchSpec {
            name: format!("{}:{}", InstanceKind::Sentinel.label(), self.port),
            kind: InstanceKind::Sentinel,
            command,
            ports: vec![self.port],
            ready: self.common.ready_patterns(InstanceKind::Sentinel)?,
            ready_timeout: self.common.ready_timeout,
            stop_grace: self.common.stop_grace,
            config_file: temp,
        };
        Ok(ProcessHandle::new(spec))
    }
}
