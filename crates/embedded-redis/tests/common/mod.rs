//! Shared fixtures: executable shell scripts standing in for Redis.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Prints a 2.8-style banner and idles until killed.
pub const OLD_SERVER: &str = r#"
echo "[$$] * Server started, Redis version 2.8.19"
echo "[$$] * The server is now ready to accept connections on port 6379"
exec sleep 60
"#;

/// Prints a 5.x-style banner and idles until killed.
pub const NEW_SERVER: &str = r#"
echo "1:C * oO0OoO0OoO0Oo Redis is starting oO0OoO0OoO0Oo"
echo "1:M * Server initialized"
echo "1:M * Ready to accept connections"
exec sleep 60
"#;

pub const SENTINEL: &str = r#"
echo "1:X * Running mode=sentinel, port 26379."
echo "1:X # Sentinel ID is 5f2b1c0d9e8a"
exec sleep 60
"#;

/// Exits before printing anything that looks ready.
pub const CRASHING: &str = r#"
echo "1:M * Server initialized"
echo "1:M # Can't open the log file: Permission denied" >&2
exit 1
"#;

/// Never prints a ready line but keeps running.
pub const SILENT: &str = "exec sleep 60\n";

/// Floods stderr well past a pipe buffer before becoming ready.
pub const CHATTY: &str = r#"
i=0
while [ $i -lt 20000 ]; do
  echo "1:M # warning line number $i" >&2
  i=$((i+1))
done
echo "1:M * Ready to accept connections"
exec sleep 60
"#;

/// Records each launch in `spawns` next to the script, then becomes
/// ready after a short delay.
pub const COUNTING: &str = r#"
echo started >> "$(dirname "$0")/spawns"
sleep 0.3
echo "1:M * Ready to accept connections"
exec sleep 60
"#;

/// Writes `shutdown` next to the script when asked to terminate.
pub const GRACEFUL: &str = r#"
trap 'echo clean > "$(dirname "$0")/shutdown"; exit 0' TERM
echo "1:M * Ready to accept connections"
while true; do sleep 0.1; done
"#;

/// Ignores SIGTERM.
pub const STUBBORN: &str = r#"
trap '' TERM
echo "1:M * Ready to accept connections"
while true; do sleep 0.1; done
"#;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Writes `body` as an executable `/bin/sh` script.
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A temp dir holding one script.
pub fn fixture(body: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = script(dir.path(), "redis-server", body);
    (dir, path)
}
