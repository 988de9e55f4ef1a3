//! Executable lookup keyed by platform and Redis version.
//!
//! The table is a plain value: build it (or take [`ExecutableTable::bundled`]),
//! apply overrides, and hand it to the instance configs. Nothing here is
//! global.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Version used when none is configured.
pub const DEFAULT_VERSION: &str = "2.8";

/// Operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Os {
    Windows,
    /// Linux and other non-mac unixes.
    Unix,
    MacOs,
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    /// 32-bit x86.
    X86,
    X86_64,
    /// 64-bit ARM, including Apple silicon.
    Aarch64,
}

impl Arch {
    const ALL: [Arch; 3] = [Arch::X86, Arch::X86_64, Arch::Aarch64];
}

/// An (OS, architecture) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

impl Platform {
    pub const fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    /// Detects the platform this process was compiled for.
    pub fn detect() -> Result<Self> {
        Self::from_consts(std::env::consts::OS, std::env::consts::ARCH)
    }

    fn from_consts(os: &str, arch: &str) -> Result<Self> {
        let unsupported = || Error::UnsupportedPlatform {
            platform: format!("{os}/{arch}"),
            version: "-".to_string(),
        };
        let os = match os {
            "windows" => Os::Windows,
            "macos" => Os::MacOs,
            "linux" | "freebsd" | "netbsd" | "openbsd" | "solaris" | "aix" => Os::Unix,
            _ => return Err(unsupported()),
        };
        let arch = match arch {
            "x86" => Arch::X86,
            "x86_64" => Arch::X86_64,
            "aarch64" => Arch::Aarch64,
            _ => return Err(unsupported()),
        };
        Ok(Self { os, arch })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.os, self.arch)
    }
}

/// Lookup key: platform plus Redis version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutableKey {
    pub platform: Platform,
    pub version: String,
}

/// Immutable map from [`ExecutableKey`] to an executable path.
///
/// Relative entries are resolved against the resource directory when they
/// do not exist as given.
#[derive(Debug, Clone)]
pub struct ExecutableTable {
    version: String,
    resource_dir: Option<PathBuf>,
    entries: HashMap<ExecutableKey, PathBuf>,
}

impl ExecutableTable {
    /// An empty table for `version`.
    pub fn empty(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            resource_dir: None,
            entries: HashMap::new(),
        }
    }

    /// The bundled executable names for `version`.
    pub fn bundled(version: impl Into<String>) -> Self {
        use Arch::{X86, X86_64};
        use Os::{MacOs, Unix, Windows};

        let mut table = Self::empty(version);
        let bundled: [(Os, Arch, &str, &str); 10] = [
            (Windows, X86, "2.8", "redis-server-2.8.19.exe"),
            (Windows, X86_64, "2.8", "redis-server-2.8.19.exe"),
            (Unix, X86, "2.8", "redis-server-2.8.19-32"),
            (Unix, X86_64, "2.8", "redis-server-2.8.19"),
            (MacOs, X86, "2.8", "redis-server-2.8.19.app"),
            (MacOs, X86_64, "2.8", "redis-server-2.8.19.app"),
            (Unix, X86_64, "3.0", "redis-server-3.0.7"),
            (Unix, X86_64, "3.2", "redis-server-3.2.13"),
            (Unix, X86_64, "4.0", "redis-server-4.0.14"),
            (Unix, X86_64, "5.0", "redis-server-5.0.5"),
        ];
        for (os, arch, version, file) in bundled {
            table.entries.insert(
                ExecutableKey {
                    platform: Platform::new(os, arch),
                    version: version.to_string(),
                },
                PathBuf::from(file),
            );
        }
        table
    }

    /// Directory searched for relative entries.
    pub fn with_resource_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.resource_dir = Some(dir.into());
        self
    }

    /// Registers `path` for one platform at this table's version.
    pub fn with_override(mut self, os: Os, arch: Arch, path: impl Into<PathBuf>) -> Self {
        self.entries.insert(
            ExecutableKey {
                platform: Platform::new(os, arch),
                version: self.version.clone(),
            },
            path.into(),
        );
        self
    }

    /// Registers `path` for every architecture of `os`.
    pub fn with_override_all_arches(self, os: Os, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Arch::ALL
            .into_iter()
            .fold(self, |table, arch| table.with_override(os, arch, path.clone()))
    }

    /// The version this table resolves.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Looks up the entry for `platform` without touching the filesystem.
    pub fn lookup(&self, platform: Platform) -> Option<&Path> {
        self.entries
            .get(&ExecutableKey {
                platform,
                version: self.version.clone(),
            })
            .map(PathBuf::as_path)
    }

    /// Resolves the executable for `platform` to an existing file.
    pub fn resolve(&self, platform: Platform) -> Result<PathBuf> {
        let entry = self
            .lookup(platform)
            .ok_or_else(|| Error::UnsupportedPlatform {
                platform: platform.to_string(),
                version: self.version.clone(),
            })?;

        if entry.exists() {
            return Ok(std::path::absolute(entry)?);
        }
        if let Some(dir) = &self.resource_dir {
            let candidate = dir.join(entry);
            if candidate.exists() {
                return Ok(std::path::absolute(candidate)?);
            }
        }
        Err(Error::ExecutableNotFound(entry.to_path_buf()))
    }

    /// Resolves for the current platform.
    pub fn resolve_current(&self) -> Result<PathBuf> {
        self.resolve(Platform::detect()?)
    }
}

impl Default for ExecutableTable {
    fn default() -> Self {
        Self::bundled(DEFAULT_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LINUX_64: Platform = Platform::new(Os::Unix, Arch::X86_64);

    #[test]
    fn bundled_table_knows_versions() {
        let table = ExecutableTable::bundled("5.0");
        assert_eq!(
            table.lookup(LINUX_64),
            Some(Path::new("redis-server-5.0.5"))
        );
        assert!(table.lookup(Platform::new(Os::Windows, Arch::X86_64)).is_none());

        let default = ExecutableTable::default();
        assert_eq!(default.version(), "2.8");
        assert_eq!(
            default.lookup(Platform::new(Os::Windows, Arch::X86)),
            Some(Path::new("redis-server-2.8.19.exe"))
        );
    }

    #[test]
    fn unknown_platform_is_unsupported() {
        let table = ExecutableTable::bundled("4.0");
        let err = table
            .resolve(Platform::new(Os::MacOs, Arch::Aarch64))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedPlatform { ref version, .. } if version == "4.0"));
    }

    #[test]
    fn resolves_against_resource_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("redis-server-3.2.13"), b"").unwrap();

        let table = ExecutableTable::bundled("3.2").with_resource_dir(temp.path());
        let path = table.resolve(LINUX_64).unwrap();
        assert_eq!(path, temp.path().join("redis-server-3.2.13"));
    }

    #[test]
    fn missing_file_is_reported() {
        let table = ExecutableTable::bundled("3.0");
        let err = table.resolve(LINUX_64).unwrap_err();
        assert!(matches!(err, Error::ExecutableNotFound(p) if p == Path::new("redis-server-3.0.7")));
    }

    #[test]
    fn override_applies_to_every_arch() {
        let temp = TempDir::new().unwrap();
        let exe = temp.path().join("redis-server-custom");
        std::fs::write(&exe, b"").unwrap();

        let table = ExecutableTable::bundled("2.8").with_override_all_arches(Os::Unix, &exe);
        for arch in Arch::ALL {
            assert_eq!(table.resolve(Platform::new(Os::Unix, arch)).unwrap(), exe);
        }
        // Other OSes keep their bundled entries.
        assert_eq!(
            table.lookup(Platform::new(Os::MacOs, Arch::X86_64)),
            Some(Path::new("redis-server-2.8.19.app"))
        );
    }

    #[test]
    fn platform_detection_maps_consts() {
        assert_eq!(
            Platform::from_consts("linux", "x86_64").unwrap(),
            LINUX_64
        );
        assert_eq!(
            Platform::from_consts("macos", "aarch64").unwrap(),
            Platform::new(Os::MacOs, Arch::Aarch64)
        );
        assert!(Platform::from_consts("plan9", "x86_64").is_err());
        assert!(Platform::from_consts("linux", "riscv64").is_err());
    }
}
