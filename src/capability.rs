//! Startup detection of whether the host filesystem accepts writes.
//!
//! Some hosting environments (containers, OpenVZ guests, locked-down images)
//! mount `/etc` and `/var/lib` read-only. Detection runs once; the resulting
//! [`FsCapability`] is passed to everything that would otherwise write there.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FsCapability {
    Writable,
    ReadOnly,
}

impl FsCapability {
    pub fn is_readonly(&self) -> bool {
        matches!(self, FsCapability::ReadOnly)
    }
}

impl fmt::Display for FsCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsCapability::Writable => f.write_str("writable"),
            FsCapability::ReadOnly => f.write_str("readonly"),
        }
    }
}

/// Operator override for detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemMode {
    #[default]
    Auto,
    Writable,
    #[serde(alias = "read-only")]
    Readonly,
}

impl FromStr for FilesystemMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(FilesystemMode::Auto),
            "writable" | "rw" => Ok(FilesystemMode::Writable),
            "readonly" | "read-only" | "ro" => Ok(FilesystemMode::Readonly),
            other => Err(format!("Unknown filesystem mode: {}", other)),
        }
    }
}

/// Where to probe for writability.
#[derive(Debug, Clone)]
pub struct CapabilityProbe {
    pub probe_dirs: Vec<PathBuf>,
    pub container_markers: Vec<PathBuf>,
}

impl Default for CapabilityProbe {
    fn default() -> Self {
        Self {
            probe_dirs: vec![
                PathBuf::from("/var/lib"),
                PathBuf::from("/etc"),
                PathBuf::from("/run"),
            ],
            container_markers: vec![PathBuf::from("/.dockerenv"), PathBuf::from("/proc/vz")],
        }
    }
}

impl CapabilityProbe {
    /// Try a create-write-delete cycle in every probe directory. Any failure,
    /// or any container marker being present, means read-only.
    pub fn detect(&self) -> FsCapability {
        for dir in &self.probe_dirs {
            let probe = dir.join(format!(".launchpad-rw-test-{}", std::process::id()));
            let result = std::fs::write(&probe, b"probe").and_then(|_| std::fs::remove_file(&probe));
            if let Err(e) = result {
                tracing::info!(dir = %dir.display(), error = %e, "filesystem probe failed, using read-only mode");
                return FsCapability::ReadOnly;
            }
        }
        if let Some(marker) = self.container_markers.iter().find(|m| m.exists()) {
            tracing::info!(marker = %marker.display(), "container environment detected, using read-only mode");
            return FsCapability::ReadOnly;
        }
        FsCapability::Writable
    }

    /// Apply an operator override, probing only in `auto` mode.
    pub fn resolve(&self, mode: FilesystemMode) -> FsCapability {
        match mode {
            FilesystemMode::Auto => self.detect(),
            FilesystemMode::Writable => FsCapability::Writable,
            FilesystemMode::Readonly => FsCapability::ReadOnly,
        }
    }
}
