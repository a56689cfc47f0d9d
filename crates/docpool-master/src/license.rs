//! License Source
//!
//! Reads the license descriptor from disk and detects file changes.
//!
//! The license file is JSON:
//!
//! ```json
//! {"count": 8, "type": "enterprise"}
//! ```
//!
//! `count` is either a non-negative integer (maximum permitted workers) or
//! the string `"unlimited"`. `type` is an opaque tier token forwarded to
//! workers as-is.
//!
//! Change detection is stat polling (mtime + length) on a short cadence; the
//! controller additionally re-reads on a long periodic timer, so a missed
//! poll only delays a reload, never loses it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Errors from reading the license file. All of these are recovered locally:
/// the controller keeps its previous snapshot and logs a warning.
#[derive(Error, Debug)]
pub enum LicenseError {
    #[error("failed to read license file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed license file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid license count {value:?} in {path} (expected a non-negative integer or \"unlimited\")")]
    InvalidCount { path: PathBuf, value: String },
}

/// Maximum permitted worker count from the license.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseCount {
    /// At most this many workers.
    Limited(u64),
    /// No license-imposed limit; capacity is bounded by CPU count only.
    Unlimited,
}

impl std::fmt::Display for LicenseCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LicenseCount::Limited(n) => write!(f, "{}", n),
            LicenseCount::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// Immutable license snapshot. Replaced wholesale on each successful reload,
/// never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseInfo {
    /// Maximum permitted worker count.
    pub count: LicenseCount,
    /// Opaque tier token, broadcast to workers.
    pub tier: String,
}

impl LicenseInfo {
    /// Zero-capacity placeholder used before the first successful read.
    pub fn empty() -> Self {
        Self {
            count: LicenseCount::Limited(0),
            tier: String::new(),
        }
    }
}

/// Raw wire shape of the license file.
#[derive(Debug, Deserialize)]
struct RawLicense {
    count: RawCount,
    #[serde(rename = "type")]
    tier: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCount {
    Number(u64),
    Text(String),
}

/// Supplies license snapshots on demand. Abstracted as a trait so the
/// controller is testable with a scripted source.
pub trait LicenseSource {
    fn read(&mut self) -> Result<LicenseInfo, LicenseError>;
}

/// License source backed by a JSON file on disk.
#[derive(Debug)]
pub struct FileLicenseSource {
    path: PathBuf,
}

impl FileLicenseSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LicenseSource for FileLicenseSource {
    fn read(&mut self) -> Result<LicenseInfo, LicenseError> {
        let content = fs::read_to_string(&self.path).map_err(|source| LicenseError::Io {
            path: self.path.clone(),
            source,
        })?;

        let raw: RawLicense =
            serde_json::from_str(&content).map_err(|source| LicenseError::Malformed {
                path: self.path.clone(),
                source,
            })?;

        let count = match raw.count {
            RawCount::Number(n) => LicenseCount::Limited(n),
            RawCount::Text(s) if s.eq_ignore_ascii_case("unlimited") => LicenseCount::Unlimited,
            RawCount::Text(s) => {
                return Err(LicenseError::InvalidCount {
                    path: self.path.clone(),
                    value: s,
                })
            }
        };

        Ok(LicenseInfo {
            count,
            tier: raw.tier,
        })
    }
}

/// Fingerprint of the watched file at the last poll.
type FileStamp = Option<(SystemTime, u64)>;

/// Stat-polling change detector for the license file.
///
/// Bursts of writes may coalesce into one trigger or fire more than once;
/// reload handling is idempotent to duplicates, so either is fine.
#[derive(Debug)]
pub struct LicenseWatcher {
    path: PathBuf,
    last: FileStamp,
}

impl LicenseWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last = Self::stamp(&path);
        Self { path, last }
    }

    /// Poll the file; returns true when it changed since the previous poll.
    /// A file appearing or disappearing counts as a change.
    pub fn poll_changed(&mut self) -> bool {
        let current = Self::stamp(&self.path);
        if current != self.last {
            debug!("license file {} changed on disk", self.path.display());
            self.last = current;
            true
        } else {
            false
        }
    }

    fn stamp(path: &Path) -> FileStamp {
        let meta = fs::metadata(path).ok()?;
        let mtime = meta.modified().ok()?;
        Some((mtime, meta.len()))
    }
}
