use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use img_shared::{ImgError, ImgResult};

/// Snapshot kind.
///
/// Stored as an integer in the metadata database, so the discriminants are
/// part of the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Read-only, ephemeral.
    View = 1,
    /// Writable, in progress.
    Active = 2,
    /// Persisted and immutable.
    Committed = 3,
}

impl Kind {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> ImgResult<Self> {
        match value {
            1 => Ok(Kind::View),
            2 => Ok(Kind::Active),
            3 => Ok(Kind::Committed),
            other => Err(ImgError::TransactionFailed(format!(
                "unknown snapshot kind {} in metadata store",
                other
            ))),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::View => write!(f, "view"),
            Kind::Active => write!(f, "active"),
            Kind::Committed => write!(f, "committed"),
        }
    }
}

/// Public view of a snapshot record, addressed by key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Key for active/view snapshots, name for committed ones.
    pub name: String,
    /// Key of the parent snapshot, if any.
    pub parent: Option<String>,
    pub kind: Kind,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SnapshotInfo {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            parent: None,
            kind: Kind::Active,
            labels: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Internal view of a snapshot: store-assigned id plus the ids of every
/// ancestor, nearest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub kind: Kind,
    pub parent_ids: Vec<String>,
}

/// Disk usage of a snapshot directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of inodes, each hard-linked inode counted once.
    pub inodes: i64,
    /// Bytes used by regular file contents.
    pub size: i64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.inodes += other.inodes;
        self.size += other.size;
    }
}
