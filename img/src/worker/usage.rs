use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use img_shared::{ImgError, ImgResult};

use crate::metadata::{Kind, Record};

/// Label holding the human readable origin of a snapshot.
pub const DESCRIPTION_LABEL: &str = "img.description";

/// One row of `du` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub parent: Option<String>,
    /// Still being written (active).
    pub mutable: bool,
    /// Other snapshots are built on top of this one.
    pub in_use: bool,
    pub size: i64,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    pub(super) fn from_record(record: &Record, in_use: bool, size: i64) -> Self {
        Self {
            id: record.info.name.clone(),
            parent: record.info.parent.clone(),
            mutable: record.info.kind == Kind::Active,
            in_use,
            size,
            description: record.info.labels.get(DESCRIPTION_LABEL).cloned(),
            created_at: record.info.created_at,
        }
    }

    /// Safe to delete: nothing depends on it and it is not being written.
    pub fn reclaimable(&self) -> bool {
        !self.in_use && !self.mutable
    }
}

/// Keys of every snapshot that is some other snapshot's parent.
pub(super) fn parents(records: &[Record]) -> HashSet<&str> {
    records
        .iter()
        .filter_map(|r| r.info.parent.as_deref())
        .collect()
}

/// Conjunction of `key=value` filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageFilter {
    id: Option<String>,
    parent: Option<String>,
    mutable: Option<bool>,
    reclaimable: Option<bool>,
}

impl UsageFilter {
    /// Parse `id=`, `parent=`, `mutable=` and `reclaimable=` filters.
    pub fn parse<S: AsRef<str>>(filters: &[S]) -> ImgResult<Self> {
        let mut filter = Self::default();
        for raw in filters {
            let raw = raw.as_ref();
            let (key, value) = raw
                .split_once('=')
                .ok_or_else(|| ImgError::Config(format!("invalid filter {:?}", raw)))?;
            match key.trim() {
                "id" => filter.id = Some(value.to_string()),
                "parent" => filter.parent = Some(value.to_string()),
                "mutable" => filter.mutable = Some(parse_bool(raw, value)?),
                "reclaimable" => filter.reclaimable = Some(parse_bool(raw, value)?),
                other => {
                    return Err(ImgError::Config(format!("unknown filter key {:?}", other)));
                }
            }
        }
        Ok(filter)
    }

    pub fn reclaimable() -> Self {
        Self {
            reclaimable: Some(true),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &UsageRecord) -> bool {
        self.id.as_ref().is_none_or(|id| *id == record.id)
            && self
                .parent
                .as_ref()
                .is_none_or(|p| record.parent.as_ref() == Some(p))
            && self.mutable.is_none_or(|m| m == record.mutable)
            && self.reclaimable.is_none_or(|r| r == record.reclaimable())
    }
}

fn parse_bool(raw: &str, value: &str) -> ImgResult<bool> {
    value
        .trim()
        .parse()
        .map_err(|_| ImgError::Config(format!("invalid boolean in filter {:?}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, parent: Option<&str>, mutable: bool, in_use: bool) -> UsageRecord {
        UsageRecord {
            id: id.into(),
            parent: parent.map(Into::into),
            mutable,
            in_use,
            size: 0,
            description: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_parse_filters() {
        let filter = UsageFilter::parse(&["id=a", "mutable=false"]).unwrap();
        assert!(filter.matches(&record("a", None, false, true)));
        assert!(!filter.matches(&record("a", None, true, true)));
        assert!(!filter.matches(&record("b", None, false, true)));
    }

    #[test]
    fn test_parent_and_reclaimable() {
        let filter = UsageFilter::parse(&["parent=base", "reclaimable=true"]).unwrap();
        assert!(filter.matches(&record("x", Some("base"), false, false)));
        assert!(!filter.matches(&record("x", Some("base"), false, true)));
        assert!(!filter.matches(&record("x", None, false, false)));
        assert_eq!(UsageFilter::reclaimable(), UsageFilter::parse(&["reclaimable=true"]).unwrap());
    }

    #[test]
    fn test_invalid_filters() {
        assert!(matches!(UsageFilter::parse(&["id"]), Err(ImgError::Config(_))));
        assert!(matches!(UsageFilter::parse(&["size=1"]), Err(ImgError::Config(_))));
        assert!(matches!(
            UsageFilter::parse(&["mutable=maybe"]),
            Err(ImgError::Config(_))
        ));
    }
}
