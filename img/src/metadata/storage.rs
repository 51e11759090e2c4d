//! Snapshot record operations over an open [`Txn`].

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use img_shared::{ImgError, ImgResult};

use super::{Kind, Snapshot, SnapshotInfo, Txn, Usage, is_constraint_violation, sql_err};

const SELECT_INFO: &str = "
SELECT s.id, s.key, p.key, s.kind, s.labels, s.created_at, s.updated_at, s.size, s.inodes
FROM snapshots s LEFT JOIN snapshots p ON s.parent_id = p.id";

/// Columns of one snapshot row before validation.
struct RawRow {
    id: i64,
    key: String,
    parent: Option<String>,
    kind: i64,
    labels: String,
    created_at: String,
    updated_at: String,
    size: i64,
    inodes: i64,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            key: row.get(1)?,
            parent: row.get(2)?,
            kind: row.get(3)?,
            labels: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            size: row.get(7)?,
            inodes: row.get(8)?,
        })
    }

    fn into_record(self) -> ImgResult<Record> {
        let labels: BTreeMap<String, String> = serde_json::from_str(&self.labels)
            .map_err(|e| {
                ImgError::TransactionFailed(format!("corrupt labels for {}: {}", self.key, e))
            })?;
        Ok(Record {
            id: self.id,
            info: SnapshotInfo {
                name: self.key,
                parent: self.parent,
                kind: Kind::from_i64(self.kind)?,
                labels,
                created_at: parse_time(&self.created_at)?,
                updated_at: parse_time(&self.updated_at)?,
            },
            usage: Usage {
                size: self.size,
                inodes: self.inodes,
            },
        })
    }
}

/// A validated snapshot row.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: i64,
    pub info: SnapshotInfo,
    pub usage: Usage,
}

impl Record {
    pub fn id_string(&self) -> String {
        self.id.to_string()
    }
}

fn parse_time(value: &str) -> ImgResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ImgError::TransactionFailed(format!("corrupt timestamp {}: {}", value, e)))
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn encode_labels(labels: &BTreeMap<String, String>) -> ImgResult<String> {
    serde_json::to_string(labels)
        .map_err(|e| ImgError::Internal(format!("failed to encode labels: {}", e)))
}

fn parse_id(id: &str) -> ImgResult<i64> {
    id.parse::<i64>()
        .map_err(|_| ImgError::NotFound(format!("snapshot id {}", id)))
}

impl Txn<'_> {
    fn find(&self, key: &str) -> ImgResult<Option<Record>> {
        let sql = format!("{} WHERE s.key = ?1", SELECT_INFO);
        let raw = self
            .conn()
            .query_row(&sql, params![key], RawRow::from_row)
            .optional()
            .map_err(sql_err("query snapshot"))?;
        raw.map(RawRow::into_record).transpose()
    }

    fn find_by_id(&self, id: i64) -> ImgResult<Option<Record>> {
        let sql = format!("{} WHERE s.id = ?1", SELECT_INFO);
        let raw = self
            .conn()
            .query_row(&sql, params![id], RawRow::from_row)
            .optional()
            .map_err(sql_err("query snapshot"))?;
        raw.map(RawRow::into_record).transpose()
    }

    /// Look up a record by key, failing with `NotFound`.
    pub fn record(&self, key: &str) -> ImgResult<Record> {
        self.find(key)?
            .ok_or_else(|| ImgError::NotFound(format!("snapshot {}", key)))
    }

    /// Id, info and recorded usage of the snapshot under `key`.
    pub fn get_info(&self, key: &str) -> ImgResult<(String, SnapshotInfo, Usage)> {
        let record = self.record(key)?;
        Ok((record.id_string(), record.info, record.usage))
    }

    /// Active or view snapshot under `key`, with its ancestor ids.
    pub fn get_snapshot(&self, key: &str) -> ImgResult<Snapshot> {
        let record = self.record(key)?;
        if record.info.kind == Kind::Committed {
            return Err(ImgError::InvalidState(format!(
                "snapshot {} is committed, not active or view",
                key
            )));
        }
        Ok(Snapshot {
            id: record.id_string(),
            kind: record.info.kind,
            parent_ids: self.ancestor_ids(record.id)?,
        })
    }

    /// Create a new active or view record as a child of `parent`.
    pub fn create_snapshot(
        &self,
        kind: Kind,
        key: &str,
        parent: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> ImgResult<Snapshot> {
        self.require_writable()?;
        if kind == Kind::Committed {
            return Err(ImgError::InvalidState(format!(
                "snapshot {} cannot be created as committed",
                key
            )));
        }

        let parent_id = match parent {
            Some(parent) => {
                let record = self
                    .find(parent)?
                    .ok_or_else(|| ImgError::NotFound(format!("parent snapshot {}", parent)))?;
                if record.info.kind != Kind::Committed {
                    return Err(ImgError::InvalidState(format!(
                        "parent {} is not committed",
                        parent
                    )));
                }
                Some(record.id)
            }
            None => None,
        };

        let now = format_time(&Utc::now());
        let inserted = self.conn().execute(
            "INSERT INTO snapshots (key, parent_id, kind, labels, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![key, parent_id, kind.as_i64(), encode_labels(labels)?, now],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(ImgError::AlreadyExists(format!("snapshot {}", key)));
            }
            Err(e) => return Err(sql_err("insert snapshot")(e)),
        }

        let id = self.conn().last_insert_rowid();
        Ok(Snapshot {
            id: id.to_string(),
            kind,
            parent_ids: self.ancestor_ids(id)?,
        })
    }

    /// Update labels of an existing snapshot.
    ///
    /// Field paths are `labels` (replace all) or `labels.<key>` (set or
    /// delete one label). An empty list replaces all labels.
    pub fn update_info(&self, info: &SnapshotInfo, fieldpaths: &[&str]) -> ImgResult<SnapshotInfo> {
        self.require_writable()?;
        let record = self.record(&info.name)?;

        let mut labels = record.info.labels.clone();
        if fieldpaths.is_empty() {
            labels = info.labels.clone();
        } else {
            for path in fieldpaths {
                if *path == "labels" {
                    labels = info.labels.clone();
                } else if let Some(label) = path.strip_prefix("labels.") {
                    match info.labels.get(label) {
                        Some(value) => {
                            labels.insert(label.to_string(), value.clone());
                        }
                        None => {
                            labels.remove(label);
                        }
                    }
                } else {
                    return Err(ImgError::Config(format!(
                        "cannot update {} field on snapshot {}",
                        path, info.name
                    )));
                }
            }
        }

        let updated_at = Utc::now();
        self.conn()
            .execute(
                "UPDATE snapshots SET labels = ?1, updated_at = ?2 WHERE id = ?3",
                params![encode_labels(&labels)?, format_time(&updated_at), record.id],
            )
            .map_err(sql_err("update snapshot"))?;

        Ok(SnapshotInfo {
            labels,
            updated_at,
            ..record.info
        })
    }

    /// Turn the active snapshot `key` into the committed snapshot `name`.
    ///
    /// The store-assigned id is kept, so the caller can rename the backing
    /// directory from its active name to its committed name.
    pub fn commit_active(
        &self,
        key: &str,
        name: &str,
        usage: Usage,
        labels: &BTreeMap<String, String>,
    ) -> ImgResult<String> {
        self.require_writable()?;
        let record = self.record(key)?;
        if record.info.kind != Kind::Active {
            return Err(ImgError::InvalidState(format!(
                "snapshot {} is {}, not active",
                key, record.info.kind
            )));
        }
        if key != name && self.find(name)?.is_some() {
            return Err(ImgError::AlreadyExists(format!("snapshot {}", name)));
        }

        let mut merged = record.info.labels.clone();
        merged.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));

        let updated = self.conn().execute(
            "UPDATE snapshots
             SET key = ?1, kind = ?2, labels = ?3, updated_at = ?4, size = ?5, inodes = ?6
             WHERE id = ?7",
            params![
                name,
                Kind::Committed.as_i64(),
                encode_labels(&merged)?,
                format_time(&Utc::now()),
                usage.size,
                usage.inodes,
                record.id
            ],
        );
        match updated {
            Ok(_) => Ok(record.id_string()),
            Err(e) if is_constraint_violation(&e) => {
                Err(ImgError::AlreadyExists(format!("snapshot {}", name)))
            }
            Err(e) => Err(sql_err("commit snapshot")(e)),
        }
    }

    /// Delete the record for `key`. Fails with `HasChildren` while any
    /// snapshot still names it as parent.
    pub fn remove(&self, key: &str) -> ImgResult<Record> {
        self.require_writable()?;
        let record = self.record(key)?;

        let children = self.children_count(record.id)?;
        if children > 0 {
            return Err(ImgError::HasChildren(format!(
                "snapshot {} has {} child snapshot(s)",
                key, children
            )));
        }

        self.conn()
            .execute("DELETE FROM snapshots WHERE id = ?1", params![record.id])
            .map_err(sql_err("delete snapshot"))?;
        Ok(record)
    }

    /// Visit every committed snapshot in creation order. Errors returned by
    /// `f` abort the walk.
    pub fn walk_info(&self, mut f: impl FnMut(&SnapshotInfo) -> ImgResult<()>) -> ImgResult<()> {
        for record in self.records_of(Some(Kind::Committed))? {
            f(&record.info)?;
        }
        Ok(())
    }

    /// All records regardless of kind.
    pub fn records(&self) -> ImgResult<Vec<Record>> {
        self.records_of(None)
    }

    fn records_of(&self, kind: Option<Kind>) -> ImgResult<Vec<Record>> {
        let sql = match kind {
            Some(_) => format!("{} WHERE s.kind = ?1 ORDER BY s.id", SELECT_INFO),
            None => format!("{} ORDER BY s.id", SELECT_INFO),
        };
        let mut stmt = self
            .conn()
            .prepare(&sql)
            .map_err(sql_err("prepare snapshot listing"))?;
        let rows = match kind {
            Some(kind) => stmt.query_map(params![kind.as_i64()], RawRow::from_row),
            None => stmt.query_map([], RawRow::from_row),
        }
        .map_err(sql_err("list snapshots"))?;

        let mut records = Vec::new();
        for row in rows {
            let raw = row.map_err(sql_err("read snapshot row"))?;
            records.push(raw.into_record()?);
        }
        Ok(records)
    }

    /// Ancestors of snapshot `id` as (id, key) pairs, nearest first.
    ///
    /// Walks the parent links one row at a time, so arbitrarily deep
    /// histories cost no stack.
    pub fn parent_chain(&self, id: &str) -> ImgResult<Vec<(String, String)>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.parent_of(parse_id(id)?)?;

        while let Some(parent_id) = current {
            if !seen.insert(parent_id) {
                return Err(ImgError::TransactionFailed(format!(
                    "parent cycle detected at snapshot id {}",
                    parent_id
                )));
            }
            let record = self.find_by_id(parent_id)?.ok_or_else(|| {
                ImgError::TransactionFailed(format!("dangling parent id {}", parent_id))
            })?;
            chain.push((record.id_string(), record.info.name));
            current = self.parent_of(parent_id)?;
        }
        Ok(chain)
    }

    fn ancestor_ids(&self, id: i64) -> ImgResult<Vec<String>> {
        Ok(self
            .parent_chain(&id.to_string())?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    fn parent_of(&self, id: i64) -> ImgResult<Option<i64>> {
        self.conn()
            .query_row(
                "SELECT parent_id FROM snapshots WHERE id = ?1",
                params![id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
            .map_err(sql_err("query parent"))
            .map(Option::flatten)
    }

    /// Number of snapshots of any kind whose parent is `id`.
    pub fn children_count(&self, id: i64) -> ImgResult<i64> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM snapshots WHERE parent_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(sql_err("count children"))
    }

    /// Map of store id to key for every record.
    pub fn id_map(&self) -> ImgResult<HashMap<String, String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id, key FROM snapshots")
            .map_err(sql_err("prepare id map"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .map_err(sql_err("query id map"))?;

        let mut map = HashMap::new();
        for row in rows {
            let (id, key) = row.map_err(sql_err("read id map row"))?;
            map.insert(id.to_string(), key);
        }
        Ok(map)
    }
}
