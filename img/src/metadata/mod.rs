//! Transactional snapshot metadata store.
//!
//! Snapshot records live in a SQLite database (`metadata.db`) opened in WAL
//! mode. Write transactions go through a single writer connection and are
//! therefore serialized; read transactions use connections from a small pool
//! and only ever observe committed state, so they run concurrently with an
//! in-flight writer.
//!
//! ```text
//! MetaStore::update() ──► writer: Mutex<Connection> ──► BEGIN IMMEDIATE
//! MetaStore::view()   ──► readers: pool            ──► BEGIN DEFERRED
//! ```

mod storage;
mod types;

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, ErrorCode, OpenFlags};

use img_shared::{ImgError, ImgResult};

pub use storage::Record;
pub use types::{Kind, Snapshot, SnapshotInfo, Usage};

/// Readers kept around between read transactions.
const MAX_IDLE_READERS: usize = 4;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS snapshots (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    key         TEXT NOT NULL UNIQUE,
    parent_id   INTEGER NULL REFERENCES snapshots(id),
    kind        INTEGER NOT NULL,
    labels      TEXT NOT NULL DEFAULT '{}',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    size        INTEGER NOT NULL DEFAULT 0,
    inodes      INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_snapshots_parent ON snapshots(parent_id);
";

/// Snapshot metadata database.
pub struct MetaStore {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    #[cfg(test)]
    fail_next_commit: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore")
            .field("path", &self.path)
            .finish()
    }
}

impl MetaStore {
    /// Open (or create) the metadata database at `path`.
    pub fn open(path: &Path) -> ImgResult<Self> {
        let writer = Connection::open(path).map_err(|e| {
            ImgError::TransactionFailed(format!(
                "failed to open metadata database {}: {}",
                path.display(),
                e
            ))
        })?;
        writer
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(sql_err("set busy timeout"))?;
        writer
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(sql_err("enable WAL journal"))?;
        writer
            .pragma_update(None, "foreign_keys", "ON")
            .map_err(sql_err("enable foreign keys"))?;
        writer
            .execute_batch(SCHEMA)
            .map_err(sql_err("create schema"))?;

        tracing::debug!(path = %path.display(), "Opened metadata store");

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            readers: Mutex::new(Vec::new()),
            #[cfg(test)]
            fail_next_commit: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin a write transaction. Blocks while another writer is in flight.
    pub fn begin_write(&self) -> ImgResult<Txn<'_>> {
        let conn = self.writer.lock();
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(sql_err("begin write transaction"))?;
        Ok(Txn {
            store: self,
            conn: TxConn::Writer(conn),
            writable: true,
            finished: false,
        })
    }

    /// Begin a read-only transaction.
    pub fn begin_read(&self) -> ImgResult<Txn<'_>> {
        let conn = match self.readers.lock().pop() {
            Some(conn) => conn,
            None => self.open_reader()?,
        };
        conn.execute_batch("BEGIN DEFERRED")
            .map_err(sql_err("begin read transaction"))?;
        Ok(Txn {
            store: self,
            conn: TxConn::Reader(Some(conn)),
            writable: false,
            finished: false,
        })
    }

    /// Run `f` inside a write transaction, committing on `Ok`.
    pub fn update<T>(&self, f: impl FnOnce(&Txn<'_>) -> ImgResult<T>) -> ImgResult<T> {
        let tx = self.begin_write()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` inside a read transaction.
    pub fn view<T>(&self, f: impl FnOnce(&Txn<'_>) -> ImgResult<T>) -> ImgResult<T> {
        let tx = self.begin_read()?;
        f(&tx)
    }

    fn open_reader(&self) -> ImgResult<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            ImgError::TransactionFailed(format!(
                "failed to open metadata reader {}: {}",
                self.path.display(),
                e
            ))
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(sql_err("set busy timeout"))?;
        Ok(conn)
    }

    fn release_reader(&self, conn: Connection) {
        let mut readers = self.readers.lock();
        if readers.len() < MAX_IDLE_READERS {
            readers.push(conn);
        }
    }

    /// Make the next write commit fail after its statements ran.
    #[cfg(test)]
    pub(crate) fn fail_next_commit(&self) {
        self.fail_next_commit
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

enum TxConn<'a> {
    Writer(MutexGuard<'a, Connection>),
    Reader(Option<Connection>),
}

/// An open metadata transaction.
///
/// Dropping a transaction without calling [`Txn::commit`] rolls it back.
pub struct Txn<'a> {
    store: &'a MetaStore,
    conn: TxConn<'a>,
    writable: bool,
    finished: bool,
}

impl Txn<'_> {
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn commit(mut self) -> ImgResult<()> {
        self.finished = true;

        #[cfg(test)]
        if self
            .store
            .fail_next_commit
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            let _ = self.conn().execute_batch("ROLLBACK");
            return Err(ImgError::TransactionFailed(
                "commit failed: injected failure".into(),
            ));
        }

        if let Err(e) = self.conn().execute_batch("COMMIT") {
            let _ = self.conn().execute_batch("ROLLBACK");
            return Err(ImgError::TransactionFailed(format!("commit failed: {}", e)));
        }
        Ok(())
    }

    pub fn rollback(mut self) -> ImgResult<()> {
        self.finished = true;
        self.conn()
            .execute_batch("ROLLBACK")
            .map_err(sql_err("rollback"))
    }

    fn conn(&self) -> &Connection {
        match &self.conn {
            TxConn::Writer(conn) => conn,
            TxConn::Reader(Some(conn)) => conn,
            TxConn::Reader(None) => unreachable!("reader connection used after release"),
        }
    }

    fn require_writable(&self) -> ImgResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(ImgError::TransactionFailed(
                "write operation in a read-only transaction".into(),
            ))
        }
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.finished
            && let Err(e) = self.conn().execute_batch("ROLLBACK")
        {
            tracing::warn!(error = %e, "Failed to roll back metadata transaction");
        }
        if let TxConn::Reader(conn) = &mut self.conn
            && let Some(conn) = conn.take()
        {
            self.store.release_reader(conn);
        }
    }
}

/// Map a rusqlite error to `TransactionFailed` with operation context.
pub(crate) fn sql_err(op: &'static str) -> impl Fn(rusqlite::Error) -> ImgError {
    move |e| ImgError::TransactionFailed(format!("{}: {}", op, e))
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::ConstraintViolation
    )
}
