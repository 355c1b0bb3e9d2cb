use super::types::{
    decode_ts, encode_ts, ContainerRecord, ContainerStatus, Owner, PortRecord, PortType,
    UpsertOutcome,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, TransactionBehavior};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rusqlite::Connection;
use tracing::{debug, warn};

const SCHEMA_VERSION: i32 = 1;

const RECORD_COLUMNS: &str = "owner_kind, owner_id, runtime_id, name, display_port, proxy_port, \
     status, scenario_id, created_at, last_activity_at, stopped_at";

/// SQLite-backed store for the port ledger and container records.
///
/// All access goes through a single `tokio_rusqlite` connection thread, so
/// each call below is one serialized unit of work. Writes that touch more
/// than one row run inside an IMMEDIATE transaction, which also serializes
/// them against other processes sharing the database file.
///
/// Cloning is cheap and shares the same connection.
#[derive(Clone)]
pub struct LabStore {
    db_path: PathBuf,
    conn: Connection,
    /// Advisory lock next to the database, held for the lifetime of the store.
    lock_file: Option<Arc<std::fs::File>>,
}

impl std::fmt::Debug for LabStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl LabStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Filesystem(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let lock_file = Self::try_acquire_lock(&db_path.with_extension("lock"))?;
        let conn = Connection::open(&db_path).await?;

        conn.call(|conn: &mut rusqlite::Connection| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            Ok(())
        })
        .await?;

        Ok(Self {
            db_path,
            conn,
            lock_file: lock_file.map(Arc::new),
        })
    }

    /// Ephemeral in-memory store with no file lock.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open(":memory:").await?;
        conn.call(|conn: &mut rusqlite::Connection| {
            conn.pragma_update(None, "busy_timeout", 5000)?;
            Ok(())
        })
        .await?;

        Ok(Self {
            db_path: PathBuf::from(":memory:"),
            conn,
            lock_file: None,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Whether no other process can be sharing this store: the advisory
    /// lock was acquired, or the store is in memory.
    pub fn is_exclusive(&self) -> bool {
        self.lock_file.is_some() || self.db_path == Path::new(":memory:")
    }

    /// Try to take an exclusive advisory lock. Another holder only earns a
    /// warning: the database itself stays consistent under concurrent writers.
    fn try_acquire_lock(lock_path: &Path) -> Result<Option<std::fs::File>> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| Error::Filesystem(format!("Failed to open lock file: {}", e)))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let _ = file.set_len(0);
                let _ = writeln!(file, "{}", std::process::id());
                debug!("Acquired advisory lock on {:?}", lock_path);
                Ok(Some(file))
            }
            Err(e) => {
                let holder = std::fs::read_to_string(lock_path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                warn!(
                    "Another labpool instance{} holds {:?} ({}); continuing without the lock",
                    if holder.is_empty() {
                        String::new()
                    } else {
                        format!(" (PID {})", holder)
                    },
                    lock_path,
                    e
                );
                Ok(None)
            }
        }
    }

    /// Run `f` inside an IMMEDIATE transaction and commit.
    #[tracing::instrument(skip(self, f), fields(operation = "db_transaction"))]
    async fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let result = f(&tx)?;
                tx.commit()?;
                Ok(result)
            })
            .await
            .map_err(Error::from)
    }

    /// Create the schema if missing and check its version.
    pub async fn initialize(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .call(|conn: &mut rusqlite::Connection| -> tokio_rusqlite::Result<i32> {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS schema_version (
                        version INTEGER PRIMARY KEY,
                        applied_at TEXT NOT NULL
                    );

                    -- One row per allocatable host port
                    CREATE TABLE IF NOT EXISTS port_allocations (
                        port INTEGER PRIMARY KEY,
                        port_type TEXT NOT NULL CHECK (port_type IN ('display', 'proxy')),
                        is_available INTEGER NOT NULL DEFAULT 1,
                        allocated_to TEXT,
                        allocated_at TEXT,
                        CHECK (is_available = 1 OR allocated_to IS NOT NULL)
                    );

                    CREATE INDEX IF NOT EXISTS idx_port_allocations_free
                        ON port_allocations(port_type, is_available, port);

                    CREATE TABLE IF NOT EXISTS containers (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        owner_kind TEXT NOT NULL CHECK (owner_kind IN ('user', 'pool')),
                        owner_id TEXT NOT NULL,
                        runtime_id TEXT NOT NULL,
                        name TEXT NOT NULL,
                        display_port INTEGER NOT NULL,
                        proxy_port INTEGER NOT NULL,
                        status TEXT NOT NULL CHECK (status IN ('running', 'stopped')),
                        scenario_id TEXT,
                        created_at TEXT NOT NULL,
                        last_activity_at TEXT NOT NULL,
                        stopped_at TEXT
                    );

                    -- At most one RUNNING record per owner
                    CREATE UNIQUE INDEX IF NOT EXISTS idx_containers_running_owner
                        ON containers(owner_kind, owner_id) WHERE status = 'running';
                    CREATE INDEX IF NOT EXISTS idx_containers_runtime_id
                        ON containers(runtime_id);
                    CREATE INDEX IF NOT EXISTS idx_containers_activity
                        ON containers(status, last_activity_at);
                    "#,
                )?;

                conn.execute(
                    "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
                    rusqlite::params![SCHEMA_VERSION],
                )?;

                Ok(conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                    row.get(0)
                })?)
            })
            .await?;

        if version > SCHEMA_VERSION {
            return Err(Error::Validation(format!(
                "database {} has schema version {}, this build supports up to {}",
                self.db_path.display(),
                version,
                SCHEMA_VERSION
            )));
        }
        debug!("Database ready at {} (schema v{})", self.db_path.display(), version);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Ports
    // ---------------------------------------------------------------------

    /// Insert every port of `[start, end]` as available. Existing rows are kept.
    /// Returns the number of rows inserted.
    pub async fn seed_ports(&self, port_type: PortType, start: u16, end: u16) -> Result<usize> {
        self.with_transaction(move |tx| {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO port_allocations (port, port_type, is_available) VALUES (?1, ?2, 1)",
            )?;
            let mut inserted = 0;
            for port in start..=end {
                inserted += stmt.execute(rusqlite::params![port, port_type.as_str()])?;
            }
            Ok(inserted)
        })
        .await
    }

    /// Drop every row outside both ranges and re-type rows whose port now
    /// falls in the other range. Returns `(removed, retyped)`.
    pub async fn retain_port_ranges(
        &self,
        display: (u16, u16),
        proxy: (u16, u16),
    ) -> Result<(usize, usize)> {
        self.with_transaction(move |tx| {
            let removed = tx.execute(
                "DELETE FROM port_allocations
                 WHERE port NOT BETWEEN ?1 AND ?2 AND port NOT BETWEEN ?3 AND ?4",
                rusqlite::params![display.0, display.1, proxy.0, proxy.1],
            )?;
            let mut retyped = 0;
            for (port_type, (low, high)) in [(PortType::Display, display), (PortType::Proxy, proxy)] {
                retyped += tx.execute(
                    "UPDATE port_allocations SET port_type = ?1
                     WHERE port BETWEEN ?2 AND ?3 AND port_type <> ?1",
                    rusqlite::params![port_type.as_str(), low, high],
                )?;
            }
            Ok((removed, retyped))
        })
        .await
    }

    /// Pick the lowest available port of `port_type` inside `[low, high]`,
    /// mark it taken by `owner_label`, and return it, in one statement.
    pub async fn allocate_port(
        &self,
        port_type: PortType,
        low: u16,
        high: u16,
        owner_label: String,
    ) -> Result<Option<u16>> {
        let now = encode_ts(&Utc::now());
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn
                    .query_row(
                        "UPDATE port_allocations
                         SET is_available = 0, allocated_to = ?2, allocated_at = ?3
                         WHERE port = (
                             SELECT port FROM port_allocations
                             WHERE port_type = ?1 AND is_available = 1
                               AND port BETWEEN ?4 AND ?5
                             ORDER BY port LIMIT 1
                         )
                         RETURNING port",
                        rusqlite::params![port_type.as_str(), owner_label, now, low, high],
                        |row| row.get::<_, u16>(0),
                    )
                    .optional()?)
            })
            .await
            .map_err(Error::from)
    }

    /// Mark ports available again. Already-available ports are left alone.
    /// Returns how many ports actually changed state.
    pub async fn release_ports(&self, ports: Vec<u16>) -> Result<usize> {
        self.with_transaction(move |tx| release_ports_in(tx, &ports))
            .await
    }

    /// Reset every port in `[low, high]` to available, then mark `bound`
    /// ports (those inside the range) taken by `sentinel`.
    pub async fn reset_port_range(
        &self,
        low: u16,
        high: u16,
        bound: Vec<u16>,
        sentinel: String,
    ) -> Result<usize> {
        let now = encode_ts(&Utc::now());
        self.with_transaction(move |tx| {
            tx.execute(
                "UPDATE port_allocations
                 SET is_available = 1, allocated_to = NULL, allocated_at = NULL
                 WHERE port BETWEEN ?1 AND ?2",
                rusqlite::params![low, high],
            )?;
            let mut stmt = tx.prepare(
                "UPDATE port_allocations
                 SET is_available = 0, allocated_to = ?2, allocated_at = ?3
                 WHERE port = ?1",
            )?;
            let mut marked = 0;
            for port in bound.into_iter().filter(|p| (low..=high).contains(p)) {
                marked += stmt.execute(rusqlite::params![port, sentinel, now])?;
            }
            Ok(marked)
        })
        .await
    }

    /// Mark `ports` taken by `owner_label` regardless of their current state.
    pub async fn adopt_ports(&self, ports: Vec<u16>, owner_label: String) -> Result<usize> {
        let now = encode_ts(&Utc::now());
        self.with_transaction(move |tx| {
            let mut stmt = tx.prepare(
                "UPDATE port_allocations
                 SET is_available = 0, allocated_to = ?2, allocated_at = ?3
                 WHERE port = ?1",
            )?;
            let mut adopted = 0;
            for port in ports {
                adopted += stmt.execute(rusqlite::params![port, owner_label, now])?;
            }
            Ok(adopted)
        })
        .await
    }

    pub async fn list_ports(&self) -> Result<Vec<PortRecord>> {
        self.conn
            .call(|conn: &mut rusqlite::Connection| {
                let mut stmt = conn.prepare(
                    "SELECT port, port_type, is_available, allocated_to, allocated_at
                     FROM port_allocations ORDER BY port",
                )?;
                let rows = stmt.query_map([], port_from_row)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn get_port(&self, port: u16) -> Result<Option<PortRecord>> {
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn
                    .query_row(
                        "SELECT port, port_type, is_available, allocated_to, allocated_at
                         FROM port_allocations WHERE port = ?1",
                        rusqlite::params![port],
                        port_from_row,
                    )
                    .optional()?)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn count_available_ports(&self, port_type: PortType) -> Result<u32> {
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM port_allocations WHERE port_type = ?1 AND is_available = 1",
                    rusqlite::params![port_type.as_str()],
                    |row| row.get(0),
                )?)
            })
            .await
            .map_err(Error::from)
    }

    // ---------------------------------------------------------------------
    // Container records
    // ---------------------------------------------------------------------

    /// Write a RUNNING record, replacing any RUNNING record of the same owner,
    /// and stamp the owner on both of its ports.
    ///
    /// A replaced record's ports are left allocated.
    pub async fn upsert_running(&self, record: ContainerRecord) -> Result<UpsertOutcome> {
        self.with_transaction(move |tx| upsert_running_in(tx, &record))
            .await
    }

    /// RUNNING record for `owner`, if any.
    pub async fn find_running(&self, owner: &Owner) -> Result<Option<ContainerRecord>> {
        let kind = owner.kind();
        let id = owner.id().to_string();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {RECORD_COLUMNS} FROM containers
                             WHERE owner_kind = ?1 AND owner_id = ?2 AND status = 'running'"
                        ),
                        rusqlite::params![kind, id],
                        record_from_row,
                    )
                    .optional()?)
            })
            .await
            .map_err(Error::from)
    }

    /// Most recent record for a runtime id, RUNNING or not.
    pub async fn find_by_runtime_id(&self, runtime_id: &str) -> Result<Option<ContainerRecord>> {
        let runtime_id = runtime_id.to_string();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {RECORD_COLUMNS} FROM containers
                             WHERE runtime_id = ?1 ORDER BY id DESC LIMIT 1"
                        ),
                        rusqlite::params![runtime_id],
                        record_from_row,
                    )
                    .optional()?)
            })
            .await
            .map_err(Error::from)
    }

    /// RUNNING pool records, oldest first.
    pub async fn pool_records(&self) -> Result<Vec<ContainerRecord>> {
        self.query_records(
            "WHERE owner_kind = 'pool' AND status = 'running' ORDER BY created_at, id",
            Vec::new(),
        )
        .await
    }

    /// Every RUNNING record.
    pub async fn running_records(&self) -> Result<Vec<ContainerRecord>> {
        self.query_records("WHERE status = 'running' ORDER BY id", Vec::new())
            .await
    }

    /// RUNNING user records with no activity since `cutoff`.
    pub async fn idle_records(&self, cutoff: DateTime<Utc>) -> Result<Vec<ContainerRecord>> {
        self.query_records(
            "WHERE owner_kind = 'user' AND status = 'running' AND last_activity_at < ?1
             ORDER BY last_activity_at",
            vec![encode_ts(&cutoff)],
        )
        .await
    }

    async fn query_records(
        &self,
        clause: &'static str,
        params: Vec<String>,
    ) -> Result<Vec<ContainerRecord>> {
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {RECORD_COLUMNS} FROM containers {clause}"))?;
                let rows =
                    stmt.query_map(rusqlite::params_from_iter(params.iter()), record_from_row)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
            .map_err(Error::from)
    }

    /// Number of RUNNING records, pool slots included.
    pub async fn count_running(&self) -> Result<u32> {
        self.count("SELECT COUNT(*) FROM containers WHERE status = 'running'")
            .await
    }

    pub async fn count_running_pool(&self) -> Result<u32> {
        self.count(
            "SELECT COUNT(*) FROM containers WHERE status = 'running' AND owner_kind = 'pool'",
        )
        .await
    }

    async fn count(&self, sql: &'static str) -> Result<u32> {
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn.query_row(sql, [], |row| row.get(0))?)
            })
            .await
            .map_err(Error::from)
    }

    /// Hand the RUNNING pool slot backed by `runtime_id` to `owner`.
    ///
    /// The pool row is deleted and the owner's row written in one
    /// transaction. If the delete matches nothing (another caller already
    /// claimed the slot) the transaction is rolled back and `None` returned.
    pub async fn reown_pool_slot(
        &self,
        runtime_id: &str,
        owner: Owner,
        scenario_id: Option<String>,
    ) -> Result<Option<(ContainerRecord, UpsertOutcome)>> {
        let runtime_id = runtime_id.to_string();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let slot = tx
                    .query_row(
                        &format!(
                            "SELECT {RECORD_COLUMNS} FROM containers
                             WHERE runtime_id = ?1 AND owner_kind = 'pool' AND status = 'running'"
                        ),
                        rusqlite::params![runtime_id],
                        record_from_row,
                    )
                    .optional()?;

                let deleted = tx.execute(
                    "DELETE FROM containers
                     WHERE runtime_id = ?1 AND owner_kind = 'pool' AND status = 'running'",
                    rusqlite::params![runtime_id],
                )?;

                let slot = match slot {
                    Some(slot) if deleted > 0 => slot,
                    // Dropping the transaction rolls it back.
                    _ => return Ok(None),
                };

                let now = Utc::now();
                let record = ContainerRecord {
                    owner,
                    scenario_id,
                    created_at: now,
                    last_activity_at: now,
                    stopped_at: None,
                    status: ContainerStatus::Running,
                    ..slot
                };
                let outcome = upsert_running_in(&tx, &record)?;
                tx.commit()?;
                Ok(Some((record, outcome)))
            })
            .await
            .map_err(Error::from)
    }

    /// Flip the RUNNING record(s) for `runtime_id` to STOPPED and release
    /// their ports in the same transaction. Returns the records that were
    /// stopped; a record that is already STOPPED is not touched again.
    pub async fn mark_stopped(&self, runtime_id: &str) -> Result<Vec<ContainerRecord>> {
        let runtime_id = runtime_id.to_string();
        let now = Utc::now();
        self.with_transaction(move |tx| {
            let mut stopped = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM containers
                     WHERE runtime_id = ?1 AND status = 'running'"
                ))?;
                let rows = stmt.query_map(rusqlite::params![runtime_id], record_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            if stopped.is_empty() {
                return Ok(stopped);
            }

            tx.execute(
                "UPDATE containers SET status = 'stopped', stopped_at = ?2
                 WHERE runtime_id = ?1 AND status = 'running'",
                rusqlite::params![runtime_id, encode_ts(&now)],
            )?;

            let ports: Vec<u16> = stopped.iter().flat_map(|r| r.ports()).collect();
            release_ports_in(tx, &ports)?;

            for record in &mut stopped {
                record.status = ContainerStatus::Stopped;
                record.stopped_at = Some(now);
            }
            Ok(stopped)
        })
        .await
    }

    /// Delete STOPPED records that stopped before `before`.
    pub async fn prune_stopped(&self, before: DateTime<Utc>) -> Result<usize> {
        let before = encode_ts(&before);
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                Ok(conn.execute(
                    "DELETE FROM containers WHERE status = 'stopped' AND stopped_at < ?1",
                    rusqlite::params![before],
                )?)
            })
            .await
            .map_err(Error::from)
    }

    /// Refresh `last_activity_at` for the owner's RUNNING record.
    /// Returns false when the owner has none.
    pub async fn touch_activity(&self, owner: &Owner) -> Result<bool> {
        let kind = owner.kind();
        let id = owner.id().to_string();
        let now = encode_ts(&Utc::now());
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                let updated = conn.execute(
                    "UPDATE containers SET last_activity_at = ?3
                     WHERE owner_kind = ?1 AND owner_id = ?2 AND status = 'running'",
                    rusqlite::params![kind, id, now],
                )?;
                Ok(updated > 0)
            })
            .await
            .map_err(Error::from)
    }
}

fn release_ports_in(tx: &rusqlite::Transaction, ports: &[u16]) -> rusqlite::Result<usize> {
    let mut stmt = tx.prepare(
        "UPDATE port_allocations
         SET is_available = 1, allocated_to = NULL, allocated_at = NULL
         WHERE port = ?1 AND is_available = 0",
    )?;
    let mut released = 0;
    for port in ports {
        released += stmt.execute(rusqlite::params![port])?;
    }
    Ok(released)
}

fn upsert_running_in(
    tx: &rusqlite::Transaction,
    record: &ContainerRecord,
) -> rusqlite::Result<UpsertOutcome> {
    let previous = tx
        .query_row(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM containers
                 WHERE owner_kind = ?1 AND owner_id = ?2 AND status = 'running'"
            ),
            rusqlite::params![record.owner.kind(), record.owner.id()],
            record_from_row,
        )
        .optional()?;

    tx.execute(
        "INSERT INTO containers (
             owner_kind, owner_id, runtime_id, name, display_port, proxy_port,
             status, scenario_id, created_at, last_activity_at, stopped_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'running', ?7, ?8, ?9, NULL)
         ON CONFLICT(owner_kind, owner_id) WHERE status = 'running' DO UPDATE SET
             runtime_id = excluded.runtime_id,
             name = excluded.name,
             display_port = excluded.display_port,
             proxy_port = excluded.proxy_port,
             scenario_id = excluded.scenario_id,
             created_at = excluded.created_at,
             last_activity_at = excluded.last_activity_at,
             stopped_at = NULL",
        rusqlite::params![
            record.owner.kind(),
            record.owner.id(),
            record.runtime_id,
            record.name,
            record.display_port,
            record.proxy_port,
            record.scenario_id,
            encode_ts(&record.created_at),
            encode_ts(&record.last_activity_at),
        ],
    )?;

    tx.execute(
        "UPDATE port_allocations SET allocated_to = ?1
         WHERE port IN (?2, ?3) AND is_available = 0",
        rusqlite::params![
            record.owner.ledger_label(),
            record.display_port,
            record.proxy_port
        ],
    )?;

    Ok(match previous {
        None => UpsertOutcome::Inserted,
        Some(previous) => UpsertOutcome::Overwrote { previous },
    })
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn ts_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    decode_ts(&raw).ok_or_else(|| conversion_error(idx, format!("bad timestamp '{}'", raw)))
}

fn opt_ts_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(raw) => decode_ts(&raw)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("bad timestamp '{}'", raw))),
    }
}

fn port_from_row(row: &rusqlite::Row) -> rusqlite::Result<PortRecord> {
    let port_type: String = row.get(1)?;
    Ok(PortRecord {
        port: row.get(0)?,
        port_type: port_type.parse().map_err(|e| conversion_error(1, e))?,
        is_available: row.get(2)?,
        allocated_to: row.get(3)?,
        allocated_at: opt_ts_column(row, 4)?,
    })
}

fn record_from_row(row: &rusqlite::Row) -> rusqlite::Result<ContainerRecord> {
    let kind: String = row.get(0)?;
    let owner = Owner::from_parts(&kind, row.get(1)?)
        .ok_or_else(|| conversion_error(0, format!("unknown owner kind '{}'", kind)))?;
    let status: String = row.get(6)?;
    Ok(ContainerRecord {
        owner,
        runtime_id: row.get(2)?,
        name: row.get(3)?,
        display_port: row.get(4)?,
        proxy_port: row.get(5)?,
        status: status.parse().map_err(|e| conversion_error(6, e))?,
        scenario_id: row.get(7)?,
        created_at: ts_column(row, 8)?,
        last_activity_at: ts_column(row, 9)?,
        stopped_at: opt_ts_column(row, 10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PROVISIONAL_OWNER;

    async fn store() -> LabStore {
        let store = LabStore::open_in_memory().await.unwrap();
        store.initialize().await.unwrap();
        store
            .seed_ports(PortType::Display, 15900, 15902)
            .await
            .unwrap();
        store.seed_ports(PortType::Proxy, 15950, 15952).await.unwrap();
        store
    }

    fn record(owner: Owner, runtime_id: &str, display: u16, proxy: u16) -> ContainerRecord {
        ContainerRecord::running(
            owner,
            runtime_id.to_string(),
            format!("lab-{runtime_id}"),
            display,
            proxy,
            Some("scenario-1".into()),
        )
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let store = store().await;
        store.initialize().await.unwrap();
        assert_eq!(store.seed_ports(PortType::Display, 15900, 15902).await.unwrap(), 0);
        assert_eq!(store.list_ports().await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_allocate_takes_lowest_port_of_type() {
        let store = store().await;
        let first = store
            .allocate_port(PortType::Proxy, 15950, 15952, PROVISIONAL_OWNER.into())
            .await
            .unwrap();
        let second = store
            .allocate_port(PortType::Proxy, 15950, 15952, PROVISIONAL_OWNER.into())
            .await
            .unwrap();
        assert_eq!(first, Some(15950));
        assert_eq!(second, Some(15951));

        let rec = store.get_port(15950).await.unwrap().unwrap();
        assert!(!rec.is_available);
        assert_eq!(rec.allocated_to.as_deref(), Some(PROVISIONAL_OWNER));
        assert!(rec.allocated_at.is_some());
    }

    #[tokio::test]
    async fn test_allocate_returns_none_when_exhausted() {
        let store = store().await;
        for _ in 0..3 {
            assert!(store
                .allocate_port(PortType::Display, 15900, 15902, "x".into())
                .await
                .unwrap()
                .is_some());
        }
        assert_eq!(
            store
                .allocate_port(PortType::Display, 15900, 15902, "x".into())
                .await
                .unwrap(),
            None
        );
        assert_eq!(store.count_available_ports(PortType::Proxy).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_upsert_stamps_owner_on_ports() {
        let store = store().await;
        let d = store.allocate_port(PortType::Display, 15900, 15902, PROVISIONAL_OWNER.into()).await.unwrap().unwrap();
        let p = store.allocate_port(PortType::Proxy, 15950, 15952, PROVISIONAL_OWNER.into()).await.unwrap().unwrap();

        let outcome = store
            .upsert_running(record(Owner::user("alice"), "c1", d, p))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let port = store.get_port(d).await.unwrap().unwrap();
        assert_eq!(port.allocated_to.as_deref(), Some("user:alice"));
        let found = store.find_running(&Owner::user("alice")).await.unwrap().unwrap();
        assert_eq!(found.runtime_id, "c1");
        assert_eq!(found.scenario_id.as_deref(), Some("scenario-1"));
    }

    #[tokio::test]
    async fn test_upsert_overwrite_keeps_previous_ports_allocated() {
        let store = store().await;
        store
            .adopt_ports(vec![15900, 15950, 15901, 15951], PROVISIONAL_OWNER.into())
            .await
            .unwrap();
        store
            .upsert_running(record(Owner::user("bob"), "c1", 15900, 15950))
            .await
            .unwrap();

        let outcome = store
            .upsert_running(record(Owner::user("bob"), "c2", 15901, 15951))
            .await
            .unwrap();
        match outcome {
            UpsertOutcome::Overwrote { previous } => assert_eq!(previous.runtime_id, "c1"),
            other => panic!("expected overwrite, got {other:?}"),
        }

        assert_eq!(store.count_running().await.unwrap(), 1);
        // Nothing references 15900/15950 anymore, yet they stay allocated.
        assert!(!store.get_port(15900).await.unwrap().unwrap().is_available);
        assert!(!store.get_port(15950).await.unwrap().unwrap().is_available);
    }

    #[tokio::test]
    async fn test_mark_stopped_releases_ports_once() {
        let store = store().await;
        store
            .adopt_ports(vec![15900, 15950], PROVISIONAL_OWNER.into())
            .await
            .unwrap();
        store
            .upsert_running(record(Owner::user("carol"), "c1", 15900, 15950))
            .await
            .unwrap();

        let stopped = store.mark_stopped("c1").await.unwrap();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].status, ContainerStatus::Stopped);
        assert!(store.get_port(15900).await.unwrap().unwrap().is_available);
        assert!(store.find_running(&Owner::user("carol")).await.unwrap().is_none());

        let persisted = store.find_by_runtime_id("c1").await.unwrap().unwrap();
        assert_eq!(persisted.status, ContainerStatus::Stopped);
        assert!(persisted.stopped_at.is_some());

        // A second cleanup must not free ports someone else now holds.
        store.adopt_ports(vec![15900], "user:dave".into()).await.unwrap();
        assert!(store.mark_stopped("c1").await.unwrap().is_empty());
        assert!(!store.get_port(15900).await.unwrap().unwrap().is_available);
    }

    #[tokio::test]
    async fn test_prune_stopped_keeps_running_and_recent() {
        let store = store().await;
        store
            .upsert_running(record(Owner::user("gone"), "c1", 15900, 15950))
            .await
            .unwrap();
        store.mark_stopped("c1").await.unwrap();
        store
            .upsert_running(record(Owner::user("live"), "c2", 15901, 15951))
            .await
            .unwrap();

        let earlier = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.prune_stopped(earlier).await.unwrap(), 0);
        assert!(store.find_by_runtime_id("c1").await.unwrap().is_some());

        assert_eq!(store.prune_stopped(Utc::now()).await.unwrap(), 1);
        assert!(store.find_by_runtime_id("c1").await.unwrap().is_none());
        assert!(store.find_by_runtime_id("c2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retain_port_ranges_drops_and_retypes() {
        let store = store().await;
        let (removed, retyped) = store
            .retain_port_ranges((15950, 15951), (15900, 15902))
            .await
            .unwrap();
        assert_eq!((removed, retyped), (1, 5));
        assert!(store.get_port(15952).await.unwrap().is_none());
        let moved = store.get_port(15950).await.unwrap().unwrap();
        assert_eq!(moved.port_type, PortType::Display);
    }

    #[tokio::test]
    async fn test_reown_pool_slot_only_once() {
        let store = store().await;
        store
            .upsert_running(record(Owner::pool("slot-1"), "p1", 15900, 15950))
            .await
            .unwrap();

        let (claimed, _) = store
            .reown_pool_slot("p1", Owner::user("erin"), Some("web-101".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.runtime_id, "p1");
        assert_eq!(claimed.display_port, 15900);
        assert_eq!(claimed.scenario_id.as_deref(), Some("web-101"));

        let again = store
            .reown_pool_slot("p1", Owner::user("frank"), None)
            .await
            .unwrap();
        assert!(again.is_none());
        assert!(store.find_running(&Owner::user("frank")).await.unwrap().is_none());
        assert_eq!(store.count_running_pool().await.unwrap(), 0);
        assert_eq!(store.count_running().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_idle_records_skip_pool_and_recent() {
        let store = store().await;
        let mut old = record(Owner::user("old"), "c1", 15900, 15950);
        old.last_activity_at = Utc::now() - chrono::Duration::hours(2);
        store.upsert_running(old).await.unwrap();

        let mut stale_pool = record(Owner::pool("s"), "p1", 15901, 15951);
        stale_pool.last_activity_at = Utc::now() - chrono::Duration::hours(2);
        store.upsert_running(stale_pool).await.unwrap();

        store
            .upsert_running(record(Owner::user("fresh"), "c2", 15902, 15952))
            .await
            .unwrap();

        let idle = store
            .idle_records(Utc::now() - chrono::Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].owner, Owner::user("old"));
    }

    #[tokio::test]
    async fn test_reset_port_range_marks_bound_ports_external() {
        let store = store().await;
        store.adopt_ports(vec![15901], "user:ghost".into()).await.unwrap();

        let marked = store
            .reset_port_range(15900, 15952, vec![15950, 20000], "external".into())
            .await
            .unwrap();
        assert_eq!(marked, 1);
        assert!(store.get_port(15901).await.unwrap().unwrap().is_available);
        let held = store.get_port(15950).await.unwrap().unwrap();
        assert!(!held.is_available);
        assert_eq!(held.allocated_to.as_deref(), Some("external"));
    }

    #[tokio::test]
    async fn test_second_open_is_not_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.db");

        let first = LabStore::open(&path).await.unwrap();
        assert!(first.is_exclusive());
        let second = LabStore::open(&path).await.unwrap();
        assert!(!second.is_exclusive());

        drop(first);
        drop(second);
        assert!(LabStore::open(&path).await.unwrap().is_exclusive());
        assert!(LabStore::open_in_memory().await.unwrap().is_exclusive());
    }

    #[tokio::test]
    async fn test_on_disk_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("lab.db");
        {
            let store = LabStore::open(&path).await.unwrap();
            store.initialize().await.unwrap();
            store.seed_ports(PortType::Display, 15900, 15901).await.unwrap();
            store.allocate_port(PortType::Display, 15900, 15901, "x".into()).await.unwrap();
        }
        let store = LabStore::open(&path).await.unwrap();
        store.initialize().await.unwrap();
        assert_eq!(store.count_available_ports(PortType::Display).await.unwrap(), 1);
    }
}
