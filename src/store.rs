//! Persistent store for binaries, analysis results and IOCs
//!
//! SQLite behind an r2d2 pool. WAL mode allows concurrent readers while a
//! worker writes; `foreign_keys=ON` is set per connection so deleting an
//! analysis row always cascades to its IOCs (callers never bulk-delete
//! around the cascade).
//!
//! The store is authoritative for *existence* of a binary; the cache
//! (cache.rs) is authoritative for its bytes.

use crate::model::{AnalysisResult, Binary, Ioc, MatchType, ResultDraft, normalize_score};
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, Connection};
use std::path::Path;

/// Errors surfaced by the store.
///
/// `Conflict` is the unique-constraint violation on
/// `(sha256, connector_name, analysis_name)`; creators are responsible for
/// treating it as "already analyzed" rather than a crash.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate analysis result: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Selector for bulk result deletion, mirroring the front-end's
/// `kind`/`items` contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteKind {
    Hashes,
    ConnectorNames,
    AnalysisNames,
    JobIds,
}

impl DeleteKind {
    fn column(&self) -> &'static str {
        match self {
            DeleteKind::Hashes => "sha256",
            DeleteKind::ConnectorNames => "connector_name",
            DeleteKind::AnalysisNames => "analysis_name",
            DeleteKind::JobIds => "job_id",
        }
    }
}

/// Handle to the relational store. Cheap to clone; connections are pooled.
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Open (creating if necessary) the database at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA foreign_keys=ON;",
            )
        });
        let pool = Pool::builder().max_size(8).build(manager)?;

        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn init_schema(&self) -> StoreResult<()> {
        tracing::debug!("initializing database schema");
        self.conn()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS binaries (
                id        INTEGER PRIMARY KEY,
                sha256    TEXT NOT NULL UNIQUE,
                available INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS analysis (
                id             INTEGER PRIMARY KEY,
                sha256         TEXT NOT NULL,
                connector_name TEXT NOT NULL,
                analysis_name  TEXT NOT NULL,
                score          INTEGER NOT NULL DEFAULT 0,
                error          INTEGER NOT NULL DEFAULT 0,
                scan_time      TEXT NOT NULL,
                payload        TEXT,
                job_id         TEXT NOT NULL,
                dispatched     INTEGER NOT NULL DEFAULT 0,
                UNIQUE (sha256, connector_name, analysis_name)
            );
            CREATE INDEX IF NOT EXISTS idx_analysis_sha256 ON analysis (sha256);
            CREATE INDEX IF NOT EXISTS idx_analysis_job_id ON analysis (job_id);

            CREATE TABLE IF NOT EXISTS iocs (
                id          INTEGER PRIMARY KEY,
                analysis_id INTEGER NOT NULL
                            REFERENCES analysis (id) ON DELETE CASCADE,
                match_type  TEXT NOT NULL,
                values_json TEXT NOT NULL,
                field       TEXT,
                link        TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_iocs_analysis_id ON iocs (analysis_id);",
        )?;
        Ok(())
    }

    // ── Binaries ─────────────────────────────────────────────────────────

    /// Look up a binary by hash.
    pub fn binary_by_hash(&self, sha256: &str) -> StoreResult<Option<Binary>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, sha256, available FROM binaries WHERE sha256 = ?1")?;
        let mut rows = stmt.query_map(params![sha256], row_to_binary)?;
        Ok(rows.next().transpose()?)
    }

    /// Create the binary row if it doesn't exist, then set its availability.
    /// Used by the download path after bytes land in the cache.
    pub fn upsert_binary(&self, sha256: &str, available: bool) -> StoreResult<Binary> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO binaries (sha256, available) VALUES (?1, ?2)
             ON CONFLICT (sha256) DO UPDATE SET available = excluded.available",
            params![sha256, available],
        )?;
        // The row exists now by construction
        Ok(self.binary_by_hash(sha256)?.expect("upserted binary row"))
    }

    /// Flip the availability flag on an existing binary.
    pub fn set_available(&self, sha256: &str, available: bool) -> StoreResult<()> {
        self.conn()?.execute(
            "UPDATE binaries SET available = ?2 WHERE sha256 = ?1",
            params![sha256, available],
        )?;
        Ok(())
    }

    /// Given a set of hashes, return the ones that are NOT currently
    /// available in the cache - the set retrieval still has to fetch.
    pub fn filter_unavailable(&self, hashes: &[String]) -> StoreResult<Vec<String>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let sql = format!(
            "SELECT sha256 FROM binaries WHERE available = 1 AND sha256 IN ({})",
            placeholders(hashes.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let available: Vec<String> = stmt
            .query_map(params_from_iter(hashes.iter()), |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        tracing::debug!(available = available.len(), "available hashes");

        Ok(hashes
            .iter()
            .filter(|h| !available.contains(h))
            .cloned()
            .collect())
    }

    /// Every hash the sandbox has ever observed.
    pub fn all_hashes(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT sha256 FROM binaries ORDER BY id")?;
        let hashes = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(hashes)
    }

    // ── Analysis results ─────────────────────────────────────────────────

    /// Persist a connector result draft, stamped with its identity, plus its
    /// IOCs, in one transaction. The score is normalized into [1,10] here so
    /// every stored row already satisfies the sink contract.
    ///
    /// A second insert for the same (sha256, connector, analysis) returns
    /// `StoreError::Conflict` and leaves nothing behind.
    pub fn create_result(
        &self,
        sha256: &str,
        connector_name: &str,
        job_id: &str,
        draft: &ResultDraft,
    ) -> StoreResult<AnalysisResult> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let score = normalize_score(draft.score);
        let scan_time = Utc::now();
        let payload = match &draft.payload {
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        };

        let inserted = tx.execute(
            "INSERT INTO analysis
                (sha256, connector_name, analysis_name, score, error,
                 scan_time, payload, job_id, dispatched)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
            params![
                sha256,
                connector_name,
                draft.analysis_name,
                score,
                draft.error,
                scan_time.to_rfc3339(),
                payload,
                job_id,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::Conflict(format!(
                    "{}:{}:{}",
                    connector_name, draft.analysis_name, sha256
                )));
            }
            Err(e) => return Err(e.into()),
        }
        let analysis_id = tx.last_insert_rowid();

        let mut iocs = Vec::with_capacity(draft.iocs.len());
        for ioc in &draft.iocs {
            tx.execute(
                "INSERT INTO iocs (analysis_id, match_type, values_json, field, link)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    analysis_id,
                    ioc.match_type.as_str(),
                    serde_json::to_string(&ioc.values).unwrap_or_else(|_| "[]".into()),
                    ioc.field,
                    ioc.link,
                ],
            )?;
            iocs.push(Ioc {
                id: tx.last_insert_rowid(),
                analysis_id,
                match_type: ioc.match_type,
                values: ioc.values.clone(),
                field: ioc.field.clone(),
                link: ioc.link.clone(),
            });
        }

        tx.commit()?;

        Ok(AnalysisResult {
            id: analysis_id,
            sha256: sha256.to_string(),
            connector_name: connector_name.to_string(),
            analysis_name: draft.analysis_name.clone(),
            score,
            error: draft.error,
            scan_time,
            payload: draft.payload.clone(),
            job_id: job_id.to_string(),
            dispatched: false,
            iocs,
        })
    }

    /// Fetch results (with IOCs) by id, in id order. Unknown ids are
    /// silently absent - the dispatcher tolerates deleted rows.
    pub fn results_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<AnalysisResult>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let sql = format!(
            "SELECT id, sha256, connector_name, analysis_name, score, error,
                    scan_time, payload, job_id, dispatched
             FROM analysis WHERE id IN ({}) ORDER BY id",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut results: Vec<AnalysisResult> = stmt
            .query_map(params_from_iter(ids.iter()), row_to_result)?
            .collect::<Result<_, _>>()?;
        for result in &mut results {
            result.iocs = self.iocs_for(&conn, result.id)?;
        }
        Ok(results)
    }

    /// Fetch all results (with IOCs) for one binary hash.
    pub fn results_by_hash(&self, sha256: &str) -> StoreResult<Vec<AnalysisResult>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, sha256, connector_name, analysis_name, score, error,
                    scan_time, payload, job_id, dispatched
             FROM analysis WHERE sha256 = ?1 ORDER BY id",
        )?;
        let mut results: Vec<AnalysisResult> = stmt
            .query_map(params![sha256], row_to_result)?
            .collect::<Result<_, _>>()?;
        for result in &mut results {
            result.iocs = self.iocs_for(&conn, result.id)?;
        }
        Ok(results)
    }

    fn iocs_for(&self, conn: &Connection, analysis_id: i64) -> StoreResult<Vec<Ioc>> {
        let mut stmt = conn.prepare(
            "SELECT id, analysis_id, match_type, values_json, field, link
             FROM iocs WHERE analysis_id = ?1 ORDER BY id",
        )?;
        let iocs = stmt
            .query_map(params![analysis_id], row_to_ioc)?
            .collect::<Result<_, _>>()?;
        Ok(iocs)
    }

    /// Mark the given results as dispatched. Called only after a successful
    /// sink append.
    pub fn mark_dispatched(&self, ids: &[i64]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let sql = format!(
            "UPDATE analysis SET dispatched = 1 WHERE id IN ({})",
            placeholders(ids.len())
        );
        conn.execute(&sql, params_from_iter(ids.iter()))?;
        Ok(())
    }

    /// Delete every result whose `kind` column matches one of `items`.
    /// IOCs go with their parents via the FK cascade. Returns the number of
    /// result rows removed.
    pub fn delete_results(&self, kind: DeleteKind, items: &[String]) -> StoreResult<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let sql = format!(
            "DELETE FROM analysis WHERE {} IN ({})",
            kind.column(),
            placeholders(items.len())
        );
        let deleted = conn.execute(&sql, params_from_iter(items.iter()))?;
        Ok(deleted)
    }
}

/// `?1, ?2, ...` list for an IN clause of `n` values.
fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 1..=n {
        if i > 1 {
            s.push(',');
        }
        s.push('?');
        s.push_str(&i.to_string());
    }
    s
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn row_to_binary(row: &rusqlite::Row<'_>) -> rusqlite::Result<Binary> {
    Ok(Binary {
        id: row.get(0)?,
        sha256: row.get(1)?,
        available: row.get(2)?,
    })
}

fn row_to_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnalysisResult> {
    let scan_time: String = row.get(6)?;
    let payload: Option<String> = row.get(7)?;
    Ok(AnalysisResult {
        id: row.get(0)?,
        sha256: row.get(1)?,
        connector_name: row.get(2)?,
        analysis_name: row.get(3)?,
        score: row.get(4)?,
        error: row.get(5)?,
        scan_time: DateTime::parse_from_rfc3339(&scan_time)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        payload: payload
            .and_then(|p| serde_json::from_str(&p).ok())
            .unwrap_or(serde_json::Value::Null),
        job_id: row.get(8)?,
        dispatched: row.get(9)?,
        iocs: Vec::new(),
    })
}

fn row_to_ioc(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ioc> {
    let match_type: String = row.get(2)?;
    let values_json: String = row.get(3)?;
    Ok(Ioc {
        id: row.get(0)?,
        analysis_id: row.get(1)?,
        match_type: MatchType::parse(&match_type).unwrap_or(MatchType::Equality),
        values: serde_json::from_str(&values_json).unwrap_or_default(),
        field: row.get(4)?,
        link: row.get(5)?,
    })
}
