use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, ErrorCode};
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS policy_metadata (
            id                   INTEGER PRIMARY KEY,
            policy_id            TEXT NOT NULL UNIQUE,
            specialty            TEXT NOT NULL CHECK(json_valid(specialty)),
            client_interest_flag TEXT NOT NULL CHECK(json_valid(client_interest_flag)),
            policy_type          TEXT NOT NULL,
            payer                TEXT NOT NULL,
            topic_keywords       TEXT NOT NULL CHECK(json_valid(topic_keywords)),
            update_type          TEXT NOT NULL,
            effective_date       TEXT NOT NULL,
            jurisdiction         TEXT NOT NULL CHECK(json_valid(jurisdiction)),
            urgency_level        INTEGER NOT NULL,
            source_url           TEXT,
            loaded_at            TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_policy_source ON policy_metadata(source_url);
        CREATE INDEX IF NOT EXISTS idx_policy_payer ON policy_metadata(payer);

        CREATE TABLE IF NOT EXISTS ingest_failures (
            id             INTEGER PRIMARY KEY,
            run_id         TEXT NOT NULL,
            url            TEXT NOT NULL,
            effective_date TEXT,
            stage          TEXT NOT NULL,
            error          TEXT NOT NULL,
            failed_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_failures_url ON ingest_failures(url);

        CREATE TABLE IF NOT EXISTS skipped_documents (
            url        TEXT PRIMARY KEY,
            policy_id  TEXT NOT NULL,
            run_id     TEXT NOT NULL,
            skipped_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS ingest_runs (
            run_id      TEXT PRIMARY KEY,
            attempted   INTEGER NOT NULL,
            succeeded   INTEGER NOT NULL,
            skipped     INTEGER NOT NULL,
            failed      INTEGER NOT NULL,
            finished_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

// ── Policy metadata ──

pub const UNKNOWN_POLICY_ID: &str = "UNKNOWN";

/// The canonical record, one row of `policy_metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMetadata {
    pub policy_id: String,
    pub specialty: Vec<String>,
    pub client_interest_flag: Vec<String>,
    pub policy_type: String,
    pub payer: String,
    pub topic_keywords: Vec<String>,
    pub update_type: String,
    /// ISO-8601 date.
    pub effective_date: String,
    pub jurisdiction: Vec<String>,
    pub urgency_level: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl PolicyMetadata {
    pub fn has_sentinel_id(&self) -> bool {
        self.policy_id == UNKNOWN_POLICY_ID
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Inserted,
    /// A row with this policy_id already exists; nothing was written.
    Skipped,
}

/// Insert one record. A duplicate policy_id is a skip, not an error.
///
/// List columns go through SQLite's `json()` so the store parses them; the
/// transaction rolls back on drop, so a failed insert leaves no row.
pub fn insert_policy(conn: &Connection, m: &PolicyMetadata) -> Result<LoadOutcome, LoadError> {
    let specialty = serde_json::to_string(&m.specialty)?;
    let interest = serde_json::to_string(&m.client_interest_flag)?;
    let keywords = serde_json::to_string(&m.topic_keywords)?;
    let jurisdiction = serde_json::to_string(&m.jurisdiction)?;

    let tx = conn.unchecked_transaction()?;
    let res = tx.execute(
        "INSERT INTO policy_metadata
         (policy_id, specialty, client_interest_flag, policy_type, payer,
          topic_keywords, update_type, effective_date, jurisdiction, urgency_level, source_url)
         VALUES (?1, json(?2), json(?3), ?4, ?5, json(?6), ?7, ?8, json(?9), ?10, ?11)",
        rusqlite::params![
            m.policy_id, specialty, interest, m.policy_type, m.payer,
            keywords, m.update_type, m.effective_date, jurisdiction, m.urgency_level, m.source_url,
        ],
    );

    match res {
        Ok(_) => {
            tx.commit()?;
            Ok(LoadOutcome::Inserted)
        }
        Err(e) if is_unique_violation(&e) => Ok(LoadOutcome::Skipped),
        Err(e) => Err(e.into()),
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, msg) => {
            code.code == ErrorCode::ConstraintViolation
                && (code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || msg.as_deref().is_some_and(|m| m.contains("UNIQUE")))
        }
        _ => false,
    }
}

pub fn fetch_policy(conn: &Connection, policy_id: &str) -> Result<Option<PolicyMetadata>, LoadError> {
    let mut stmt = conn.prepare(
        "SELECT policy_id, specialty, client_interest_flag, policy_type, payer,
                topic_keywords, update_type, effective_date, jurisdiction, urgency_level, source_url
         FROM policy_metadata WHERE policy_id = ?1",
    )?;
    let mut rows = stmt.query([policy_id])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let list = |i: usize| -> Result<Vec<String>, LoadError> {
        let raw: String = row.get(i)?;
        Ok(serde_json::from_str(&raw)?)
    };
    Ok(Some(PolicyMetadata {
        policy_id: row.get(0)?,
        specialty: list(1)?,
        client_interest_flag: list(2)?,
        policy_type: row.get(3)?,
        payer: row.get(4)?,
        topic_keywords: list(5)?,
        update_type: row.get(6)?,
        effective_date: row.get(7)?,
        jurisdiction: list(8)?,
        urgency_level: row.get(9)?,
        source_url: row.get(10)?,
    }))
}

/// Whether a document URL was already loaded, or extracted and found to be a duplicate.
pub fn is_known_url(conn: &Connection, url: &str) -> Result<bool, LoadError> {
    let known: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM policy_metadata WHERE source_url = ?1)
             OR EXISTS(SELECT 1 FROM skipped_documents WHERE url = ?1)",
        [url],
        |r| r.get(0),
    )?;
    Ok(known)
}

// ── Run bookkeeping ──

pub fn record_failure(
    conn: &Connection,
    run_id: &str,
    url: &str,
    effective_date: Option<&str>,
    stage: &str,
    error: &str,
) -> Result<(), LoadError> {
    conn.execute(
        "INSERT INTO ingest_failures (run_id, url, effective_date, stage, error)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![run_id, url, effective_date, stage, error],
    )?;
    Ok(())
}

/// Remember a URL whose policy_id was already stored, so later runs don't re-extract it.
pub fn record_skip(conn: &Connection, run_id: &str, url: &str, policy_id: &str) -> Result<(), LoadError> {
    conn.execute(
        "INSERT OR REPLACE INTO skipped_documents (url, policy_id, run_id) VALUES (?1, ?2, ?3)",
        rusqlite::params![url, policy_id, run_id],
    )?;
    Ok(())
}

pub struct RunRow<'a> {
    pub run_id: &'a str,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub fn record_run(conn: &Connection, run: &RunRow) -> Result<(), LoadError> {
    conn.execute(
        "INSERT OR REPLACE INTO ingest_runs (run_id, attempted, succeeded, skipped, failed)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![run.run_id, run.attempted, run.succeeded, run.skipped, run.failed],
    )?;
    Ok(())
}

// ── Overview ──

pub struct OverviewRow {
    pub policy_id: String,
    pub payer: String,
    pub policy_type: String,
    pub update_type: String,
    pub effective_date: String,
    pub urgency_level: i64,
    pub topic_keywords: String,
}

pub fn fetch_overview(conn: &Connection, payer: Option<&str>, limit: usize) -> Result<Vec<OverviewRow>> {
    let (where_clause, params): (&str, Vec<&dyn rusqlite::types::ToSql>) = match &payer {
        Some(p) => (" WHERE payer = ?1", vec![p as &dyn rusqlite::types::ToSql]),
        None => ("", Vec::new()),
    };

    let sql = format!(
        "SELECT policy_id, payer, policy_type, update_type, effective_date, urgency_level,
                (SELECT COALESCE(group_concat(value, ', '), '') FROM json_each(topic_keywords))
         FROM policy_metadata{}
         ORDER BY effective_date DESC, policy_id
         LIMIT {}",
        where_clause, limit
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params.as_slice(), |row| {
            Ok(OverviewRow {
                policy_id: row.get(0)?,
                payer: row.get(1)?,
                policy_type: row.get(2)?,
                update_type: row.get(3)?,
                effective_date: row.get(4)?,
                urgency_level: row.get(5)?,
                topic_keywords: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub policies: usize,
    pub with_source: usize,
    pub skipped_urls: usize,
    pub unknown_ids: usize,
    pub runs: usize,
    pub failures: usize,
    pub failed_urls: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let count = |sql: &str| -> Result<usize> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };
    Ok(Stats {
        policies: count("SELECT COUNT(*) FROM policy_metadata")?,
        with_source: count("SELECT COUNT(*) FROM policy_metadata WHERE source_url IS NOT NULL")?,
        skipped_urls: count("SELECT COUNT(*) FROM skipped_documents")?,
        unknown_ids: count("SELECT COUNT(*) FROM policy_metadata WHERE policy_id = 'UNKNOWN'")?,
        runs: count("SELECT COUNT(*) FROM ingest_runs")?,
        failures: count("SELECT COUNT(*) FROM ingest_failures")?,
        failed_urls: count(
            "SELECT COUNT(DISTINCT f.url) FROM ingest_failures f
             WHERE NOT EXISTS (SELECT 1 FROM policy_metadata p WHERE p.source_url = f.url)",
        )?,
    })
}
