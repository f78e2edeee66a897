//! SQLite implementation of [`Persistence`]
//!
//! # Schema versions
//!
//! The current version lives in `metadata.schema_version`. Migrations are
//! idempotent: columns are only added after checking `pragma_table_info`, so a
//! crash between an `ALTER TABLE` and the version bump is harmless. Databases
//! written by older releases (which had no `metadata` table) are upgraded in
//! place.

use std::path::Path;

use anyhow::{Context, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::Value;

use super::{ListFilter, NewRequest, Persistence, RequestLookup, StoredRequest, CHAT_COMPLETIONS_SUFFIX};
use crate::merge::merge_event_stream;

/// Every column of `moonshot_requests` except `response_body`
const COLUMNS: &str = "id, request_method, request_path, request_query, request_content_type, \
    request_id, moonshot_id, moonshot_gid, moonshot_uid, moonshot_request_id, \
    moonshot_server_timing, response_status_code, response_content_type, request_header, \
    request_body, response_header, error, response_ttft, response_tpot, response_otps, \
    latency, endpoint, warnings, created_at";

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and bring the schema up to date
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA busy_timeout=5000;")?;
            register_functions(conn)
        });
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .with_context(|| format!("Failed to open database {}", path.display()))?;

        let conn = pool.get()?;
        init_schema(&conn)?;
        drop(conn);

        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }
}

/// Register `merge_cmpl(text)`, which folds an event-stream body into one JSON object
fn register_functions(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "merge_cmpl",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let body: Option<String> = ctx.get(0)?;
            Ok(body.map(|b| Value::Object(merge_event_stream(&b)).to_string()))
        },
    )
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(
                (SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'schema_version'),
                0
            )",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_schema_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v1_to_v2(conn)?;
    }

    Ok(())
}

/// Initial schema (v1)
fn apply_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS moonshot_requests (
            id                     INTEGER NOT NULL
                CONSTRAINT moonshot_requests_pk PRIMARY KEY AUTOINCREMENT,
            request_method         TEXT    NOT NULL,
            request_path           TEXT    NOT NULL,
            request_query          TEXT    NOT NULL,
            request_content_type   TEXT,
            request_id             TEXT,
            moonshot_id            TEXT,
            moonshot_gid           TEXT,
            moonshot_uid           TEXT,
            moonshot_request_id    TEXT,
            moonshot_server_timing INTEGER,
            response_status_code   INTEGER,
            response_content_type  TEXT,
            request_header         TEXT,
            request_body           TEXT,
            response_header        TEXT,
            response_body          TEXT,
            error                  TEXT,
            response_ttft          INTEGER,
            latency                INTEGER,
            endpoint               TEXT,
            created_at             TEXT DEFAULT (datetime('now', 'localtime')) NOT NULL
        );

        CREATE INDEX IF NOT EXISTS moonshot_requests_moonshot_id
            ON moonshot_requests (moonshot_id);
        CREATE INDEX IF NOT EXISTS moonshot_requests_moonshot_request_id
            ON moonshot_requests (moonshot_request_id);

        CREATE TABLE IF NOT EXISTS moonshot_caches (
            cache_id     TEXT    NOT NULL PRIMARY KEY,
            hash         TEXT    NOT NULL,
            n_bytes      INTEGER NOT NULL,
            key_hash     TEXT    NOT NULL,
            created_at   TEXT    NOT NULL,
            last_used_at TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS moonshot_caches_key_hash
            ON moonshot_caches (key_hash, hash);
        "#,
    )?;

    // Tables created by older releases may predate these columns
    add_column_if_missing(conn, "moonshot_requests", "response_ttft", "INTEGER")?;
    add_column_if_missing(conn, "moonshot_requests", "latency", "INTEGER")?;
    add_column_if_missing(conn, "moonshot_requests", "endpoint", "TEXT")?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', '1')",
        [],
    )?;
    tracing::info!("Initialized request database schema v1");
    Ok(())
}

/// Migration from v1 to v2 (adds tpot, otps and warnings)
fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
    add_column_if_missing(conn, "moonshot_requests", "response_tpot", "INTEGER")?;
    add_column_if_missing(conn, "moonshot_requests", "response_otps", "REAL")?;
    add_column_if_missing(conn, "moonshot_requests", "warnings", "TEXT")?;

    conn.execute(
        "UPDATE metadata SET value = '2' WHERE key = 'schema_version'",
        [],
    )?;

    tracing::info!("Migrated request database from v1 to v2");
    Ok(())
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        &format!(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('{}') WHERE name = ?1",
            table
        ),
        params![column],
        |row| row.get(0),
    )?;
    if !exists {
        conn.execute(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl), [])?;
    }
    Ok(())
}

fn nonempty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

fn nonzero(n: i64) -> Option<i64> {
    (n != 0).then_some(n)
}

fn row_to_request(row: &Row<'_>) -> rusqlite::Result<StoredRequest> {
    Ok(StoredRequest {
        id: row.get("id")?,
        request_method: row.get("request_method")?,
        request_path: row.get("request_path")?,
        request_query: row.get("request_query")?,
        request_content_type: row.get("request_content_type")?,
        request_id: row.get("request_id")?,
        moonshot_id: row.get("moonshot_id")?,
        moonshot_gid: row.get("moonshot_gid")?,
        moonshot_uid: row.get("moonshot_uid")?,
        moonshot_request_id: row.get("moonshot_request_id")?,
        moonshot_server_timing: row.get("moonshot_server_timing")?,
        response_status_code: row.get("response_status_code")?,
        response_content_type: row.get("response_content_type")?,
        request_header: row.get("request_header")?,
        request_body: row.get("request_body")?,
        response_header: row.get("response_header")?,
        response_body: row.get("response_body")?,
        error: row.get("error")?,
        response_ttft: row.get("response_ttft")?,
        response_tpot: row.get("response_tpot")?,
        response_otps: row.get("response_otps")?,
        latency: row.get("latency")?,
        endpoint: row.get("endpoint")?,
        warnings: row.get("warnings")?,
        created_at: row.get("created_at")?,
        category: None,
        tags: Vec::new(),
    })
}

impl Persistence for SqliteStore {
    fn insert_request(&self, r: &NewRequest) -> Result<i64> {
        let conn = self.conn()?;
        let warnings = (!r.warnings.is_empty()).then(|| r.warnings.join("\n"));
        let otps = (r.response_otps > 0.0).then_some(r.response_otps);
        conn.execute(
            r#"
            INSERT INTO moonshot_requests (
                request_method, request_path, request_query, created_at,
                request_content_type, request_id, moonshot_id, moonshot_gid, moonshot_uid,
                moonshot_request_id, moonshot_server_timing, response_status_code,
                response_content_type, request_header, request_body, response_header,
                response_body, error, response_ttft, response_tpot, response_otps,
                latency, endpoint, warnings
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24
            )
            "#,
            params![
                r.request_method,
                r.request_path,
                r.request_query,
                r.created_at,
                nonempty(&r.request_content_type),
                nonempty(&r.request_id),
                nonempty(&r.moonshot_id),
                nonempty(&r.moonshot_gid),
                nonempty(&r.moonshot_uid),
                nonempty(&r.moonshot_request_id),
                nonzero(r.moonshot_server_timing),
                nonzero(r.response_status_code),
                nonempty(&r.response_content_type),
                nonempty(&r.request_header),
                nonempty(&r.request_body),
                nonempty(&r.response_header),
                nonempty(&r.response_body),
                nonempty(&r.error),
                nonzero(r.response_ttft),
                nonzero(r.response_tpot),
                otps,
                nonzero(r.latency),
                nonempty(&r.endpoint),
                warnings,
            ],
        )
        .context("Failed to insert request")?;
        Ok(conn.last_insert_rowid())
    }

    fn list_requests(&self, filter: &ListFilter) -> Result<Vec<StoredRequest>> {
        let mut sql = format!(
            "SELECT * FROM (
                SELECT {},
                    CASE
                        WHEN response_content_type = 'text/event-stream' AND response_body IS NOT NULL
                        THEN merge_cmpl(response_body)
                        ELSE response_body
                    END AS response_body
                FROM moonshot_requests
            )
            WHERE 1 = 1",
            COLUMNS
        );
        let mut binds: Vec<String> = Vec::new();
        if filter.chat_only {
            binds.push(format!("%{}", CHAT_COMPLETIONS_SUFFIX));
            sql.push_str(&format!(" AND request_path LIKE ?{}", binds.len()));
        }
        for predicate in filter.predicates.iter().filter(|p| !p.trim().is_empty()) {
            sql.push_str(&format!(" AND ({})", predicate));
        }
        sql.push_str(" ORDER BY id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&sql)
            .with_context(|| format!("Invalid list query: {}", sql))?;
        let rows = stmt
            .query_map(params_from_iter(binds.iter()), row_to_request)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn get_request(&self, lookup: &RequestLookup) -> Result<Option<StoredRequest>> {
        let conn = self.conn()?;
        let base = format!("SELECT {}, response_body FROM moonshot_requests", COLUMNS);
        let row = match lookup {
            RequestLookup::Id(id) => conn
                .query_row(&format!("{} WHERE id = ?1", base), params![id], row_to_request)
                .optional()?,
            RequestLookup::CompletionId(chatcmpl) => conn
                .query_row(
                    &format!("{} WHERE moonshot_id = ?1 ORDER BY id DESC LIMIT 1", base),
                    params![chatcmpl],
                    row_to_request,
                )
                .optional()?,
            RequestLookup::RequestId(request_id) => conn
                .query_row(
                    &format!("{} WHERE moonshot_request_id = ?1 ORDER BY id DESC LIMIT 1", base),
                    params![request_id],
                    row_to_request,
                )
                .optional()?,
        };
        Ok(row)
    }

    fn cleanup(&self, before: &str) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM moonshot_requests WHERE created_at < ?1",
            params![before],
        )?;
        Ok(deleted)
    }

    fn get_cache_by_hash_list(
        &self,
        hashes: &[String],
        min_bytes: usize,
        key_hash: &str,
    ) -> Result<Option<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT cache_id FROM moonshot_caches
             WHERE hash = ?1 AND key_hash = ?2 AND n_bytes >= ?3
             ORDER BY last_used_at DESC
             LIMIT 1",
        )?;
        for hash in hashes.iter().rev() {
            let found: Option<String> = stmt
                .query_row(params![hash, key_hash, min_bytes as i64], |row| row.get(0))
                .optional()?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    fn set_cache(
        &self,
        cache_id: &str,
        hash: &str,
        n_bytes: usize,
        key_hash: &str,
        now: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO moonshot_caches (cache_id, hash, n_bytes, key_hash, created_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (cache_id) DO UPDATE SET
                hash = excluded.hash,
                n_bytes = excluded.n_bytes,
                key_hash = excluded.key_hash,
                last_used_at = excluded.last_used_at",
            params![cache_id, hash, n_bytes as i64, key_hash, now],
        )?;
        Ok(())
    }

    fn touch_cache(&self, cache_id: &str, now: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE moonshot_caches SET last_used_at = ?2 WHERE cache_id = ?1",
            params![cache_id, now],
        )?;
        Ok(())
    }

    fn remove_inactive_caches(&self, key_hash: &str, before: &str) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM moonshot_caches WHERE key_hash = ?1 AND last_used_at < ?2",
            params![key_hash, before],
        )?;
        Ok(removed)
    }
}
