use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use plot_annotation_core::{AnnotationRow, PairSelection, PlotRecord, Session};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const KEY_ANNOTATOR_ID: &str = "annotator_id";
const KEY_PAIR_A: &str = "pair_a";
const KEY_PAIR_B: &str = "pair_b";
const KEY_SINGLE: &str = "single";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS plots (
  position INTEGER PRIMARY KEY,
  plot_id TEXT NOT NULL UNIQUE,
  record_json TEXT NOT NULL,
  loaded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS gold_plots (
  plot_id TEXT PRIMARY KEY,
  FOREIGN KEY (plot_id) REFERENCES plots(plot_id)
);

CREATE TABLE IF NOT EXISTS annotations (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  annotator_id TEXT NOT NULL,
  is_calibration INTEGER NOT NULL CHECK (is_calibration IN (0, 1)),
  recorded_at TEXT NOT NULL,
  row_json TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS annotations_append_only
BEFORE UPDATE ON annotations
BEGIN
  SELECT RAISE(ABORT, 'annotations are append-only');
END;

CREATE TABLE IF NOT EXISTS session_state (
  key TEXT PRIMARY KEY CHECK (key IN ('annotator_id','pair_a','pair_b','single')),
  value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_annotations_annotator ON annotations(annotator_id);
";

/// Durable copy of one operator [`Session`], so the CLI keeps its state between runs.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed session store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when a migration step fails or the database is newer than supported.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            tracing::debug!("applied schema migration v1");
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Rebuild the persisted session: plots in load order, gold set, annotations in
    /// submission order, annotator and selection.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or stored JSON cannot be decoded.
    pub fn load_session(&self) -> Result<Session> {
        let plots = self.list_plots()?;
        let gold = self.list_gold()?;
        let annotations = self.list_annotations()?;

        let annotator_id = self.state_value(KEY_ANNOTATOR_ID)?.unwrap_or_default();
        let default_pair = PairSelection::default();
        let pair = PairSelection {
            a: self.state_index(KEY_PAIR_A)?.unwrap_or(default_pair.a),
            b: self.state_index(KEY_PAIR_B)?.unwrap_or(default_pair.b),
        };
        let single = self.state_index(KEY_SINGLE)?.unwrap_or(0);

        Ok(Session::restore(annotator_id, plots, gold, annotations, pair, single))
    }

    /// Append newly admitted plots after the existing ones. Identities already stored
    /// are ignored; returns how many rows were inserted.
    ///
    /// # Errors
    /// Returns an error when serialization or any insert fails.
    pub fn append_plots(&mut self, plots: &[PlotRecord]) -> Result<usize> {
        let loaded_at = now_rfc3339()?;
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let mut inserted = 0;
        for plot in plots {
            inserted += tx
                .execute(
                    "INSERT OR IGNORE INTO plots(plot_id, record_json, loaded_at) VALUES (?1, ?2, ?3)",
                    params![
                        plot.plot_id(),
                        serde_json::to_string(plot).context("failed to serialize plot record")?,
                        loaded_at,
                    ],
                )
                .context("failed to insert plot")?;
        }
        tx.commit().context("failed to commit plot transaction")?;
        Ok(inserted)
    }

    /// Replace the stored gold set wholesale.
    ///
    /// # Errors
    /// Returns an error when an id does not reference a stored plot or a write fails.
    pub fn replace_gold(&mut self, gold: &BTreeSet<String>) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute("DELETE FROM gold_plots", []).context("failed to clear gold plots")?;
        for plot_id in gold {
            tx.execute("INSERT INTO gold_plots(plot_id) VALUES (?1)", params![plot_id])
                .with_context(|| format!("failed to mark gold plot {plot_id}"))?;
        }
        tx.commit().context("failed to commit gold transaction")?;
        Ok(())
    }

    /// Append one annotation row. Stored rows are never updated.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn append_annotation(&mut self, row: &AnnotationRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO annotations(annotator_id, is_calibration, recorded_at, row_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    row.annotator_id().unwrap_or_default(),
                    row.is_calibration().unwrap_or(false),
                    now_rfc3339()?,
                    serde_json::to_string(row).context("failed to serialize annotation row")?,
                ],
            )
            .context("failed to insert annotation")?;
        Ok(())
    }

    /// Delete plots, the gold set and the selection. Annotations are kept.
    ///
    /// # Errors
    /// Returns an error when any delete fails.
    pub fn clear_plots(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute("DELETE FROM gold_plots", []).context("failed to clear gold plots")?;
        tx.execute("DELETE FROM plots", []).context("failed to clear plots")?;
        tx.execute(
            "DELETE FROM session_state WHERE key IN (?1, ?2, ?3)",
            params![KEY_PAIR_A, KEY_PAIR_B, KEY_SINGLE],
        )
        .context("failed to reset selection")?;
        tx.commit().context("failed to commit clear transaction")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn clear_annotations(&mut self) -> Result<()> {
        self.conn.execute("DELETE FROM annotations", []).context("failed to clear annotations")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the write fails.
    pub fn set_annotator(&mut self, annotator_id: &str) -> Result<()> {
        self.put_state(KEY_ANNOTATOR_ID, annotator_id)
    }

    /// Persist the pair and single selection indices.
    ///
    /// # Errors
    /// Returns an error when any write fails.
    pub fn save_selection(&mut self, pair: PairSelection, single: usize) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        for (key, value) in [(KEY_PAIR_A, pair.a), (KEY_PAIR_B, pair.b), (KEY_SINGLE, single)] {
            upsert_state(&tx, key, &value.to_string())?;
        }
        tx.commit().context("failed to commit selection transaction")?;
        Ok(())
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn list_plots(&self) -> Result<Vec<PlotRecord>> {
        let mut stmt =
            self.conn.prepare("SELECT plot_id, record_json FROM plots ORDER BY position ASC")?;
        let mut rows = stmt.query([])?;
        let mut plots = Vec::new();

        while let Some(row) = rows.next()? {
            let plot_id: String = row.get(0)?;
            let raw: String = row.get(1)?;
            let plot: PlotRecord = serde_json::from_str(&raw)
                .with_context(|| format!("failed to decode stored plot {plot_id}"))?;
            plots.push(plot);
        }
        Ok(plots)
    }

    fn list_gold(&self) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare("SELECT plot_id FROM gold_plots ORDER BY plot_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut gold = BTreeSet::new();
        for row in rows {
            gold.insert(row?);
        }
        Ok(gold)
    }

    fn list_annotations(&self) -> Result<Vec<AnnotationRow>> {
        let mut stmt = self.conn.prepare("SELECT seq, row_json FROM annotations ORDER BY seq ASC")?;
        let mut rows = stmt.query([])?;
        let mut annotations = Vec::new();

        while let Some(row) = rows.next()? {
            let seq: i64 = row.get(0)?;
            let raw: String = row.get(1)?;
            let annotation: AnnotationRow = serde_json::from_str(&raw)
                .with_context(|| format!("failed to decode stored annotation {seq}"))?;
            annotations.push(annotation);
        }
        Ok(annotations)
    }

    fn state_value(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM session_state WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .with_context(|| format!("failed to read session state {key}"))
    }

    fn state_index(&self, key: &str) -> Result<Option<usize>> {
        self.state_value(key)?
            .map(|raw| {
                raw.parse::<usize>()
                    .with_context(|| format!("invalid stored index for {key}: {raw}"))
            })
            .transpose()
    }

    fn put_state(&mut self, key: &str, value: &str) -> Result<()> {
        upsert_state(&self.conn, key, value)
    }
}

fn upsert_state(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO session_state(key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )
    .with_context(|| format!("failed to write session state {key}"))?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
