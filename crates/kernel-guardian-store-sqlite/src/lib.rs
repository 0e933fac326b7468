#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kernel_guardian_core::{
    AuditEventDraft, AuditRecordKind, GuardianError, ProtectedTable, TriggerMarkers,
    WriteOperation,
};
use rusqlite::{params, Connection, ErrorCode};

pub const SEED_EVENT_TYPE: &str = "kernel.guardian";
const EVENTS_TABLE: &str = "events";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct MigrationFile {
    pub path: PathBuf,
}

impl MigrationFile {
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map_or_else(String::new, |name| name.to_string_lossy().into_owned())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct TriggerDefinition {
    pub name: String,
    pub sql: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ImmutabilityReport {
    pub table: String,
    pub triggers: Vec<String>,
    pub markers: TriggerMarkers,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SeededAuditGraph {
    pub seeded_at: i64,
    pub user_id: String,
    pub agent_id: String,
    pub event_id: String,
    pub event_hash: String,
    pub receipt_id: String,
}

impl SeededAuditGraph {
    #[must_use]
    pub fn key_for(&self, record: AuditRecordKind) -> &str {
        match record {
            AuditRecordKind::Event => &self.event_id,
            AuditRecordKind::Receipt => &self.receipt_id,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct AppendOnlyProof {
    pub table: String,
    pub update_rejection: String,
    pub delete_rejection: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ChainBreak {
    pub event_id: String,
    pub expected_prev_hash: Option<String>,
    pub found_prev_hash: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ChainReport {
    pub events: usize,
    pub chain_valid: bool,
    pub first_break: Option<ChainBreak>,
}

/// Returns the sorted migration files of the first candidate directory that has any.
///
/// Candidates that do not exist or hold no matching files are skipped; sets
/// from different directories are never merged.
pub fn discover_migrations(candidates: &[PathBuf], extension: &str) -> Result<Vec<MigrationFile>> {
    for dir in candidates {
        if !dir.is_dir() {
            continue;
        }

        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to list migrations in {}", dir.display()))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("failed to read entry in {}", dir.display()))?
                .path();
            if path.is_file() && has_extension(&path, extension) {
                files.push(MigrationFile { path });
            }
        }

        if !files.is_empty() {
            files.sort_by_key(MigrationFile::file_name);
            tracing::debug!(
                dir = %dir.display(),
                count = files.len(),
                "discovered migrations"
            );
            return Ok(files);
        }
    }

    Err(GuardianError::MigrationsNotFound {
        searched: candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    }
    .into())
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension.trim_start_matches('.')))
}

/// Ephemeral in-memory database scoped to one guardian run.
///
/// The database disappears when the value is dropped.
pub struct GuardianDb {
    conn: Connection,
}

impl GuardianDb {
    pub fn open_ephemeral() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Applies every file in order; the first failure aborts the whole run.
    pub fn apply_migrations(&self, files: &[MigrationFile]) -> Result<usize> {
        for file in files {
            let sql = std::fs::read_to_string(&file.path).map_err(|err| {
                GuardianError::Migration {
                    file: file.path.display().to_string(),
                    reason: err.to_string(),
                }
            })?;
            self.apply_migration_sql(&file.path.display().to_string(), &sql)?;
        }
        Ok(files.len())
    }

    pub fn apply_migration_sql(&self, label: &str, sql: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .map_err(|err| GuardianError::Migration {
                file: label.to_string(),
                reason: err.to_string(),
            })?;
        tracing::info!(migration = label, "applied migration");
        Ok(())
    }

    pub fn trigger_definitions(&self, table: &str) -> Result<Vec<TriggerDefinition>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, sql
             FROM sqlite_master
             WHERE type = 'trigger' AND tbl_name = ?1 COLLATE NOCASE
             ORDER BY name ASC",
        )?;
        let rows = stmt.query_map(params![table], |row| {
            Ok(TriggerDefinition {
                name: row.get(0)?,
                sql: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            })
        })?;

        let mut triggers = Vec::new();
        for row in rows {
            triggers.push(row.with_context(|| format!("failed to read triggers for {table}"))?);
        }
        Ok(triggers)
    }

    /// Checks that the triggers on `table` mention UPDATE, DELETE and an abort.
    pub fn verify_immutable(&self, table: &str) -> Result<ImmutabilityReport> {
        let triggers = self.trigger_definitions(table)?;
        let bodies = triggers
            .iter()
            .map(|trigger| trigger.sql.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let markers = TriggerMarkers::scan(&bodies);

        if !markers.is_complete() {
            return Err(GuardianError::ImmutabilityViolation {
                table: table.to_string(),
                missing: markers.missing().join(", "),
            }
            .into());
        }

        Ok(ImmutabilityReport {
            table: table.to_string(),
            triggers: triggers.into_iter().map(|trigger| trigger.name).collect(),
            markers,
        })
    }

    /// Inserts one user, agent, event and receipt, in foreign-key order.
    ///
    /// Identifiers derive from `seeded_at` so separate runs never collide. The
    /// event extends whatever chain the migrations left behind.
    pub fn seed_audit_graph(&self, seeded_at: i64) -> Result<SeededAuditGraph> {
        let user_id = format!("user_guardian_{seeded_at}");
        let agent_id = format!("agent_guardian_{seeded_at}");
        let event_id = format!("evt_guardian_{seeded_at}");
        let receipt_id = format!("rcpt_guardian_{seeded_at}");

        self.conn
            .execute(
                "INSERT INTO users (user_id, created_at) VALUES (?1, ?2)",
                params![user_id, seeded_at],
            )
            .map_err(|err| seed_error("users", &err))?;

        self.conn
            .execute(
                "INSERT INTO agents (agent_id, user_id, status, created_at, updated_at)
                 VALUES (?1, ?2, 'active', ?3, ?3)",
                params![agent_id, user_id, seeded_at],
            )
            .map_err(|err| seed_error("agents", &err))?;

        let prev_hash = self
            .latest_event_hash()
            .map_err(|err| seed_error(EVENTS_TABLE, &err))?;
        let draft = AuditEventDraft {
            event_id: event_id.clone(),
            agent_id: agent_id.clone(),
            user_id: user_id.clone(),
            event_type: SEED_EVENT_TYPE.to_string(),
            payload_json: "{}".to_string(),
            occurred_at: seeded_at,
            prev_hash,
        };
        let event_hash = draft.content_hash();

        self.conn
            .execute(
                "INSERT INTO events (
                    event_id, agent_id, user_id, type, payload_json,
                    occurred_at, created_at, hash, prev_hash
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?8)",
                params![
                    draft.event_id,
                    draft.agent_id,
                    draft.user_id,
                    draft.event_type,
                    draft.payload_json,
                    seeded_at,
                    event_hash,
                    draft.prev_hash,
                ],
            )
            .map_err(|err| seed_error(EVENTS_TABLE, &err))?;

        self.conn
            .execute(
                "INSERT INTO receipts (
                    receipt_id, agent_id, user_id, source, event_id, external_ref,
                    what_happened, why_changed, what_happens_next, occurred_at, created_at
                 ) VALUES (?1, ?2, ?3, 'policy', ?4, 'guardian', ?5, ?6, ?7, ?8, ?8)",
                params![
                    receipt_id,
                    agent_id,
                    user_id,
                    event_id,
                    "Guardian test insert.",
                    "Pre-deployment immutability proof.",
                    "Guardian will attempt forbidden writes.",
                    seeded_at,
                ],
            )
            .map_err(|err| seed_error("receipts", &err))?;

        tracing::info!(%event_id, %receipt_id, "seeded audit graph");

        Ok(SeededAuditGraph {
            seeded_at,
            user_id,
            agent_id,
            event_id,
            event_hash,
            receipt_id,
        })
    }

    /// Attempts a self-assigning UPDATE and a DELETE on the row keyed by
    /// `pk_value`. Both must be rejected by the engine and the row must survive.
    pub fn prove_append_only(&self, table: &ProtectedTable, pk_value: &str) -> Result<AppendOnlyProof> {
        let name = quote_ident(&table.name);
        let pk = quote_ident(&table.primary_key);
        let column = quote_ident(&table.probe_column);

        let update_rejection = self.attempt_forbidden_write(
            &table.name,
            WriteOperation::Update,
            &format!("UPDATE {name} SET {column} = {column} WHERE {pk} = ?1"),
            pk_value,
        )?;
        let delete_rejection = self.attempt_forbidden_write(
            &table.name,
            WriteOperation::Delete,
            &format!("DELETE FROM {name} WHERE {pk} = ?1"),
            pk_value,
        )?;

        let remaining: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {name} WHERE {pk} = ?1"),
                params![pk_value],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to re-read {} after forbidden writes", table.name))?;
        if remaining != 1 {
            return Err(GuardianError::AppendOnlyViolation {
                table: table.name.clone(),
                operation: WriteOperation::Delete,
                detail: format!("seeded row count is {remaining} after forbidden writes"),
            }
            .into());
        }

        Ok(AppendOnlyProof {
            table: table.name.clone(),
            update_rejection,
            delete_rejection,
        })
    }

    fn attempt_forbidden_write(
        &self,
        table: &str,
        operation: WriteOperation,
        sql: &str,
        pk_value: &str,
    ) -> Result<String> {
        match self.conn.execute(sql, params![pk_value]) {
            Ok(changed) => Err(GuardianError::AppendOnlyViolation {
                table: table.to_string(),
                operation,
                detail: format!("statement succeeded and changed {changed} row(s)"),
            }
            .into()),
            Err(err) => match engine_rejection(&err) {
                Some(message) => {
                    tracing::debug!(table, %operation, %message, "forbidden write rejected");
                    Ok(message)
                }
                None => Err(GuardianError::AppendOnlyViolation {
                    table: table.to_string(),
                    operation,
                    detail: format!("failed without an engine rejection: {err}"),
                }
                .into()),
            },
        }
    }

    /// Follows `prev_hash` links from the root event and reports the first
    /// event that does not extend the chain.
    ///
    /// Row order never depends on `rowid`, so `WITHOUT ROWID` event tables are
    /// walked the same way.
    pub fn verify_event_chain(&self) -> Result<ChainReport> {
        let rows = self
            .chain_rows()
            .context("failed to read event chain rows")?;
        let walk = ChainWalk::follow(&rows);

        Ok(ChainReport {
            events: rows.len(),
            chain_valid: walk.first_break.is_none(),
            first_break: walk.first_break,
        })
    }

    fn chain_rows(&self) -> rusqlite::Result<Vec<ChainRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, hash, prev_hash
             FROM events
             ORDER BY occurred_at ASC, created_at ASC, event_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ChainRow {
                event_id: row.get(0)?,
                hash: row.get(1)?,
                prev_hash: row.get(2)?,
            })
        })?;
        rows.collect()
    }

    /// Hash at the end of the linked chain, or `None` for an empty log.
    fn latest_event_hash(&self) -> rusqlite::Result<Option<String>> {
        Ok(ChainWalk::follow(&self.chain_rows()?).tip)
    }
}

struct ChainRow {
    event_id: String,
    hash: String,
    prev_hash: Option<String>,
}

struct ChainWalk {
    tip: Option<String>,
    first_break: Option<ChainBreak>,
}

impl ChainWalk {
    /// Repeatedly takes the first unvisited row whose `prev_hash` equals the
    /// current tip. Whatever is left once no row links on is a break.
    fn follow(rows: &[ChainRow]) -> Self {
        let mut visited = vec![false; rows.len()];
        let mut tip: Option<String> = None;

        loop {
            let next = (0..rows.len()).find(|&idx| !visited[idx] && rows[idx].prev_hash == tip);
            let Some(idx) = next else {
                break;
            };
            visited[idx] = true;
            tip = Some(rows[idx].hash.clone());
        }

        let first_break = rows
            .iter()
            .zip(&visited)
            .find(|(_, seen)| !**seen)
            .map(|(row, _)| ChainBreak {
                event_id: row.event_id.clone(),
                expected_prev_hash: tip.clone(),
                found_prev_hash: row.prev_hash.clone(),
            });

        Self { tip, first_break }
    }
}

/// Message of an engine-level rejection, or `None` for any other failure.
///
/// Foreign-key violations are excluded: they block a delete only while the row
/// is still referenced, which says nothing about append-only enforcement.
fn engine_rejection(err: &rusqlite::Error) -> Option<String> {
    match err {
        rusqlite::Error::SqliteFailure(code, message)
            if code.code == ErrorCode::ConstraintViolation
                && code.extended_code != rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
        {
            Some(message.clone().unwrap_or_else(|| code.to_string()))
        }
        _ => None,
    }
}

fn seed_error(table: &str, err: &rusqlite::Error) -> GuardianError {
    GuardianError::Seed {
        table: table.to_string(),
        reason: err.to_string(),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
