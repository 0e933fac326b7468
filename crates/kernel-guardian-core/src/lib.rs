//! Domain types, configuration and pure checks shared by the guardian crates.
//!
//! Nothing here touches a database. The trigger marker heuristic and the
//! ghost-state scanner operate on text so they can be exercised without SQLite.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub const REPORT_CONTRACT_VERSION: &str = "guardian_report.v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GuardianError {
    #[error("no schema migrations found (looked in {searched})")]
    MigrationsNotFound { searched: String },
    #[error("failed applying migration {file}: {reason}")]
    Migration { file: String, reason: String },
    #[error("{table} is not DB-immutable: trigger bodies lack {missing}")]
    ImmutabilityViolation { table: String, missing: String },
    #[error("{operation} on {table} was allowed; table is not append-only ({detail})")]
    AppendOnlyViolation {
        table: String,
        operation: WriteOperation,
        detail: String,
    },
    #[error("{} possible ghost-state mutation(s) in {path}", .findings.len())]
    GhostState {
        path: String,
        findings: Vec<GhostStateFinding>,
    },
    #[error("failed seeding {table}: {reason}")]
    Seed { table: String, reason: String },
    #[error("failed reading scan target {path}: {reason}")]
    ScanRead { path: String, reason: String },
    #[error("event hash chain broken at {event_id}: expected prev_hash {expected}, found {found}")]
    BrokenHashChain {
        event_id: String,
        expected: String,
        found: String,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperation {
    Update,
    Delete,
}

impl WriteOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl Display for WriteOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stages in execution order. There are no backward transitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GuardianStage {
    Load,
    Verify,
    Seed,
    Prove,
    Chain,
    Scan,
}

impl GuardianStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Verify => "verify",
            Self::Seed => "seed",
            Self::Prove => "prove",
            Self::Chain => "chain",
            Self::Scan => "scan",
        }
    }

    /// Stage that follows `self`, or `None` once the run can only pass.
    ///
    /// `Chain` is entered only when chain verification is enabled.
    #[must_use]
    pub fn next(self, verify_event_chain: bool) -> Option<Self> {
        match self {
            Self::Load => Some(Self::Verify),
            Self::Verify => Some(Self::Seed),
            Self::Seed => Some(Self::Prove),
            Self::Prove if verify_event_chain => Some(Self::Chain),
            Self::Prove | Self::Chain => Some(Self::Scan),
            Self::Scan => None,
        }
    }
}

impl Display for GuardianStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which seeded audit row a protected table holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditRecordKind {
    Event,
    Receipt,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtectedTable {
    pub name: String,
    pub primary_key: String,
    /// Any existing column; the prover writes it to itself.
    pub probe_column: String,
    pub record: AuditRecordKind,
}

impl ProtectedTable {
    #[must_use]
    pub fn events() -> Self {
        Self {
            name: "events".to_string(),
            primary_key: "event_id".to_string(),
            probe_column: "type".to_string(),
            record: AuditRecordKind::Event,
        }
    }

    #[must_use]
    pub fn receipts() -> Self {
        Self {
            name: "receipts".to_string(),
            primary_key: "receipt_id".to_string(),
            probe_column: "what_happened".to_string(),
            record: AuditRecordKind::Receipt,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScanPolicy {
    /// Characters inspected on each side of a mutation match.
    pub window_chars: usize,
    pub correlation_tokens: Vec<String>,
    pub max_reported_findings: usize,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            window_chars: 300,
            correlation_tokens: vec![
                "event".to_string(),
                "receipt".to_string(),
                "append".to_string(),
            ],
            max_reported_findings: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GuardianConfig {
    pub repo_root: PathBuf,
    /// Tried in order; the first directory holding any migration wins.
    pub migration_dirs: Vec<PathBuf>,
    pub migration_extension: String,
    pub protected_tables: Vec<ProtectedTable>,
    pub sensitive_tables: Vec<String>,
    /// Tried in order; the first existing file is scanned.
    pub scan_targets: Vec<PathBuf>,
    pub scan_policy: ScanPolicy,
    pub verify_event_chain: bool,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            migration_dirs: vec![
                PathBuf::from("migrations"),
                PathBuf::from("db/migrations"),
                PathBuf::from("src/db/migrations"),
            ],
            migration_extension: "sql".to_string(),
            protected_tables: vec![ProtectedTable::events(), ProtectedTable::receipts()],
            sensitive_tables: ["budgets", "policies", "agents", "users", "agent_tokens"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            scan_targets: vec![
                PathBuf::from("kernel.ts"),
                PathBuf::from("src/kernel.ts"),
                PathBuf::from("src/kernel/kernel.ts"),
            ],
            scan_policy: ScanPolicy::default(),
            verify_event_chain: false,
        }
    }
}

impl GuardianConfig {
    /// Parses a JSON config; absent fields keep their defaults.
    ///
    /// # Errors
    /// Returns [`GuardianError::Configuration`] when the JSON is malformed or
    /// the resulting config fails [`GuardianConfig::validate`].
    pub fn from_json_str(raw: &str) -> Result<Self, GuardianError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| GuardianError::Configuration(format!("invalid config JSON: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`GuardianError::Configuration`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), GuardianError> {
        if self.migration_dirs.is_empty() {
            return Err(GuardianError::Configuration(
                "migration_dirs MUST list at least one directory".to_string(),
            ));
        }

        if self.migration_extension.trim().is_empty() {
            return Err(GuardianError::Configuration(
                "migration_extension MUST be provided".to_string(),
            ));
        }

        if self.protected_tables.is_empty() {
            return Err(GuardianError::Configuration(
                "protected_tables MUST list at least one table".to_string(),
            ));
        }

        let mut seen = Vec::with_capacity(self.protected_tables.len());
        for table in &self.protected_tables {
            for (field, value) in [
                ("name", &table.name),
                ("primary_key", &table.primary_key),
                ("probe_column", &table.probe_column),
            ] {
                if !is_sql_identifier(value) {
                    return Err(GuardianError::Configuration(format!(
                        "protected table {field} '{value}' is not a plain SQL identifier"
                    )));
                }
            }
            let lowered = table.name.to_ascii_lowercase();
            if seen.contains(&lowered) {
                return Err(GuardianError::Configuration(format!(
                    "protected table '{}' is listed twice",
                    table.name
                )));
            }
            seen.push(lowered);
        }

        if self.sensitive_tables.is_empty() {
            return Err(GuardianError::Configuration(
                "sensitive_tables MUST list at least one table".to_string(),
            ));
        }

        if let Some(bad) = self
            .sensitive_tables
            .iter()
            .find(|name| !is_sql_identifier(name))
        {
            return Err(GuardianError::Configuration(format!(
                "sensitive table '{bad}' is not a plain SQL identifier"
            )));
        }

        if self
            .scan_policy
            .correlation_tokens
            .iter()
            .all(|token| token.trim().is_empty())
        {
            return Err(GuardianError::Configuration(
                "scan_policy.correlation_tokens MUST contain a non-blank token".to_string(),
            ));
        }

        if self.scan_policy.max_reported_findings == 0 {
            return Err(GuardianError::Configuration(
                "scan_policy.max_reported_findings MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn migration_candidates(&self) -> Vec<PathBuf> {
        self.migration_dirs
            .iter()
            .map(|dir| self.repo_root.join(dir))
            .collect()
    }

    #[must_use]
    pub fn scan_candidates(&self) -> Vec<PathBuf> {
        self.scan_targets
            .iter()
            .map(|target| self.repo_root.join(target))
            .collect()
    }

    #[must_use]
    pub fn resolve_scan_target(&self) -> Option<PathBuf> {
        self.scan_candidates()
            .into_iter()
            .find(|candidate| candidate.is_file())
    }
}

#[must_use]
pub fn is_sql_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Lexical evidence found in the concatenated trigger bodies of one table.
///
/// This is a proxy for parsing trigger logic: a correctly authored trigger is
/// assumed to mention the operation it blocks and the abort it raises.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct TriggerMarkers {
    pub blocks_update: bool,
    pub blocks_delete: bool,
    pub aborts: bool,
}

impl TriggerMarkers {
    #[must_use]
    pub fn scan(trigger_sql: &str) -> Self {
        let blob = trigger_sql.to_lowercase();
        Self {
            blocks_update: blob.contains("update"),
            blocks_delete: blob.contains("delete"),
            aborts: blob.contains("raise") || blob.contains("abort"),
        }
    }

    #[must_use]
    pub fn is_complete(self) -> bool {
        self.blocks_update && self.blocks_delete && self.aborts
    }

    #[must_use]
    pub fn missing(self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.blocks_update {
            missing.push("UPDATE blocking");
        }
        if !self.blocks_delete {
            missing.push("DELETE blocking");
        }
        if !self.aborts {
            missing.push("RAISE/ABORT");
        }
        missing
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GhostStateFinding {
    pub table: String,
    /// Matched statement text with whitespace collapsed.
    pub operation: String,
    /// Character (not byte) offset of the match in the scanned text.
    pub offset: usize,
    pub line: usize,
}

impl Display for GhostStateFinding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: '{}' at char {} (line {})",
            self.table, self.operation, self.offset, self.line
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct GhostScan {
    pub mutations_examined: usize,
    pub findings: Vec<GhostStateFinding>,
}

impl GhostScan {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

#[derive(Debug, Clone)]
struct MutationRule {
    table: String,
    pattern: Regex,
}

/// Windowed correlation of sensitive-table mutations with audit emissions.
///
/// Statement keywords carry no leading anchor, so SQL glued to an escaped
/// `\n` or `\t` inside a string literal still matches; only the table name is
/// word-bounded.
///
/// For each `INSERT INTO`/`UPDATE`/`DELETE FROM` on a sensitive table, the
/// surrounding `window_chars` characters on both sides must mention one of the
/// correlation tokens. Emissions outside the window are missed, and unrelated
/// text containing a token hides a real gap.
#[derive(Debug, Clone)]
pub struct GhostScanner {
    rules: Vec<MutationRule>,
    window_chars: usize,
    tokens: Vec<String>,
}

impl GhostScanner {
    /// # Errors
    /// Returns [`GuardianError::Configuration`] if a table pattern fails to compile.
    pub fn new(sensitive_tables: &[String], policy: &ScanPolicy) -> Result<Self, GuardianError> {
        let mut rules = Vec::with_capacity(sensitive_tables.len());
        for table in sensitive_tables {
            let pattern = Regex::new(&format!(
                r#"(?i)(?:insert\s+(?:or\s+[a-z]+\s+)?into|update|delete\s+from)\s+["`\[]?{}\b"#,
                regex::escape(table)
            ))
            .map_err(|err| {
                GuardianError::Configuration(format!("invalid scan pattern for {table}: {err}"))
            })?;
            rules.push(MutationRule {
                table: table.clone(),
                pattern,
            });
        }

        let tokens = policy
            .correlation_tokens
            .iter()
            .map(|token| token.trim().to_lowercase())
            .filter(|token| !token.is_empty())
            .collect();

        Ok(Self {
            rules,
            window_chars: policy.window_chars,
            tokens,
        })
    }

    #[must_use]
    pub fn scan(&self, text: &str) -> GhostScan {
        let mut scan = GhostScan::default();

        for rule in &self.rules {
            for found in rule.pattern.find_iter(text) {
                scan.mutations_examined += 1;
                let (lo, hi) = window_bounds(text, found.start(), found.end(), self.window_chars);
                let window = text[lo..hi].to_lowercase();
                let correlated = self.tokens.iter().any(|token| window.contains(token));

                tracing::debug!(
                    table = %rule.table,
                    byte_offset = found.start(),
                    correlated,
                    "examined sensitive mutation"
                );

                if !correlated {
                    let prefix = &text[..found.start()];
                    scan.findings.push(GhostStateFinding {
                        table: rule.table.clone(),
                        operation: found.as_str().split_whitespace().collect::<Vec<_>>().join(" "),
                        offset: prefix.chars().count(),
                        line: prefix.matches('\n').count() + 1,
                    });
                }
            }
        }

        scan.findings
            .sort_by(|lhs, rhs| (lhs.offset, &lhs.table).cmp(&(rhs.offset, &rhs.table)));
        scan
    }
}

/// Byte range covering `chars` characters before `start` and after `end`,
/// clamped to the text.
fn window_bounds(text: &str, start: usize, end: usize, chars: usize) -> (usize, usize) {
    let lo = text[..start]
        .char_indices()
        .rev()
        .take(chars)
        .last()
        .map_or(start, |(idx, _)| idx);
    let hi = text[end..]
        .char_indices()
        .nth(chars)
        .map_or(text.len(), |(idx, _)| end + idx);
    (lo, hi)
}

/// Renders at most `cap` findings as indented report lines, noting any overflow.
#[must_use]
pub fn render_findings(findings: &[GhostStateFinding], cap: usize) -> Vec<String> {
    let mut lines = findings
        .iter()
        .take(cap)
        .map(|finding| format!("  - {finding}"))
        .collect::<Vec<_>>();
    if findings.len() > cap {
        lines.push(format!("  ... and {} more", findings.len() - cap));
    }
    lines
}

/// Event fields covered by the content hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEventDraft {
    pub event_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub event_type: String,
    pub payload_json: String,
    pub occurred_at: i64,
    pub prev_hash: Option<String>,
}

impl AuditEventDraft {
    #[must_use]
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::json!({
            "event_id": self.event_id,
            "agent_id": self.agent_id,
            "user_id": self.user_id,
            "type": self.event_type,
            "payload_json": self.payload_json,
            "occurred_at": self.occurred_at,
            "prev_hash": self.prev_hash,
        });
        hash_bytes(canonical.to_string().as_bytes())
    }
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[must_use]
pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn default_scanner() -> GhostScanner {
        let config = GuardianConfig::default();
        must_ok(GhostScanner::new(
            &config.sensitive_tables,
            &config.scan_policy,
        ))
    }

    fn filler(len: usize) -> String {
        "x".repeat(len)
    }

    const TRIGGERS: &str = "CREATE TRIGGER trg_events_no_update BEFORE UPDATE ON events
BEGIN SELECT RAISE(ABORT, 'events is append-only'); END
CREATE TRIGGER trg_events_no_delete BEFORE DELETE ON events
BEGIN SELECT RAISE(ABORT, 'events is append-only'); END";

    #[test]
    fn complete_trigger_set_has_all_markers() {
        let markers = TriggerMarkers::scan(TRIGGERS);
        assert!(markers.is_complete());
        assert!(markers.missing().is_empty());
    }

    #[test]
    fn removing_any_marker_category_is_detected() {
        let without_update = TRIGGERS.replace("UPDATE", "INSERT").replace("update", "insert");
        assert_eq!(
            TriggerMarkers::scan(&without_update).missing(),
            vec!["UPDATE blocking"]
        );

        let without_delete = TRIGGERS.replace("DELETE", "INSERT").replace("delete", "insert");
        assert_eq!(
            TriggerMarkers::scan(&without_delete).missing(),
            vec!["DELETE blocking"]
        );

        let without_abort = TRIGGERS
            .replace("RAISE(ABORT, 'events is append-only')", "1");
        assert_eq!(
            TriggerMarkers::scan(&without_abort).missing(),
            vec!["RAISE/ABORT"]
        );

        assert_eq!(TriggerMarkers::scan("").missing().len(), 3);
    }

    #[test]
    fn markers_are_case_insensitive() {
        let markers = TriggerMarkers::scan("before Update ... before DeLeTe ... Abort");
        assert!(markers.is_complete());
    }

    #[test]
    fn unlogged_insert_yields_exactly_one_finding() {
        let text = format!(
            "{}\nINSERT INTO budgets (id, amount) VALUES (?, ?)\n{}",
            filler(400),
            filler(400)
        );
        let scan = default_scanner().scan(&text);
        assert_eq!(scan.mutations_examined, 1);
        assert_eq!(scan.findings.len(), 1);
        assert_eq!(scan.findings[0].table, "budgets");
        assert_eq!(scan.findings[0].operation, "INSERT INTO budgets");
        assert_eq!(scan.findings[0].offset, 401);
        assert_eq!(scan.findings[0].line, 2);
    }

    #[test]
    fn emit_event_after_the_mutation_suppresses_the_finding() {
        let text = format!(
            "{}\nINSERT INTO budgets (id, amount) VALUES (?, ?);\n{}emitEvent(tx, 'budget.created');\n{}",
            filler(400),
            filler(200),
            filler(400)
        );
        let scan = default_scanner().scan(&text);
        assert_eq!(scan.mutations_examined, 1);
        assert!(scan.is_clean());
    }

    #[test]
    fn audit_emission_outside_the_window_is_a_false_positive() {
        let text = format!(
            "INSERT INTO budgets (id) VALUES (?);{}emitEvent(tx);",
            filler(301)
        );
        let scan = default_scanner().scan(&text);
        assert_eq!(scan.findings.len(), 1);
    }

    #[test]
    fn coincidental_token_in_the_window_is_a_false_negative() {
        // "prevent" contains "event" and hides the unlogged mutation.
        let text = "// prevent double spend\nUPDATE budgets SET amount = 0";
        let scan = default_scanner().scan(text);
        assert_eq!(scan.mutations_examined, 1);
        assert!(scan.is_clean());
    }

    #[test]
    fn table_names_are_word_bounded_and_case_insensitive() {
        // Each statement sits on its own line, out of reach of its neighbours' windows.
        let text = format!(
            "{pad}\nupdate budgets_archive set x = 1\n{pad}\nDELETE   FROM\n  policies WHERE 1\n{pad}\ninsert or replace into \"agents\" values (1)\n{pad}",
            pad = filler(320)
        );
        let scan = default_scanner().scan(&text);
        let tables = scan
            .findings
            .iter()
            .map(|finding| finding.table.as_str())
            .collect::<Vec<_>>();
        assert_eq!(tables, vec!["policies", "agents"]);
        assert_eq!(scan.findings[0].operation, "DELETE FROM policies");
        assert_eq!(scan.findings[1].operation, "insert or replace into \"agents");
    }

    #[test]
    fn statements_after_escaped_whitespace_are_still_matched() {
        let newline = r#"db.exec("BEGIN;\nUPDATE budgets SET amount_cents = 0;\nCOMMIT;");"#;
        let scan = default_scanner().scan(newline);
        assert_eq!(scan.mutations_examined, 1);
        assert_eq!(scan.findings.len(), 1);
        assert_eq!(scan.findings[0].table, "budgets");
        assert_eq!(scan.findings[0].offset, 17);

        let tab = r#"db.run("\tDELETE FROM policies WHERE id = ?", [id]);"#;
        let scan = default_scanner().scan(tab);
        assert_eq!(scan.findings.len(), 1);
        assert_eq!(scan.findings[0].operation, "DELETE FROM policies");

        let glued = "xxxxDELETE FROM policies WHERE 1";
        assert_eq!(default_scanner().scan(glued).findings.len(), 1);
    }

    #[test]
    fn window_size_and_tokens_are_configurable() {
        let policy = ScanPolicy {
            window_chars: 10,
            correlation_tokens: vec!["audit".to_string()],
            max_reported_findings: 5,
        };
        let scanner = must_ok(GhostScanner::new(&["budgets".to_string()], &policy));

        let near = "audit(); UPDATE budgets SET a = 1";
        assert!(scanner.scan(near).is_clean());

        // The token ends 21 chars before the statement, past the 10-char window.
        let far = format!("audit();{} UPDATE budgets SET a = 1", filler(20));
        let scan = scanner.scan(&far);
        assert_eq!(scan.mutations_examined, 1);
        assert_eq!(scan.findings.len(), 1);

        let wrong_token = "emitEvent(); UPDATE budgets SET a = 1";
        assert_eq!(scanner.scan(wrong_token).findings.len(), 1);
    }

    #[test]
    fn offsets_are_reported_in_characters() {
        let text = format!("é{}\nUPDATE users SET name = ?", filler(400));
        let scan = default_scanner().scan(&text);
        assert_eq!(scan.findings.len(), 1);
        assert_eq!(scan.findings[0].offset, 402);
    }

    #[test]
    fn window_bounds_handle_multibyte_text() {
        let text = "ééé MATCH ééé";
        let start = match text.find("MATCH") {
            Some(value) => value,
            None => panic!("fixture missing MATCH"),
        };
        let end = start + "MATCH".len();
        let (lo, hi) = window_bounds(text, start, end, 2);
        assert_eq!(&text[lo..hi], "é MATCH é");
        let (lo, hi) = window_bounds(text, start, end, 100);
        assert_eq!((lo, hi), (0, text.len()));
    }

    #[test]
    fn render_findings_caps_output() {
        let findings = (0..30)
            .map(|idx| GhostStateFinding {
                table: "budgets".to_string(),
                operation: "UPDATE budgets".to_string(),
                offset: idx * 10,
                line: idx + 1,
            })
            .collect::<Vec<_>>();
        let lines = render_findings(&findings, 25);
        assert_eq!(lines.len(), 26);
        assert_eq!(lines[0], "  - budgets: 'UPDATE budgets' at char 0 (line 1)");
        assert_eq!(lines[25], "  ... and 5 more");
    }

    #[test]
    fn default_config_is_valid_and_partial_json_keeps_defaults() {
        must_ok(GuardianConfig::default().validate());

        let config = must_ok(GuardianConfig::from_json_str(
            r#"{"sensitive_tables": ["ledgers"], "scan_policy": {"window_chars": 120}}"#,
        ));
        assert_eq!(config.sensitive_tables, vec!["ledgers".to_string()]);
        assert_eq!(config.scan_policy.window_chars, 120);
        assert_eq!(config.scan_policy.max_reported_findings, 25);
        assert_eq!(config.protected_tables.len(), 2);
    }

    #[test]
    fn config_validation_rejects_unsafe_identifiers_and_duplicates() {
        let mut config = GuardianConfig::default();
        config.protected_tables[0].probe_column = "type; DROP TABLE x".to_string();
        assert!(matches!(
            config.validate(),
            Err(GuardianError::Configuration(_))
        ));

        let mut config = GuardianConfig::default();
        config.protected_tables.push(ProtectedTable::events());
        let err = match config.validate() {
            Ok(()) => panic!("expected duplicate protected table to fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("listed twice"));

        let mut config = GuardianConfig::default();
        config.scan_policy.correlation_tokens = vec!["  ".to_string()];
        assert!(config.validate().is_err());

        assert!(GuardianConfig::from_json_str("{not json").is_err());
    }

    #[test]
    fn stage_order_is_strictly_forward() {
        let mut stage = GuardianStage::Load;
        let mut order = vec![stage];
        while let Some(next) = stage.next(false) {
            order.push(next);
            stage = next;
        }
        assert_eq!(
            order,
            vec![
                GuardianStage::Load,
                GuardianStage::Verify,
                GuardianStage::Seed,
                GuardianStage::Prove,
                GuardianStage::Scan,
            ]
        );
        assert_eq!(
            GuardianStage::Prove.next(true),
            Some(GuardianStage::Chain)
        );
    }

    #[test]
    fn content_hash_depends_on_prev_hash() {
        let draft = AuditEventDraft {
            event_id: "evt_1".to_string(),
            agent_id: "agent_1".to_string(),
            user_id: "user_1".to_string(),
            event_type: "kernel.guardian".to_string(),
            payload_json: "{}".to_string(),
            occurred_at: 1_700_000_000,
            prev_hash: None,
        };
        let root = draft.content_hash();
        assert_eq!(root.len(), 64);
        assert_eq!(root, draft.content_hash());

        let mut chained = draft.clone();
        chained.prev_hash = Some(root.clone());
        assert_ne!(root, chained.content_hash());
    }

    proptest! {
        #[test]
        fn uncorrelated_padding_never_hides_a_mutation(
            before in "[a-d0-9 \n]{0,600}",
            after in "[a-d0-9 \n]{0,600}",
        ) {
            let text = format!("{before} UPDATE budgets SET x = 1 {after}");
            let scan = default_scanner().scan(&text);
            prop_assert_eq!(scan.findings.len(), 1);
        }

        #[test]
        fn token_within_window_always_correlates(gap in 0_usize..280) {
            let text = format!("UPDATE budgets SET x = 1;{}appendReceipt();", filler(gap));
            let scan = default_scanner().scan(&text);
            prop_assert!(scan.is_clean());
        }
    }
}
