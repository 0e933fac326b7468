//! Guardian gate entrypoints.
//!
//! - [`run_cli`] executes a parsed command line.
//! - [`run_guardian`] runs the Load → Verify → Seed → Prove → Scan pipeline for
//!   a config, writing `[OK]`/`[FAIL]` lines to the supplied writer.
//! - [`run_ghost_scan`] runs only the source scan; it needs no database.
//!
//! Check failures are reported through [`GuardianReport`] rather than `Err`;
//! `Err` is reserved for configuration and output errors.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use kernel_guardian_core::{
    now_unix, render_findings, GhostScanner, GhostStateFinding, GuardianConfig, GuardianError,
    GuardianStage, REPORT_CONTRACT_VERSION,
};
use kernel_guardian_store_sqlite::{
    discover_migrations, AppendOnlyProof, ChainReport, GuardianDb, MigrationFile,
    SeededAuditGraph,
};

#[derive(Debug, Parser)]
#[command(name = "guardian")]
#[command(about = "Append-only audit table and ghost-state verification gate")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run every stage against a fresh in-memory database.
    Check(CheckArgs),
    /// Run only the ghost-state source scan.
    Scan(TargetArgs),
}

#[derive(Debug, Args)]
pub struct TargetArgs {
    /// JSON config file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    repo_root: Option<PathBuf>,
    #[arg(long = "migrations-dir")]
    migration_dirs: Vec<PathBuf>,
    #[arg(long = "scan-target")]
    scan_targets: Vec<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Also check prev_hash continuity across the event log.
    #[arg(long)]
    verify_chain: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ScanSummary {
    pub target: Option<String>,
    pub skipped: bool,
    /// Candidate paths tried when no target existed.
    pub searched: Vec<String>,
    pub mutations_examined: usize,
    pub findings: Vec<GhostStateFinding>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct GuardianReport {
    pub contract_version: String,
    pub passed: bool,
    pub completed_stages: Vec<GuardianStage>,
    pub failed_stage: Option<GuardianStage>,
    pub failure: Option<String>,
    pub checks: Vec<String>,
    pub migrations_applied: Vec<String>,
    pub seeded: Option<SeededAuditGraph>,
    pub proofs: Vec<AppendOnlyProof>,
    pub chain: Option<ChainReport>,
    pub scan: Option<ScanSummary>,
}

impl GuardianReport {
    fn new() -> Self {
        Self {
            contract_version: REPORT_CONTRACT_VERSION.to_string(),
            passed: false,
            completed_stages: Vec::new(),
            failed_stage: None,
            failure: None,
            checks: Vec::new(),
            migrations_applied: Vec::new(),
            seeded: None,
            proofs: Vec::new(),
            chain: None,
            scan: None,
        }
    }
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when configuration loading fails, output cannot be
/// written, or any guardian check fails (so the process exits non-zero).
pub fn run_cli(cli: Cli) -> Result<()> {
    let (target, first_stage, verify_chain) = match cli.command {
        Command::Check(args) => (args.target, GuardianStage::Load, args.verify_chain),
        Command::Scan(args) => (args, GuardianStage::Scan, false),
    };

    let config = load_config(&target, verify_chain)?;
    let report = if target.json {
        let report = run_stages(&config, first_stage, &mut std::io::sink())?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        report
    } else {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        run_stages(&config, first_stage, &mut out)?
    };

    if let Some(scan) = report.scan.as_ref().filter(|scan| scan.skipped) {
        // Independent of RUST_LOG.
        eprintln!(
            "[WARN] ghost-state scan target not found; scan skipped (looked in {})",
            scan.searched.join(", ")
        );
    }

    if report.passed {
        Ok(())
    } else {
        Err(anyhow!(
            "guardian failed at {}: {}",
            report
                .failed_stage
                .map_or("unknown", GuardianStage::as_str),
            report.failure.as_deref().unwrap_or("no detail")
        ))
    }
}

/// Builds the effective config: file (or defaults), then flag overrides.
///
/// # Errors
/// Returns an error when the config file cannot be read or fails validation.
pub fn load_config(args: &TargetArgs, verify_chain: bool) -> Result<GuardianConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            GuardianConfig::from_json_str(&raw)?
        }
        None => GuardianConfig::default(),
    };

    if let Some(root) = &args.repo_root {
        config.repo_root.clone_from(root);
    }
    if !args.migration_dirs.is_empty() {
        config.migration_dirs.clone_from(&args.migration_dirs);
    }
    if !args.scan_targets.is_empty() {
        config.scan_targets.clone_from(&args.scan_targets);
    }
    config.verify_event_chain |= verify_chain;

    config.validate()?;
    Ok(config)
}

/// Runs the full pipeline. The in-memory database lives only inside this call.
///
/// # Errors
/// Returns an error for an invalid config or a failed write to `out`; check
/// failures are recorded in the returned report.
pub fn run_guardian<W: Write>(config: &GuardianConfig, out: &mut W) -> Result<GuardianReport> {
    run_stages(config, GuardianStage::Load, out)
}

fn run_stages<W: Write>(
    config: &GuardianConfig,
    first: GuardianStage,
    out: &mut W,
) -> Result<GuardianReport> {
    config.validate()?;

    let mut run = GuardianRun {
        config,
        out,
        db: None,
        report: GuardianReport::new(),
    };

    let mut stage = Some(first);
    while let Some(current) = stage {
        tracing::info!(stage = %current, "entering stage");
        if let Err(err) = run.execute(current) {
            run.fail(current, &err)?;
            return Ok(run.report);
        }
        run.report.completed_stages.push(current);
        stage = current.next(config.verify_event_chain);
    }

    run.report.passed = true;
    Ok(run.report)
}

struct GuardianRun<'a, W: Write> {
    config: &'a GuardianConfig,
    out: &'a mut W,
    db: Option<GuardianDb>,
    report: GuardianReport,
}

impl<W: Write> GuardianRun<'_, W> {
    fn execute(&mut self, stage: GuardianStage) -> Result<()> {
        match stage {
            GuardianStage::Load => self.load(),
            GuardianStage::Verify => self.verify(),
            GuardianStage::Seed => self.seed(),
            GuardianStage::Prove => self.prove(),
            GuardianStage::Chain => self.chain(),
            GuardianStage::Scan => {
                // Nothing after this stage touches the database.
                self.db = None;
                self.scan()
            }
        }
    }

    fn load(&mut self) -> Result<()> {
        let files = discover_migrations(
            &self.config.migration_candidates(),
            &self.config.migration_extension,
        )?;
        let db = GuardianDb::open_ephemeral()?;
        db.apply_migrations(&files)?;
        self.report.migrations_applied = files.iter().map(MigrationFile::file_name).collect();
        self.db = Some(db);
        Ok(())
    }

    fn verify(&mut self) -> Result<()> {
        let config = self.config;
        for table in &config.protected_tables {
            let report = self.db()?.verify_immutable(&table.name)?;
            self.ok(&format!(
                "{} appears DB-immutable (triggers: {}).",
                report.table,
                report.triggers.join(", ")
            ))?;
        }
        Ok(())
    }

    fn seed(&mut self) -> Result<()> {
        let seeded = self.db()?.seed_audit_graph(now_unix())?;
        self.report.seeded = Some(seeded);
        Ok(())
    }

    fn prove(&mut self) -> Result<()> {
        let seeded = self
            .report
            .seeded
            .clone()
            .ok_or_else(|| anyhow!("prove stage entered without seeded rows"))?;
        let config = self.config;
        for table in &config.protected_tables {
            let proof = self
                .db()?
                .prove_append_only(table, seeded.key_for(table.record))?;
            self.report.proofs.push(proof);
            self.ok(&format!(
                "UPDATE and DELETE on {} blocked as expected.",
                table.name
            ))?;
        }
        Ok(())
    }

    fn chain(&mut self) -> Result<()> {
        let chain = self.db()?.verify_event_chain()?;
        self.report.chain = Some(chain.clone());
        if let Some(broken) = chain.first_break {
            return Err(GuardianError::BrokenHashChain {
                event_id: broken.event_id,
                expected: broken
                    .expected_prev_hash
                    .unwrap_or_else(|| "NULL".to_string()),
                found: broken.found_prev_hash.unwrap_or_else(|| "NULL".to_string()),
            }
            .into());
        }
        self.ok(&format!(
            "events hash chain intact ({} event(s)).",
            chain.events
        ))
    }

    fn scan(&mut self) -> Result<()> {
        let summary = run_ghost_scan(self.config)?;
        self.report.scan = Some(summary.clone());

        let Some(target) = summary.target else {
            return Ok(());
        };
        if !summary.findings.is_empty() {
            return Err(GuardianError::GhostState {
                path: target,
                findings: summary.findings,
            }
            .into());
        }
        self.ok(&format!(
            "Ghost-state heuristic passed for {target} ({} mutation(s) examined).",
            summary.mutations_examined
        ))
    }

    fn db(&self) -> Result<&GuardianDb> {
        self.db
            .as_ref()
            .ok_or_else(|| anyhow!("database stage entered before migrations were loaded"))
    }

    fn ok(&mut self, message: &str) -> Result<()> {
        let line = format!("[OK] {message}");
        writeln!(self.out, "{line}")?;
        self.report.checks.push(line);
        Ok(())
    }

    fn fail(&mut self, stage: GuardianStage, err: &anyhow::Error) -> Result<()> {
        tracing::error!(stage = %stage, error = %err, "guardian check failed");
        writeln!(self.out, "[FAIL] {stage}: {err:#}")?;
        if let Some(GuardianError::GhostState { findings, .. }) =
            err.downcast_ref::<GuardianError>()
        {
            let cap = self.config.scan_policy.max_reported_findings;
            for line in render_findings(findings, cap) {
                writeln!(self.out, "{line}")?;
            }
        }
        self.report.failed_stage = Some(stage);
        self.report.failure = Some(format!("{err:#}"));
        self.db = None;
        Ok(())
    }
}

/// Scans the first existing scan target. A missing target skips the scan.
///
/// # Errors
/// Returns [`GuardianError::ScanRead`] when the target exists but cannot be
/// read, or a configuration error if a table pattern cannot be compiled.
pub fn run_ghost_scan(config: &GuardianConfig) -> Result<ScanSummary> {
    let Some(target) = config.resolve_scan_target() else {
        let searched = config
            .scan_candidates()
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>();
        tracing::warn!(
            searched = %searched.join(", "),
            "ghost-state scan target not found; skipping"
        );
        return Ok(ScanSummary {
            target: None,
            skipped: true,
            searched,
            mutations_examined: 0,
            findings: Vec::new(),
        });
    };

    let bytes = std::fs::read(&target).map_err(|err| GuardianError::ScanRead {
        path: target.display().to_string(),
        reason: err.to_string(),
    })?;
    let text = String::from_utf8_lossy(&bytes);

    let scanner = GhostScanner::new(&config.sensitive_tables, &config.scan_policy)?;
    let scan = scanner.scan(&text);
    tracing::info!(
        target = %target.display(),
        examined = scan.mutations_examined,
        findings = scan.findings.len(),
        "ghost-state scan finished"
    );

    Ok(ScanSummary {
        target: Some(target.display().to_string()),
        skipped: false,
        searched: Vec::new(),
        mutations_examined: scan.mutations_examined,
        findings: scan.findings,
    })
}
