use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use warden_guard::{
    ActorType, AuditConfig, AuditError, AuditEvent, AuditFilter, AuditLogger, ComplianceEngine,
    ComplianceReport, ComplianceTag, FileAuditBackend, GuardError, Outcome, RiskLevel, TimeRange,
};

#[derive(Parser, Debug)]
#[command(name = "warden-audit")]
#[command(about = "Verify, query and score warden audit logs")]
struct Cli {
    /// Audit log path (JSONL written by FileAuditBackend).
    #[arg(long, global = true, env = "WARDEN_AUDIT_LOG")]
    log: Option<PathBuf>,
    /// Event signing secret.
    #[arg(long, global = true, env = "WARDEN_AUDIT_SECRET", hide_env_values = true)]
    secret: Option<String>,
    /// Hex key for encrypted event details.
    #[arg(long, global = true, env = "WARDEN_AUDIT_KEY", hide_env_values = true)]
    key: Option<String>,
    /// Debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify every signature and the hash chain.
    Verify,
    /// Print events matching a filter, one JSON object per line.
    Query {
        /// Actor id.
        #[arg(long)]
        agent: Option<String>,
        /// Actor type (user, agent, system).
        #[arg(long)]
        actor_type: Option<ActorType>,
        /// Action kind prefix, e.g. `sandbox.`.
        #[arg(long)]
        action: Option<String>,
        /// Events at or after this RFC 3339 instant.
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// Events at or before this RFC 3339 instant.
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        /// Required compliance tag; repeatable.
        #[arg(long = "tag")]
        tags: Vec<ComplianceTag>,
        /// Minimum risk level.
        #[arg(long)]
        min_risk: Option<RiskLevel>,
        /// Outcome (success, failure, warning).
        #[arg(long)]
        outcome: Option<Outcome>,
        /// Most recent N matches.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Score the log against a compliance standard.
    Report {
        /// Standard name.
        #[arg(long, default_value = "soc2")]
        standard: String,
        /// Window in hours ending now; the whole log if omitted.
        #[arg(long)]
        hours: Option<i64>,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Event counts by action, actor, outcome and risk.
    Summary,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("missing audit log path (use --log or WARDEN_AUDIT_LOG)")]
    MissingLog,
    #[error("missing audit secret (use --secret or WARDEN_AUDIT_SECRET)")]
    MissingSecret,
    #[error("audit log not found: {0}")]
    NotFound(PathBuf),
    #[error("unknown compliance standard '{0}'")]
    UnknownStandard(String),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error("output error: {0}")]
    Json(#[from] serde_json::Error),
}

fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let logger = open_log(cli.log.as_deref(), cli.secret, cli.key)?;
    match cli.command {
        Command::Verify => {
            logger.verify()?;
            println!("ok: verified {} events", logger.count()?);
        }
        Command::Query {
            agent,
            actor_type,
            action,
            from,
            to,
            tags,
            min_risk,
            outcome,
            limit,
        } => {
            let filter = AuditFilter {
                agent,
                actor_type,
                action_prefix: action,
                from,
                to: to.map(through),
                tags: tags.into_iter().collect(),
                min_risk,
                outcome,
                limit: None,
            };
            for event in most_recent(logger.query(&filter)?, limit) {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Command::Report {
            standard,
            hours,
            json,
        } => {
            let range = match hours {
                Some(h) => TimeRange::last(Duration::hours(h)),
                None => TimeRange::all(),
            };
            let report = score(&logger.events()?, &standard, range)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Command::Summary => print_summary(&logger.events()?),
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "warden=debug" } else { "warden=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_log(path: Option<&Path>, secret: Option<String>, key: Option<String>) -> Result<AuditLogger, CliError> {
    let path = path.ok_or(CliError::MissingLog)?;
    if !path.exists() {
        return Err(CliError::NotFound(path.to_path_buf()));
    }
    let config = AuditConfig {
        secret: secret.filter(|s| !s.is_empty()).ok_or(CliError::MissingSecret)?,
        encryption_key: key,
    };
    tracing::debug!(path = %path.display(), encrypted = config.encryption_key.is_some(), "opening audit log");
    Ok(AuditLogger::open(&config, Box::new(FileAuditBackend::new(path)))?)
}

/// Exclusive filter bound that still admits events stamped exactly at `to`.
fn through(to: DateTime<Utc>) -> DateTime<Utc> {
    to + Duration::nanoseconds(1)
}

/// The last `limit` events, still oldest first.
fn most_recent(mut events: Vec<AuditEvent>, limit: Option<usize>) -> Vec<AuditEvent> {
    if let Some(n) = limit {
        let skip = events.len().saturating_sub(n);
        events.drain(..skip);
    }
    events
}

// --- report ---

/// Rescore `events` from scratch; compliance state is not persisted.
fn score(events: &[AuditEvent], standard: &str, range: TimeRange) -> Result<ComplianceReport, CliError> {
    let engine = ComplianceEngine::new();
    if !engine.standards().iter().any(|s| s == standard) {
        return Err(CliError::UnknownStandard(standard.to_string()));
    }
    let scored = engine.evaluate_all(events);
    tracing::debug!(events = events.len(), scored, "rescored audit log");
    Ok(engine.generate_report(standard, range)?)
}

fn print_report(report: &ComplianceReport) {
    println!("=== {} Compliance Report ===", report.standard.to_uppercase());
    println!("Window: {} .. {}", report.range.from.to_rfc3339(), report.range.to.to_rfc3339());
    println!("Events evaluated: {}", report.total_events);
    println!(
        "Controls: {} passed, {} failed",
        report.controls_passed, report.controls_failed
    );
    println!("Score: {:.1}", report.score);
    println!();

    if !report.violations_by_severity.is_empty() {
        println!("Violations by severity:");
        for (risk, count) in report.violations_by_severity.iter().rev() {
            println!("  {:<30} {}", risk, count);
        }
        println!();
    }

    if !report.recommendations.is_empty() {
        println!("Recommendations:");
        for rec in &report.recommendations {
            println!("  - {}", rec);
        }
    }
}

// --- summary ---

#[derive(Debug, Default, PartialEq)]
struct Summary {
    total: usize,
    by_action: BTreeMap<String, usize>,
    by_actor: BTreeMap<String, usize>,
    by_outcome: BTreeMap<String, usize>,
    by_risk: BTreeMap<RiskLevel, usize>,
}

fn summarize(events: &[AuditEvent]) -> Summary {
    let mut summary = Summary::default();
    for event in events {
        summary.total += 1;
        *summary.by_action.entry(event.action.kind.clone()).or_default() += 1;
        *summary.by_actor.entry(event.actor.id.clone()).or_default() += 1;
        let outcome = format!("{:?}", event.result.status).to_lowercase();
        *summary.by_outcome.entry(outcome).or_default() += 1;
        *summary.by_risk.entry(event.security.risk).or_default() += 1;
    }
    summary
}

fn print_summary(events: &[AuditEvent]) {
    let summary = summarize(events);
    println!("=== Audit Log Summary ===");
    println!("Total events: {}", summary.total);
    println!();
    print_counts("By action:", summary.by_action.iter());
    print_counts("By actor:", summary.by_actor.iter());
    print_counts("By outcome:", summary.by_outcome.iter());
    print_counts("By risk:", summary.by_risk.iter().rev());
}

fn print_counts<'a, K: std::fmt::Display>(title: &str, counts: impl Iterator<Item = (K, &'a usize)>) {
    let mut counts: Vec<_> = counts.collect();
    counts.sort_by(|a, b| b.1.cmp(a.1));
    println!("{}", title);
    for (key, count) in counts {
        println!("  {:<30} {}", key, count);
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_guard::{Actor, EventDraft};

    fn write_log(dir: &Path) -> PathBuf {
        let path = dir.join("audit.jsonl");
        let config = AuditConfig {
            secret: "cli-secret".into(),
            encryption_key: None,
        };
        let logger = AuditLogger::open(&config, Box::new(FileAuditBackend::new(&path))).unwrap();
        logger
            .log_event(EventDraft::new(Actor::agent("a1"), "sandbox.start", "a1-x"))
            .unwrap();
        for _ in 0..2 {
            logger
                .log_event(
                    EventDraft::new(Actor::user("mallory"), "auth.failure", "login")
                        .outcome(Outcome::Failure, "bad password"),
                )
                .unwrap();
        }
        path
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "warden-audit",
            "query",
            "--log",
            "/tmp/a.jsonl",
            "--secret",
            "s",
            "--tag",
            "soc2",
            "--min-risk",
            "high",
        ])
        .unwrap();
        assert_eq!(cli.log.as_deref(), Some(Path::new("/tmp/a.jsonl")));
        match cli.command {
            Command::Query { tags, min_risk, .. } => {
                assert_eq!(tags, vec![ComplianceTag::Soc2]);
                assert_eq!(min_risk, Some(RiskLevel::High));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_open_requires_secret_and_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path());

        assert!(matches!(open_log(None, Some("s".into()), None), Err(CliError::MissingLog)));
        assert!(matches!(open_log(Some(&path), None, None), Err(CliError::MissingSecret)));
        assert!(matches!(
            open_log(Some(&dir.path().join("missing.jsonl")), Some("s".into()), None),
            Err(CliError::NotFound(_))
        ));

        let logger = open_log(Some(&path), Some("cli-secret".into()), None).unwrap();
        logger.verify().unwrap();
        assert_eq!(logger.count().unwrap(), 3);

        let wrong = open_log(Some(&path), Some("other".into()), None).unwrap();
        assert!(matches!(wrong.verify(), Err(AuditError::Integrity { .. })));
    }

    #[test]
    fn test_report_rescores_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path());
        let logger = open_log(Some(&path), Some("cli-secret".into()), None).unwrap();
        let events = logger.events().unwrap();

        let report = score(&events, "soc2", TimeRange::all()).unwrap();
        assert_eq!(report.violations.len(), 2);
        assert!(report.score < 100.0);
        assert!(matches!(
            score(&events, "nist", TimeRange::all()),
            Err(CliError::UnknownStandard(_))
        ));
    }

    #[test]
    fn test_query_limit_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path());
        let logger = open_log(Some(&path), Some("cli-secret".into()), None).unwrap();
        let all = logger.query(&AuditFilter::default()).unwrap();

        let last = most_recent(all.clone(), Some(2));
        assert_eq!(last.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![all[1].sequence, all[2].sequence]);
        assert_eq!(most_recent(all.clone(), Some(10)).len(), 3);
        assert_eq!(most_recent(all.clone(), None).len(), 3);
        assert!(most_recent(all, Some(0)).is_empty());
    }

    #[test]
    fn test_query_to_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path());
        let logger = open_log(Some(&path), Some("cli-secret".into()), None).unwrap();
        let first = logger.events().unwrap().remove(0);

        let cli = Cli::try_parse_from([
            "warden-audit",
            "query",
            "--to",
            &first.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        ])
        .unwrap();
        let Command::Query { to, .. } = cli.command else {
            panic!("expected query");
        };
        let exclusive = AuditFilter {
            to,
            ..Default::default()
        };
        assert!(logger.query(&exclusive).unwrap().iter().all(|e| e.sequence != first.sequence));
        let inclusive = AuditFilter {
            to: to.map(through),
            ..Default::default()
        };
        assert!(logger.query(&inclusive).unwrap().iter().any(|e| e.sequence == first.sequence));
    }

    #[test]
    fn test_summary_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path());
        let logger = open_log(Some(&path), Some("cli-secret".into()), None).unwrap();

        let events = logger.events().unwrap();
        let summary = summarize(&events);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_action["auth.failure"], 2);
        assert_eq!(summary.by_actor["mallory"], 2);
        assert_eq!(summary.by_outcome["failure"], 2);
        assert_eq!(summary.by_risk[&RiskLevel::High], 2);
        assert_eq!(summary.by_risk[&RiskLevel::Low], 1);

        // string and enum keys both render
        print_summary(&events);
        print_counts("By risk:", summary.by_risk.iter());
    }
}
