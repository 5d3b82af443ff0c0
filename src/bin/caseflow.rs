//! caseflow: command-line front end for the case lifecycle engine.
//!
//! Reads config from `~/.caseflow/config.json`, opens the case store and
//! prints results as JSON on stdout. Logs go to stderr (`RUST_LOG`).

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use caseflow_lib::audit;
use caseflow_lib::classify::{Classification, ClassificationRequest, Classifier, HttpClassifier};
use caseflow_lib::db::{CaseDb, DbProfile};
use caseflow_lib::lifecycle::{CodeCompletion, TransitionRequest};
use caseflow_lib::state::load_config;
use caseflow_lib::types::{Actor, CaseStatus, InboundMessage};
use caseflow_lib::{CaseEngine, CaseError, Deadline};

/// Overall bound for one CLI invocation.
const COMMAND_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "caseflow")]
#[command(about = "Case lifecycle engine for brokerage back-office", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for one inbound message (JSON file, or - for stdin)
    Ingest { source: String },

    /// Re-run classification for messages queued for retry
    Retry,

    /// Move a case to another status
    Transition {
        case_id: String,
        status: CaseStatus,
        /// Master performing the change
        #[arg(long)]
        actor: String,
        /// Status the caller last saw; a mismatch is a conflict
        #[arg(long)]
        expect: Option<CaseStatus>,
        /// Cancellation reason (required for cerrado_cancelado)
        #[arg(long)]
        reason: Option<String>,
        /// Postpone until this RFC 3339 instant (required for aplazado)
        #[arg(long, value_parser = parse_rfc3339)]
        until: Option<DateTime<Utc>>,
        /// New policy start date, YYYY-MM-DD (required for cerrado_renovado)
        #[arg(long, requires = "end")]
        start: Option<NaiveDate>,
        /// New policy end date, YYYY-MM-DD
        #[arg(long, requires = "start")]
        end: Option<NaiveDate>,
    },

    /// Supply missing codes on a provisional case
    Complete {
        case_id: String,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        ramo: Option<String>,
        #[arg(long)]
        insurer: Option<String>,
        #[arg(long)]
        procedure: Option<String>,
    },

    /// SLA sweep, postponed resume and provisional ticket retry
    Sweep,

    /// Show a case with its SLA status
    Case { case_id: String },

    /// Case history in chronological order
    Timeline {
        case_id: String,
        /// Only rows visible to the broker
        #[arg(long)]
        broker: bool,
    },

    /// Security audit rows for a case
    Audit { case_id: String },

    /// Messages waiting for manual triage
    Triage,

    /// Register or update an active broker
    Broker {
        id: String,
        email: String,
        /// Display name
        name: Vec<String>,
    },

    /// Route a bucket to a primary master and optional backup
    Route {
        bucket: String,
        primary: String,
        backup: Option<String>,
    },

    /// Toggle absence cover for a bucket's primary master
    Leave { bucket: String, state: LeaveState },
}

#[derive(Clone, Copy, ValueEnum)]
enum LeaveState {
    On,
    Off,
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("expected RFC 3339 timestamp: {e}"))
}

/// Stands in when no classifier endpoint is configured: pre-classified
/// messages still flow, everything else is queued for retry.
struct OfflineClassifier {
    reason: String,
}

#[async_trait]
impl Classifier for OfflineClassifier {
    fn name(&self) -> &'static str {
        "offline"
    }

    async fn classify(&self, _request: &ClassificationRequest) -> Result<Classification, CaseError> {
        Err(CaseError::ClassificationUnavailable(self.reason.clone()))
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_message(source: &str) -> anyhow::Result<InboundMessage> {
    let raw = if source == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(source).with_context(|| format!("reading {source}"))?
    };
    serde_json::from_str(&raw).context("parsing inbound message")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let config = load_config().map_err(|e| anyhow!("Failed to load caseflow config: {e}"))?;
    let db = CaseDb::open(&config).map_err(|e| anyhow!("Failed to open database: {e}"))?;

    let classifier: Arc<dyn Classifier> = match HttpClassifier::from_config(&config.classifier) {
        Ok(http) => Arc::new(http),
        Err(e) => {
            log::warn!("Classifier unavailable, running offline: {e}");
            Arc::new(OfflineClassifier {
                reason: e.to_string(),
            })
        }
    };
    let engine = CaseEngine::new(db, classifier, config);
    let deadline = Deadline::after(COMMAND_DEADLINE);
    let store = engine.db();

    match cli.command {
        Commands::Ingest { source } => {
            let msg = read_message(&source)?;
            let result = engine.process_inbound(msg, deadline).await;
            print_json(&result)?;
            if !result.success {
                std::process::exit(2);
            }
        }
        Commands::Retry => {
            let budget = Duration::from_secs(engine.config().classifier.timeout_secs + 10);
            print_json(&engine.retry_pending(budget).await?)?;
        }
        Commands::Transition {
            case_id,
            status,
            actor,
            expect,
            reason,
            until,
            start,
            end,
        } => {
            let mut req = TransitionRequest::new(&case_id, status, Actor::master(&actor));
            if let Some(expected) = expect {
                req = req.expecting(expected);
            }
            if let Some(reason) = reason {
                req = req.reason(&reason);
            }
            if let Some(until) = until {
                req = req.until(until);
            }
            if let (Some(start), Some(end)) = (start, end) {
                req = req.renewal_dates(start, end);
            }
            print_json(&engine.transition(req, deadline).await?)?;
        }
        Commands::Complete {
            case_id,
            actor,
            ramo,
            insurer,
            procedure,
        } => {
            let codes = CodeCompletion {
                ramo_code: ramo,
                insurer_code: insurer,
                procedure_code: procedure,
            };
            let case = engine
                .complete_classification(case_id, codes, Actor::master(&actor), deadline)
                .await?;
            print_json(&case)?;
        }
        Commands::Sweep => print_json(&engine.run_sweeps(deadline).await?)?,
        Commands::Case { case_id } => {
            let case = store.lock().require_case(&case_id)?;
            let threshold = engine.config().sla_hours_for(&case.case_type);
            let sla = case.sla_view(Utc::now(), threshold);
            print_json(&serde_json::json!({ "case": case, "sla": sla }))?;
        }
        Commands::Timeline { case_id, broker } => {
            print_json(&audit::case_timeline(&store.lock(), &case_id, broker)?)?;
        }
        Commands::Audit { case_id } => print_json(&audit::security_audit(&store.lock(), &case_id)?)?,
        Commands::Triage => print_json(&store.lock().list_triage()?)?,
        Commands::Broker { id, email, name } => {
            let profile = DbProfile {
                id,
                email,
                full_name: (!name.is_empty()).then(|| name.join(" ")),
                role: "broker".to_string(),
                active: true,
            };
            store.lock().upsert_profile(&profile)?;
            print_json(&profile)?;
        }
        Commands::Route {
            bucket,
            primary,
            backup,
        } => {
            let db = store.lock();
            db.set_routing(&bucket, &primary, backup.as_deref())?;
            print_json(&db.list_routing()?)?;
        }
        Commands::Leave { bucket, state } => {
            let db = store.lock();
            if !db.set_on_leave(&bucket, matches!(state, LeaveState::On))? {
                bail!("bucket {bucket} is not routed");
            }
            print_json(&db.list_routing()?)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("caseflow").chain(args.iter().copied()))
    }

    #[test]
    fn test_transition_parses_typed_fields() {
        let cli = parse(&[
            "transition",
            "case-1",
            "cerrado_renovado",
            "--actor",
            "m1",
            "--expect",
            "en_proceso",
            "--start",
            "2026-01-01",
            "--end",
            "2027-01-01",
        ])
        .unwrap();
        match cli.command {
            Commands::Transition {
                status,
                expect,
                start,
                end,
                reason,
                ..
            } => {
                assert_eq!(status, CaseStatus::CerradoRenovado);
                assert_eq!(expect, Some(CaseStatus::EnProceso));
                assert_eq!(start, NaiveDate::from_ymd_opt(2026, 1, 1));
                assert_eq!(end, NaiveDate::from_ymd_opt(2027, 1, 1));
                assert!(reason.is_none());
            }
            _ => panic!("expected transition"),
        }
    }

    #[test]
    fn test_flag_without_value_is_a_usage_error() {
        let err = parse(&[
            "transition",
            "case-1",
            "cerrado_cancelado",
            "--actor",
            "m1",
            "--reason",
            "--broker",
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn test_repeated_flag_is_rejected() {
        let err = parse(&[
            "transition",
            "case-1",
            "cerrado_cancelado",
            "--actor",
            "m1",
            "--reason",
            "a",
            "--reason",
            "b",
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn test_bad_inputs_are_rejected_at_parse_time() {
        assert!(parse(&["transition", "c", "cerrado", "--actor", "m1"]).is_err());
        assert!(parse(&["transition", "c", "aplazado", "--actor", "m1", "--until", "tomorrow"]).is_err());
        assert!(parse(&["transition", "c", "cerrado_renovado", "--actor", "m1", "--start", "2026-01-01"]).is_err());
        assert!(parse(&["transition", "c", "en_revision"]).is_err(), "--actor is required");
        assert!(parse(&["leave", "ramos_generales", "maybe"]).is_err());
    }

    #[test]
    fn test_broker_name_joins_words() {
        match parse(&["broker", "b1", "broker@x.com", "Broker", "Uno"]).unwrap().command {
            Commands::Broker { name, .. } => assert_eq!(name.join(" "), "Broker Uno"),
            _ => panic!("expected broker"),
        }
    }
}
