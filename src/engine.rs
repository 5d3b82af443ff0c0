//! Orchestrator.
//!
//! Turns a classified inbound message into a new case or a link to an
//! existing one. The store phase is one transaction: a message either ends
//! linked to a fully written case or leaves no case behind.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

use crate::audit::{self, AuditAction, HistoryEvent};
use crate::classify::{Classification, ClassificationRequest, Classifier, REVIEW_MARKER};
use crate::db::{CaseDb, DbError, DbInboundMessage};
use crate::error::CaseError;
use crate::grouping::{self, GroupingMatch};
use crate::identity::{self, RoutingSnapshot};
use crate::lifecycle::{self, CodeCompletion, TransitionRequest};
use crate::sla::{self, SlaSweepReport};
use crate::ticket;
use crate::types::{
    Actor, Case, CaseDraft, Config, InboundMessage, PipelineAction, PipelineResult,
    RENEWAL_CASE_TYPE,
};

/// Busy timeout restored on the shared connection after a bounded store phase.
const DEFAULT_STORE_WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Deadlines and retries
// =============================================================================

/// Caller-supplied bound on a whole operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: tokio::time::Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: tokio::time::Instant::now() + budget,
        }
    }

    /// Time left, or `None` once elapsed.
    pub fn remaining(&self) -> Option<Duration> {
        let left = self.at.saturating_duration_since(tokio::time::Instant::now());
        (!left.is_zero()).then_some(left)
    }

    /// Fail with `Timeout` naming the phase that could not start.
    pub fn check(&self, phase: &'static str) -> Result<Duration, CaseError> {
        self.remaining().ok_or(CaseError::Timeout(phase))
    }
}

/// Run `op`, re-running it while it fails with `StoreConflict`.
///
/// `retries` bounds the extra attempts. Any other error returns at once.
pub fn retry_on_conflict<T>(retries: u32, mut op: impl FnMut() -> Result<T, CaseError>) -> Result<T, CaseError> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                log::warn!("CaseEngine: store conflict, retry {}/{}: {}", attempt, retries, e);
                std::thread::sleep(Duration::from_millis(10 * attempt as u64));
            }
            other => return other,
        }
    }
}

// =============================================================================
// Synchronous pipeline core
// =============================================================================

/// Settings the store phase needs, fixed for one invocation.
pub struct IngestContext<'a> {
    pub config: &'a Config,
    pub routing: &'a RoutingSnapshot,
    pub tz: Tz,
    pub now: DateTime<Utc>,
}

fn linked_result(case: &Case, message: String) -> PipelineResult {
    PipelineResult {
        success: true,
        case_id: Some(case.id.clone()),
        ticket: case.ticket.clone(),
        action: PipelineAction::Linked,
        message,
        error: None,
    }
}

/// Unresolved code fields plus the review marker for low-confidence output.
fn missing_fields_for(classification: &Classification, threshold: f64) -> BTreeSet<String> {
    let mut missing = classification.missing_fields.clone();
    missing.extend(classification.unresolved_codes());
    if classification.confidence < threshold {
        missing.insert(REVIEW_MARKER.to_string());
    }
    missing
}

/// Run the store phase of the pipeline for an already classified message.
///
/// Order: idempotency check, broker, grouping, then either a link or a new
/// case with its history, audit rows and (when classification is complete
/// and confident) its ticket.
///
/// This is also a standalone entry point for messages that arrive already
/// classified, so it records the message and checks for an existing link
/// itself. `CaseEngine` runs the same check before classifying; repeating it
/// here narrows the window in which a concurrent delivery can link first.
pub fn ingest_classified(
    db: &CaseDb,
    msg: &InboundMessage,
    classification: &Classification,
    ctx: &IngestContext<'_>,
) -> Result<PipelineResult, CaseError> {
    let now = ctx.now;
    db.record_inbound(msg, now)?;

    if let Some(case_id) = db.case_for_message(&msg.message_id)? {
        let case = db.require_case(&case_id)?;
        log::info!(
            "CaseEngine: message {} already linked to case {}",
            msg.message_id,
            case.id
        );
        return Ok(linked_result(
            &case,
            format!("Message already linked to case {}", case.id),
        ));
    }

    let broker = match identity::resolve_broker(
        db,
        classification.broker_email_detected.as_deref(),
        &msg.from_address,
        &msg.cc_addresses,
    ) {
        Ok(broker) => broker,
        Err(e) => {
            if matches!(e, CaseError::UnresolvedBroker { .. }) {
                db.mark_inbound_triage(&msg.message_id, &e.to_string(), now)?;
                log::warn!("CaseEngine: message {} sent to triage: {}", msg.message_id, e);
            }
            return Err(e);
        }
    };

    let existing = grouping::find_existing_case(
        db,
        &broker.broker_id,
        &msg.from_address,
        &msg.subject,
        ctx.config.dedup_window(),
        now,
    )?;

    match existing {
        Some(found) => link_to_existing(db, msg, found, now),
        None => create_new_case(db, msg, classification, &broker.broker_id, ctx),
    }
}

fn link_to_existing(
    db: &CaseDb,
    msg: &InboundMessage,
    found: GroupingMatch,
    now: DateTime<Utc>,
) -> Result<PipelineResult, CaseError> {
    let actor = Actor::system();
    db.with_transaction(|tx| {
        let case = tx.require_case(&found.case.id)?;
        if !tx.link_message(&case.id, &msg.message_id, actor.role.as_str(), now)? {
            // Lost a race with another delivery of the same message.
            let owner = tx
                .case_for_message(&msg.message_id)?
                .unwrap_or_else(|| case.id.clone());
            let owner_case = tx.require_case(&owner)?;
            return Ok(linked_result(
                &owner_case,
                format!("Message already linked to case {}", owner_case.id),
            ));
        }
        audit::record_history(
            tx,
            &case.id,
            HistoryEvent::MessageLinked,
            json!({
                "message_id": msg.message_id,
                "subject": msg.subject,
                "rule": found.rule.as_str(),
            }),
            &actor,
            now,
        )?;
        audit::record_audit(
            tx,
            &actor,
            AuditAction::MessageLinked,
            &case.id,
            None,
            Some(&json!({ "message_id": msg.message_id })),
            now,
        )?;
        tx.mark_inbound_linked(&msg.message_id, &case.id, now)?;

        log::info!(
            "CaseEngine: message {} linked to case {} ({})",
            msg.message_id,
            case.id,
            found.rule.as_str()
        );
        Ok(linked_result(
            &case,
            format!("Message linked to existing case {}", case.id),
        ))
    })
}

fn create_new_case(
    db: &CaseDb,
    msg: &InboundMessage,
    classification: &Classification,
    broker_id: &str,
    ctx: &IngestContext<'_>,
) -> Result<PipelineResult, CaseError> {
    let now = ctx.now;
    let actor = Actor::system();
    let master = ctx.routing.master_for(&classification.bucket);
    if master.is_none() {
        log::warn!(
            "CaseEngine: no master routed for bucket {}; case left unassigned",
            identity::routing_bucket(&classification.bucket)
        );
    }

    let draft = CaseDraft {
        case_type: RENEWAL_CASE_TYPE.to_string(),
        bucket: identity::routing_bucket(&classification.bucket).to_string(),
        ramo_code: classification.ramo_code.clone(),
        insurer_code: classification.insurer_code.clone(),
        procedure_code: classification.procedure_code.clone(),
        confidence: classification.confidence,
        missing_fields: missing_fields_for(classification, ctx.config.confidence_threshold),
        special_flags: classification.special_flag.iter().cloned().collect(),
        broker_id: broker_id.to_string(),
        assigned_master_id: master.map(str::to_string),
        origin_address: Some(crate::util::extract_email_address(&msg.from_address)),
        created_at: now,
    };

    let created = db.with_transaction(|tx| {
        let case = tx.create_case(&draft)?;
        if !tx.link_message(&case.id, &msg.message_id, actor.role.as_str(), now)? {
            return Err(CreateAbort::AlreadyLinked);
        }
        tx.mark_inbound_linked(&msg.message_id, &case.id, now)?;

        audit::record_history(
            tx,
            &case.id,
            HistoryEvent::Created,
            json!({
                "status": case.status.as_str(),
                "bucket": case.bucket,
                "confidence": case.confidence,
            }),
            &actor,
            now,
        )?;
        audit::record_history(
            tx,
            &case.id,
            HistoryEvent::MessageLinked,
            json!({ "message_id": msg.message_id, "subject": msg.subject }),
            &actor,
            now,
        )?;
        audit::record_audit(
            tx,
            &actor,
            AuditAction::CaseCreated,
            &case.id,
            None,
            Some(&audit::case_snapshot(&case)),
            now,
        )?;

        let case = if lifecycle::is_ticket_ready(&case) {
            ticket::assign_ticket(tx, &case, now, ctx.tz, &actor)?
        } else {
            case
        };

        let (action, message) = match &case.ticket {
            Some(t) => (PipelineAction::Created, format!("Case created with ticket {}", t)),
            None => (
                PipelineAction::Provisional,
                format!(
                    "Provisional case created; pending: {}",
                    case.missing_fields.iter().cloned().collect::<Vec<_>>().join(", ")
                ),
            ),
        };
        log::info!("CaseEngine: {} (case {})", message, case.id);

        Ok(PipelineResult {
            success: true,
            case_id: Some(case.id.clone()),
            ticket: case.ticket.clone(),
            action,
            message,
            error: None,
        })
    });

    match created {
        Ok(result) => Ok(result),
        Err(CreateAbort::Failed(e)) => Err(e),
        // Another delivery linked the message first; the new case was rolled back.
        Err(CreateAbort::AlreadyLinked) => {
            let owner = db.case_for_message(&msg.message_id)?.ok_or_else(|| {
                CaseError::StoreConflict(format!("message {} link vanished", msg.message_id))
            })?;
            let case = db.require_case(&owner)?;
            log::info!(
                "CaseEngine: message {} already linked to case {}",
                msg.message_id,
                case.id
            );
            Ok(linked_result(
                &case,
                format!("Message already linked to case {}", case.id),
            ))
        }
    }
}

/// Why the case-creation transaction was rolled back.
enum CreateAbort {
    AlreadyLinked,
    Failed(CaseError),
}

impl From<CaseError> for CreateAbort {
    fn from(err: CaseError) -> Self {
        CreateAbort::Failed(err)
    }
}

impl From<DbError> for CreateAbort {
    fn from(err: DbError) -> Self {
        CreateAbort::Failed(err.into())
    }
}

// =============================================================================
// Async engine
// =============================================================================

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub sla: SlaSweepReport,
    pub resumed: Vec<String>,
    pub tickets_issued: Vec<String>,
}

pub struct CaseEngine {
    db: Arc<Mutex<CaseDb>>,
    classifier: Arc<dyn Classifier>,
    config: Config,
}

impl CaseEngine {
    pub fn new(db: CaseDb, classifier: Arc<dyn Classifier>, config: Config) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            classifier,
            config,
        }
    }

    /// Shared handle to the store.
    pub fn db(&self) -> Arc<Mutex<CaseDb>> {
        Arc::clone(&self.db)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn tz(&self) -> Result<Tz, CaseError> {
        self.config.tz().map_err(CaseError::Store)
    }

    /// Run a store closure on the blocking pool, bounded by `deadline`.
    async fn with_store<T, F>(&self, deadline: Deadline, phase: &'static str, f: F) -> Result<T, CaseError>
    where
        T: Send + 'static,
        F: FnOnce(&CaseDb) -> Result<T, CaseError> + Send + 'static,
    {
        let wait = deadline.check(phase)?;
        let db = Arc::clone(&self.db);
        let task = tokio::task::spawn_blocking(move || -> Result<T, CaseError> {
            let guard = db.lock();
            guard.set_busy_timeout(wait)?;
            let result = f(&*guard);
            guard.set_busy_timeout(DEFAULT_STORE_WAIT)?;
            result
        });
        match task.await {
            Ok(result) => result,
            Err(e) => Err(CaseError::Store(format!("Store task panicked: {}", e))),
        }
    }

    /// Process one inbound message end to end.
    ///
    /// Never panics and never returns a bare error: failures come back as a
    /// `PipelineResult` with `action = error` and a typed kind.
    pub async fn process_inbound(&self, msg: InboundMessage, deadline: Deadline) -> PipelineResult {
        match self.try_process_inbound(msg, deadline).await {
            Ok(result) => result,
            Err(e) => {
                log::warn!("CaseEngine: pipeline failed: {}", e);
                PipelineResult::failed(&e)
            }
        }
    }

    async fn try_process_inbound(&self, msg: InboundMessage, deadline: Deadline) -> Result<PipelineResult, CaseError> {
        let msg = Arc::new(msg);

        // Record first so the message is never lost, and short-circuit redeliveries.
        let already = {
            let msg = Arc::clone(&msg);
            self.with_store(deadline, "record", move |db| {
                db.record_inbound(&msg, Utc::now())?;
                match db.case_for_message(&msg.message_id)? {
                    Some(case_id) => Ok(Some(db.require_case(&case_id)?)),
                    None => Ok(None),
                }
            })
            .await?
        };
        if let Some(case) = already {
            return Ok(linked_result(
                &case,
                format!("Message already linked to case {}", case.id),
            ));
        }

        let classification = match msg.classification.clone() {
            Some(c) => c,
            None => self.classify(&msg, deadline).await?,
        };

        let config = self.config.clone();
        let tz = self.tz()?;
        let retries = config.store_conflict_retries;
        self.with_store(deadline, "store", move |db| {
            let routing = RoutingSnapshot::load(db)?;
            retry_on_conflict(retries, || {
                let ctx = IngestContext {
                    config: &config,
                    routing: &routing,
                    tz,
                    now: Utc::now(),
                };
                ingest_classified(db, &msg, &classification, &ctx)
            })
        })
        .await
    }

    /// Call the classifier within the deadline. On failure the message is
    /// queued for retry, or sent to triage once attempts run out.
    async fn classify(&self, msg: &Arc<InboundMessage>, deadline: Deadline) -> Result<Classification, CaseError> {
        let budget = deadline.check("classification")?;
        let request = ClassificationRequest::from_message(msg);
        let outcome = match tokio::time::timeout(budget, self.classifier.classify(&request)).await {
            Ok(result) => result,
            Err(_) => Err(CaseError::ClassificationUnavailable(format!(
                "{} classifier timed out after {:?}",
                self.classifier.name(),
                budget
            ))),
        };

        let err = match outcome {
            Ok(classification) => return Ok(classification),
            Err(e) => e,
        };

        let message_id = msg.message_id.clone();
        let reason = err.to_string();
        let max_attempts = self.config.max_classification_attempts;
        // Bookkeeping gets its own short budget: the caller's may be spent.
        let bookkeeping = Deadline::after(DEFAULT_STORE_WAIT);
        let requeue = self
            .with_store(bookkeeping, "retry bookkeeping", move |db| {
                let now = Utc::now();
                let attempts = db.mark_inbound_retry(&message_id, &reason, now)?;
                if attempts >= max_attempts {
                    db.mark_inbound_triage(&message_id, &reason, now)?;
                    log::warn!(
                        "CaseEngine: message {} moved to triage after {} classification attempts",
                        message_id,
                        attempts
                    );
                }
                Ok(())
            })
            .await;
        if let Err(e) = requeue {
            log::warn!("CaseEngine: could not queue message for retry: {}", e);
        }

        Err(err)
    }

    /// Re-run classification for queued messages.
    pub async fn retry_pending(&self, budget_per_message: Duration) -> Result<Vec<PipelineResult>, CaseError> {
        let max_attempts = self.config.max_classification_attempts;
        let pending = self
            .with_store(Deadline::after(DEFAULT_STORE_WAIT), "list pending", move |db| {
                Ok(db.list_pending_classification(max_attempts)?)
            })
            .await?;

        let mut results = Vec::with_capacity(pending.len());
        for row in pending {
            let msg = message_from_ledger(row);
            results.push(self.process_inbound(msg, Deadline::after(budget_per_message)).await);
        }
        Ok(results)
    }

    /// Apply a status change, retrying lost races.
    pub async fn transition(&self, req: TransitionRequest, deadline: Deadline) -> Result<Case, CaseError> {
        let retries = self.config.store_conflict_retries;
        self.with_store(deadline, "transition", move |db| {
            retry_on_conflict(retries, || lifecycle::transition(db, &req, Utc::now()))
        })
        .await
    }

    pub async fn complete_classification(
        &self,
        case_id: String,
        codes: CodeCompletion,
        actor: Actor,
        deadline: Deadline,
    ) -> Result<Case, CaseError> {
        let retries = self.config.store_conflict_retries;
        let tz = self.tz()?;
        self.with_store(deadline, "complete classification", move |db| {
            retry_on_conflict(retries, || {
                lifecycle::complete_classification(db, &case_id, &codes, &actor, Utc::now(), tz)
            })
        })
        .await
    }

    /// Periodic maintenance: SLA sweep, postponed resume, provisional tickets.
    pub async fn run_sweeps(&self, deadline: Deadline) -> Result<SweepSummary, CaseError> {
        let config = self.config.clone();
        let tz = self.tz()?;
        self.with_store(deadline, "sweep", move |db| {
            let now = Utc::now();
            let sla = sla::sla_sweep(db, &config, now)?;
            let resumed = lifecycle::resume_postponed(db, now)?;
            let issued = lifecycle::retry_provisional_tickets(db, now, tz)?;
            Ok(SweepSummary {
                sla,
                resumed: resumed.into_iter().map(|c| c.id).collect(),
                tickets_issued: issued.into_iter().map(|c| c.id).collect(),
            })
        })
        .await
    }
}

/// Rebuild an unclassified message from its ledger row.
fn message_from_ledger(row: DbInboundMessage) -> InboundMessage {
    InboundMessage {
        message_id: row.message_id,
        from_address: row.from_address,
        cc_addresses: row.cc_addresses,
        subject: row.subject,
        body: row.body,
        attachments_summary: Vec::new(),
        classification: None,
    }
}
