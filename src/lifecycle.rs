//! Lifecycle state machine for renewal cases.
//!
//! Every status change goes through `transition`, which re-reads the stored
//! status inside the write transaction, validates the edge and the fields
//! the target requires, persists through the gateway, and appends one
//! history row and one audit row. Also hosts the provisional-case paths that
//! end in ticket issuance.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde_json::json;

use crate::audit::{self, AuditAction, HistoryEvent};
use crate::classify::{blocks_ticket, REVIEW_MARKER};
use crate::db::CaseDb;
use crate::error::CaseError;
use crate::ticket::{self, normalize_code};
use crate::types::{Actor, Case, CasePatch, CaseStatus};

/// A requested status change plus the fields the target state needs.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub case_id: String,
    pub target: CaseStatus,
    pub actor: Actor,
    /// Status the caller read before deciding; a mismatch is a conflict.
    pub expected_status: Option<CaseStatus>,
    pub cancellation_reason: Option<String>,
    pub aplazado_until: Option<DateTime<Utc>>,
    pub new_start_date: Option<NaiveDate>,
    pub new_end_date: Option<NaiveDate>,
}

impl TransitionRequest {
    pub fn new(case_id: &str, target: CaseStatus, actor: Actor) -> Self {
        Self {
            case_id: case_id.to_string(),
            target,
            actor,
            expected_status: None,
            cancellation_reason: None,
            aplazado_until: None,
            new_start_date: None,
            new_end_date: None,
        }
    }

    pub fn expecting(mut self, status: CaseStatus) -> Self {
        self.expected_status = Some(status);
        self
    }

    pub fn reason(mut self, reason: &str) -> Self {
        self.cancellation_reason = Some(reason.to_string());
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.aplazado_until = Some(until);
        self
    }

    pub fn renewal_dates(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.new_start_date = Some(start);
        self.new_end_date = Some(end);
        self
    }
}

/// Check an edge of the state machine.
///
/// A case with no prior status (being created) may enter any state, and
/// staying in the current status is always allowed.
pub fn validate_transition(current: Option<CaseStatus>, target: CaseStatus) -> Result<(), CaseError> {
    match current {
        None => Ok(()),
        Some(from) if from.can_transition_to(target) => Ok(()),
        Some(from) => Err(CaseError::InvalidTransition { from, to: target }),
    }
}

/// Fields the target state demands in the same request.
fn check_required_fields(req: &TransitionRequest, now: DateTime<Utc>) -> Result<(), CaseError> {
    match req.target {
        CaseStatus::CerradoCancelado => {
            let reason = req.cancellation_reason.as_deref().map(str::trim).unwrap_or("");
            if reason.is_empty() {
                return Err(CaseError::MissingRequiredField(
                    "cancellation_reason".to_string(),
                ));
            }
        }
        CaseStatus::Aplazado => match req.aplazado_until {
            Some(until) if until > now => {}
            Some(_) => {
                return Err(CaseError::MissingRequiredField(
                    "aplazado_until (must be in the future)".to_string(),
                ))
            }
            None => return Err(CaseError::MissingRequiredField("aplazado_until".to_string())),
        },
        CaseStatus::CerradoRenovado => match (req.new_start_date, req.new_end_date) {
            (Some(start), Some(end)) if end > start => {}
            (Some(_), Some(_)) => {
                return Err(CaseError::MissingRequiredField(
                    "new_end_date (must be after new_start_date)".to_string(),
                ))
            }
            (None, _) => return Err(CaseError::MissingRequiredField("new_start_date".to_string())),
            (_, None) => return Err(CaseError::MissingRequiredField("new_end_date".to_string())),
        },
        _ => {}
    }
    Ok(())
}

/// Apply a status change.
///
/// Requesting the current status is accepted and writes nothing.
pub fn transition(db: &CaseDb, req: &TransitionRequest, now: DateTime<Utc>) -> Result<Case, CaseError> {
    db.with_transaction(|tx| {
        let current = tx.require_case(&req.case_id)?;
        if let Some(expected) = req.expected_status {
            if expected != current.status {
                return Err(CaseError::StoreConflict(format!(
                    "case {} is {} (caller read {})",
                    current.id, current.status, expected
                )));
            }
        }

        validate_transition(Some(current.status), req.target)?;
        if current.status == req.target {
            return Ok(current);
        }
        check_required_fields(req, now)?;

        let mut patch = CasePatch::new().expecting(current.status).status(req.target);
        if req.target == CaseStatus::EnRevision && current.first_response_at.is_none() {
            patch = patch.first_response_at(now);
        }
        if req.target.is_terminal() {
            patch = patch.closed_at(now);
        }
        match req.target {
            CaseStatus::Aplazado => patch = patch.aplazado_until(req.aplazado_until),
            _ if current.status == CaseStatus::Aplazado => patch = patch.aplazado_until(None),
            _ => {}
        }
        if req.target == CaseStatus::CerradoCancelado {
            if let Some(reason) = &req.cancellation_reason {
                patch = patch.cancellation_reason(reason);
            }
        }
        if let (CaseStatus::CerradoRenovado, Some(start), Some(end)) =
            (req.target, req.new_start_date, req.new_end_date)
        {
            patch = patch.renewal_dates(start, end);
        }

        let updated = tx.update_case(&current.id, &patch, now)?;

        let mut payload = json!({
            "before_status": current.status.as_str(),
            "after_status": updated.status.as_str(),
        });
        if let Some(reason) = &updated.cancellation_reason {
            if updated.status == CaseStatus::CerradoCancelado {
                payload["cancellation_reason"] = json!(reason);
            }
        }
        if let Some(until) = updated.aplazado_until {
            payload["aplazado_until"] = json!(until);
        }
        audit::record_history(tx, &current.id, HistoryEvent::StatusChanged, payload, &req.actor, now)?;
        audit::record_audit(
            tx,
            &req.actor,
            AuditAction::StatusChanged,
            &current.id,
            Some(&audit::case_snapshot(&current)),
            Some(&audit::case_snapshot(&updated)),
            now,
        )?;

        log::info!(
            "Lifecycle: case {} {} -> {}",
            current.id,
            current.status,
            updated.status
        );
        Ok(updated)
    })
}

/// Move postponed cases whose date has passed back to `en_revision`.
///
/// Each case is its own unit of work; a conflict on one case is logged and
/// left for the next run.
pub fn resume_postponed(db: &CaseDb, now: DateTime<Utc>) -> Result<Vec<Case>, CaseError> {
    let due = db.list_postponed_due(now)?;
    let mut resumed = Vec::with_capacity(due.len());
    for case in due {
        let req = TransitionRequest::new(&case.id, CaseStatus::EnRevision, Actor::system())
            .expecting(CaseStatus::Aplazado);
        match transition(db, &req, now) {
            Ok(updated) => resumed.push(updated),
            Err(e) if e.is_retryable() => {
                log::warn!("Lifecycle: resume of case {} deferred: {}", case.id, e);
            }
            Err(e) => return Err(e),
        }
    }
    if !resumed.is_empty() {
        log::info!("Lifecycle: resumed {} postponed case(s)", resumed.len());
    }
    Ok(resumed)
}

/// True when a provisional case may be given its ticket.
pub fn is_ticket_ready(case: &Case) -> bool {
    case.ticket.is_none()
        && case.has_complete_codes()
        && !case.missing_fields.iter().any(|f| blocks_ticket(f))
}

/// Codes supplied by a human completing a provisional case.
#[derive(Debug, Clone, Default)]
pub struct CodeCompletion {
    pub ramo_code: Option<String>,
    pub insurer_code: Option<String>,
    pub procedure_code: Option<String>,
}

fn normalized(field: &str, value: &Option<String>) -> Result<Option<String>, CaseError> {
    match value {
        None => Ok(None),
        Some(raw) => normalize_code(raw)
            .map_err(|e| CaseError::InvalidClassification(format!("{field}: {e}"))),
    }
}

/// Fill in missing codes on a provisional case and issue its ticket once the
/// classification is complete.
///
/// A human completing the classification also clears the low-confidence
/// review marker.
pub fn complete_classification(
    db: &CaseDb,
    case_id: &str,
    codes: &CodeCompletion,
    actor: &Actor,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Case, CaseError> {
    let ramo = normalized("ramo_code", &codes.ramo_code)?;
    let insurer = normalized("insurer_code", &codes.insurer_code)?;
    let procedure = normalized("procedure_code", &codes.procedure_code)?;

    db.with_transaction(|tx| {
        let current = tx.require_case(case_id)?;
        if let Some(existing) = &current.ticket {
            return Err(CaseError::TicketAlreadyIssued {
                case_id: current.id.clone(),
                ticket: existing.clone(),
            });
        }

        let mut missing: BTreeSet<String> = current.missing_fields.clone();
        missing.remove(REVIEW_MARKER);
        let resolved_ramo = ramo.clone().or_else(|| current.ramo_code.clone());
        let resolved_insurer = insurer.clone().or_else(|| current.insurer_code.clone());
        let resolved_procedure = procedure.clone().or_else(|| current.procedure_code.clone());
        for (name, value) in [
            ("ramo", &resolved_ramo),
            ("insurer", &resolved_insurer),
            ("procedure", &resolved_procedure),
        ] {
            if value.is_some() {
                missing.remove(name);
            } else {
                missing.insert(name.to_string());
            }
        }

        let updated = tx.update_case(
            &current.id,
            &CasePatch::new()
                .expecting(current.status)
                .codes(ramo, insurer, procedure)
                .missing_fields(missing),
            now,
        )?;

        audit::record_history(
            tx,
            &current.id,
            HistoryEvent::ClassificationCompleted,
            json!({
                "ramo_code": updated.ramo_code,
                "insurer_code": updated.insurer_code,
                "procedure_code": updated.procedure_code,
                "missing_fields": updated.missing_fields,
            }),
            actor,
            now,
        )?;
        audit::record_audit(
            tx,
            actor,
            AuditAction::ClassificationCompleted,
            &current.id,
            Some(&audit::case_snapshot(&current)),
            Some(&audit::case_snapshot(&updated)),
            now,
        )?;

        if is_ticket_ready(&updated) {
            ticket::assign_ticket(tx, &updated, now, tz, actor)
        } else {
            Ok(updated)
        }
    })
}

/// Issue tickets for provisional cases whose classification has since been
/// completed. Returns the cases that received a ticket.
pub fn retry_provisional_tickets(db: &CaseDb, now: DateTime<Utc>, tz: Tz) -> Result<Vec<Case>, CaseError> {
    let candidates = db.list_ticketable_provisional()?;
    let mut issued = Vec::new();
    for case in candidates.iter().filter(|c| is_ticket_ready(c)) {
        match ticket::assign_ticket(db, case, now, tz, &Actor::system()) {
            Ok(updated) => issued.push(updated),
            Err(e) if e.is_retryable() => {
                log::warn!("Lifecycle: ticket for case {} deferred: {}", case.id, e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(issued)
}
