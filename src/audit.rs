//! Case history and security audit trail.
//!
//! Two append-only logs: the broker-facing case history (timeline) and the
//! internal security audit log with before/after snapshots. Writers call
//! these inside the same transaction as the mutation they describe.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::db::{CaseDb, DbAuditLog, DbCaseEvent};
use crate::error::CaseError;
use crate::types::{Actor, Case};

/// Entity type stamped on case audit rows.
pub const CASE_ENTITY: &str = "case";

/// Timeline event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryEvent {
    Created,
    MessageLinked,
    TicketGenerated,
    StatusChanged,
    ClassificationCompleted,
    SlaBreached,
}

impl HistoryEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryEvent::Created => "created",
            HistoryEvent::MessageLinked => "message_linked",
            HistoryEvent::TicketGenerated => "ticket_generated",
            HistoryEvent::StatusChanged => "status_changed",
            HistoryEvent::ClassificationCompleted => "classification_completed",
            HistoryEvent::SlaBreached => "sla_breached",
        }
    }

    /// SLA bookkeeping is internal; everything else shows on the broker timeline.
    pub fn visible_to_broker(&self) -> bool {
        !matches!(self, HistoryEvent::SlaBreached)
    }
}

/// Security audit actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    CaseCreated,
    MessageLinked,
    TicketGenerated,
    StatusChanged,
    ClassificationCompleted,
    SlaBreached,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::CaseCreated => "CASE_CREATED",
            AuditAction::MessageLinked => "CASE_MESSAGE_LINKED",
            AuditAction::TicketGenerated => "TICKET_GENERATED",
            AuditAction::StatusChanged => "CASE_STATUS_CHANGED",
            AuditAction::ClassificationCompleted => "CASE_CLASSIFICATION_COMPLETED",
            AuditAction::SlaBreached => "SLA_BREACHED",
        }
    }
}

/// Append a history event for a case.
pub fn record_history(
    db: &CaseDb,
    case_id: &str,
    event: HistoryEvent,
    payload: Value,
    actor: &Actor,
    at: DateTime<Utc>,
) -> Result<(), CaseError> {
    db.insert_history_event(
        case_id,
        event.as_str(),
        &payload,
        actor.role.as_str(),
        actor.id.as_deref(),
        event.visible_to_broker(),
        at,
    )?;
    Ok(())
}

/// Append a security audit row for a case.
pub fn record_audit(
    db: &CaseDb,
    actor: &Actor,
    action: AuditAction,
    case_id: &str,
    before: Option<&Value>,
    after: Option<&Value>,
    at: DateTime<Utc>,
) -> Result<(), CaseError> {
    db.insert_audit_log(
        actor.role.as_str(),
        actor.id.as_deref(),
        action.as_str(),
        CASE_ENTITY,
        case_id,
        before,
        after,
        at,
    )?;
    Ok(())
}

/// The fields an auditor compares before and after a change.
pub fn case_snapshot(case: &Case) -> Value {
    json!({
        "status": case.status.as_str(),
        "ticket": case.ticket,
        "ramo_code": case.ramo_code,
        "insurer_code": case.insurer_code,
        "procedure_code": case.procedure_code,
        "missing_fields": case.missing_fields,
        "assigned_master_id": case.assigned_master_id,
        "sla_breached": case.sla_breached,
        "aplazado_until": case.aplazado_until,
        "cancellation_reason": case.cancellation_reason,
    })
}

/// Case history in chronological order. With `broker_view`, internal rows
/// are left out.
pub fn case_timeline(db: &CaseDb, case_id: &str, broker_view: bool) -> Result<Vec<DbCaseEvent>, CaseError> {
    db.require_case(case_id)?;
    Ok(db.list_history(case_id, broker_view)?)
}

/// Security audit rows for a case. Never exposed to brokers.
pub fn security_audit(db: &CaseDb, case_id: &str) -> Result<Vec<DbAuditLog>, CaseError> {
    Ok(db.list_audit_logs(CASE_ENTITY, case_id)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::{sample_draft, test_db};
    use crate::types::CaseStatus;

    #[test]
    fn test_history_rows_carry_actor() {
        let db = test_db();
        let case = db.create_case(&sample_draft("b1", Utc::now())).unwrap();
        record_history(
            &db,
            &case.id,
            HistoryEvent::StatusChanged,
            json!({"from": "pendiente", "to": "en_revision"}),
            &Actor::master("m1"),
            Utc::now(),
        )
        .unwrap();

        let timeline = case_timeline(&db, &case.id, true).unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].event_type, "status_changed");
        assert_eq!(timeline[0].actor_role, "master");
        assert_eq!(timeline[0].actor_id.as_deref(), Some("m1"));
        assert_eq!(timeline[0].payload["to"], "en_revision");
    }

    #[test]
    fn test_sla_rows_are_internal() {
        let db = test_db();
        let case = db.create_case(&sample_draft("b1", Utc::now())).unwrap();
        record_history(
            &db,
            &case.id,
            HistoryEvent::SlaBreached,
            json!({}),
            &Actor::system(),
            Utc::now(),
        )
        .unwrap();
        assert!(case_timeline(&db, &case.id, true).unwrap().is_empty());
        assert_eq!(case_timeline(&db, &case.id, false).unwrap().len(), 1);
    }

    #[test]
    fn test_timeline_of_unknown_case_is_not_found() {
        let db = test_db();
        assert!(matches!(
            case_timeline(&db, "missing", false),
            Err(CaseError::NotFound(_))
        ));
    }

    #[test]
    fn test_audit_snapshot_diff() {
        let db = test_db();
        let case = db.create_case(&sample_draft("b1", Utc::now())).unwrap();
        let before = case_snapshot(&case);
        let mut moved = case.clone();
        moved.status = CaseStatus::EnRevision;
        let after = case_snapshot(&moved);
        record_audit(
            &db,
            &Actor::master("m1"),
            AuditAction::StatusChanged,
            &case.id,
            Some(&before),
            Some(&after),
            Utc::now(),
        )
        .unwrap();

        let rows = security_audit(&db, &case.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action, "CASE_STATUS_CHANGED");
        assert_eq!(rows[0].before_state.as_ref().unwrap()["status"], "pendiente");
        assert_eq!(rows[0].after_state.as_ref().unwrap()["status"], "en_revision");
    }
}
