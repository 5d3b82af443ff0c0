use super::*;

use uuid::Uuid;

use crate::error::CaseError;
use crate::types::{Case, CaseDraft, CasePatch, CaseStatus};

impl CaseDb {
    // =========================================================================
    // Case aggregate (store gateway)
    // =========================================================================

    /// Insert a new case in `pendiente` and return it as stored.
    pub fn create_case(&self, draft: &CaseDraft) -> Result<Case, CaseError> {
        if draft.broker_id.trim().is_empty() {
            return Err(CaseError::MissingRequiredField("broker_id".to_string()));
        }
        if draft.bucket.trim().is_empty() {
            return Err(CaseError::MissingRequiredField("bucket".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let created = ts(draft.created_at);
        self.conn.execute(
            "INSERT INTO cases (
                id, case_type, bucket, ramo_code, insurer_code, procedure_code,
                confidence, missing_fields, special_flags, broker_id, assigned_master_id,
                origin_address, status, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
            params![
                id,
                draft.case_type,
                draft.bucket,
                draft.ramo_code,
                draft.insurer_code,
                draft.procedure_code,
                draft.confidence,
                encode_set(&draft.missing_fields),
                encode_set(&draft.special_flags),
                draft.broker_id,
                draft.assigned_master_id,
                draft.origin_address,
                CaseStatus::Pendiente.as_str(),
                created,
            ],
        )?;

        self.require_case(&id)
    }

    /// Fetch a case by id.
    pub fn get_case(&self, id: &str) -> Result<Option<Case>, DbError> {
        let sql = format!("SELECT {CASE_COLUMNS} FROM cases WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], map_case_row)
            .optional()?)
    }

    /// Fetch a case by id, failing with `NotFound` when absent.
    pub fn require_case(&self, id: &str) -> Result<Case, CaseError> {
        self.get_case(id)?
            .ok_or_else(|| CaseError::NotFound(id.to_string()))
    }

    pub fn get_case_by_ticket(&self, ticket: &str) -> Result<Option<Case>, DbError> {
        let sql = format!("SELECT {CASE_COLUMNS} FROM cases WHERE ticket = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![ticket], map_case_row)
            .optional()?)
    }

    /// Most recently created case for a broker inside the trailing window.
    ///
    /// Only the newest case is returned, never older ones in the window.
    pub fn find_recent_by_broker(
        &self,
        broker_id: &str,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Case>, DbError> {
        let sql = format!(
            "SELECT {CASE_COLUMNS} FROM cases
             WHERE broker_id = ?1 AND created_at >= ?2
             ORDER BY created_at DESC
             LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(&sql, params![broker_id, ts(now - window)], map_case_row)
            .optional()?)
    }

    /// Apply a patch to a case.
    ///
    /// Validation runs against the status stored at write time, inside the
    /// write transaction, and the UPDATE itself is conditioned on that status.
    /// Every write refreshes `updated_at`.
    pub fn update_case(&self, id: &str, patch: &CasePatch, now: DateTime<Utc>) -> Result<Case, CaseError> {
        self.with_transaction(|db| {
            let current = db.require_case(id)?;
            let next = merge_patch(&current, patch, now)?;

            let rows = db.conn.execute(
                "UPDATE cases SET
                    ticket = ?1,
                    ramo_code = ?2,
                    insurer_code = ?3,
                    procedure_code = ?4,
                    missing_fields = ?5,
                    assigned_master_id = ?6,
                    status = ?7,
                    updated_at = ?8,
                    first_response_at = ?9,
                    closed_at = ?10,
                    sla_breached = ?11,
                    aplazado_until = ?12,
                    cancellation_reason = ?13,
                    new_start_date = ?14,
                    new_end_date = ?15
                 WHERE id = ?16 AND status = ?17",
                params![
                    next.ticket,
                    next.ramo_code,
                    next.insurer_code,
                    next.procedure_code,
                    encode_set(&next.missing_fields),
                    next.assigned_master_id,
                    next.status.as_str(),
                    ts(next.updated_at),
                    next.first_response_at.map(ts),
                    next.closed_at.map(ts),
                    next.sla_breached as i32,
                    next.aplazado_until.map(ts),
                    next.cancellation_reason,
                    next.new_start_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    next.new_end_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    id,
                    current.status.as_str(),
                ],
            )?;

            if rows == 0 {
                return Err(CaseError::StoreConflict(format!(
                    "case {} changed status while updating",
                    id
                )));
            }

            db.require_case(id)
        })
    }

    // =========================================================================
    // Sweep queries
    // =========================================================================

    /// Open cases still waiting for a first response and not yet flagged.
    pub fn list_sla_candidates(&self) -> Result<Vec<Case>, DbError> {
        let sql = format!(
            "SELECT {CASE_COLUMNS} FROM cases
             WHERE first_response_at IS NULL
               AND sla_breached = 0
               AND status NOT IN ('cerrado_renovado', 'cerrado_cancelado')
             ORDER BY created_at"
        );
        self.query_cases(&sql, params![])
    }

    /// Postponed cases whose `aplazado_until` has passed.
    pub fn list_postponed_due(&self, now: DateTime<Utc>) -> Result<Vec<Case>, DbError> {
        let sql = format!(
            "SELECT {CASE_COLUMNS} FROM cases
             WHERE status = 'aplazado'
               AND aplazado_until IS NOT NULL
               AND aplazado_until <= ?1
             ORDER BY aplazado_until"
        );
        self.query_cases(&sql, params![ts(now)])
    }

    /// Provisional cases that carry all three codes.
    pub fn list_ticketable_provisional(&self) -> Result<Vec<Case>, DbError> {
        let sql = format!(
            "SELECT {CASE_COLUMNS} FROM cases
             WHERE ticket IS NULL
               AND ramo_code IS NOT NULL
               AND insurer_code IS NOT NULL
               AND procedure_code IS NOT NULL
             ORDER BY created_at"
        );
        self.query_cases(&sql, params![])
    }

    pub fn list_cases_by_broker(&self, broker_id: &str) -> Result<Vec<Case>, DbError> {
        let sql = format!(
            "SELECT {CASE_COLUMNS} FROM cases WHERE broker_id = ?1 ORDER BY created_at DESC"
        );
        self.query_cases(&sql, params![broker_id])
    }

    fn query_cases(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Case>, DbError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(args, map_case_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

/// Merge a patch into the current case, enforcing the aggregate invariants.
fn merge_patch(current: &Case, patch: &CasePatch, now: DateTime<Utc>) -> Result<Case, CaseError> {
    if let Some(expected) = patch.expected_status {
        if expected != current.status {
            return Err(CaseError::StoreConflict(format!(
                "case {} is {} (caller read {})",
                current.id, current.status, expected
            )));
        }
    }

    let mut next = current.clone();

    if let Some(target) = patch.status {
        if !current.status.can_transition_to(target) {
            return Err(CaseError::InvalidTransition {
                from: current.status,
                to: target,
            });
        }
        next.status = target;
    }

    if let Some(ticket) = &patch.ticket {
        if ticket.trim().is_empty() {
            return Err(CaseError::MissingRequiredField("ticket".to_string()));
        }
        match &current.ticket {
            Some(existing) if existing != ticket => {
                return Err(CaseError::TicketAlreadyIssued {
                    case_id: current.id.clone(),
                    ticket: existing.clone(),
                });
            }
            Some(_) => {}
            None => next.ticket = Some(ticket.clone()),
        }
    }

    let codes_changed = [
        (&patch.ramo_code, &current.ramo_code),
        (&patch.insurer_code, &current.insurer_code),
        (&patch.procedure_code, &current.procedure_code),
    ]
    .iter()
    .any(|(new, old)| new.is_some() && new != old);
    if codes_changed {
        if let Some(existing) = &current.ticket {
            return Err(CaseError::TicketAlreadyIssued {
                case_id: current.id.clone(),
                ticket: existing.clone(),
            });
        }
    }
    if patch.ramo_code.is_some() {
        next.ramo_code = patch.ramo_code.clone();
    }
    if patch.insurer_code.is_some() {
        next.insurer_code = patch.insurer_code.clone();
    }
    if patch.procedure_code.is_some() {
        next.procedure_code = patch.procedure_code.clone();
    }

    if let Some(fields) = &patch.missing_fields {
        next.missing_fields = fields.clone();
    }
    if let Some(master) = &patch.assigned_master_id {
        next.assigned_master_id = Some(master.clone());
    }
    if let Some(until) = patch.aplazado_until {
        next.aplazado_until = until;
    }
    if let Some(reason) = &patch.cancellation_reason {
        next.cancellation_reason = Some(reason.trim().to_string());
    }
    if let Some(start) = patch.new_start_date {
        next.new_start_date = Some(start);
    }
    if let Some(end) = patch.new_end_date {
        next.new_end_date = Some(end);
    }

    // Write-once within an episode: an existing stamp is never overwritten.
    if next.first_response_at.is_none() {
        next.first_response_at = patch.first_response_at;
    }
    if let Some(closed) = patch.closed_at {
        next.closed_at = Some(closed);
    }
    // Monotonic: time alone never clears a breach.
    if let Some(breached) = patch.sla_breached {
        next.sla_breached = current.sla_breached || breached;
    }

    if next.status == CaseStatus::CerradoCancelado
        && next
            .cancellation_reason
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
    {
        return Err(CaseError::MissingRequiredField(
            "cancellation_reason".to_string(),
        ));
    }

    next.is_provisional = next.ticket.is_none();
    next.updated_at = now;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{sample_draft as draft, test_db};
    use super::*;

    #[test]
    fn test_create_starts_pending_and_provisional() {
        let db = test_db();
        let case = db.create_case(&draft("b1", Utc::now())).unwrap();
        assert_eq!(case.status, CaseStatus::Pendiente);
        assert!(case.ticket.is_none());
        assert!(case.is_provisional);
        assert_eq!(case.created_at, case.updated_at);
    }

    #[test]
    fn test_create_requires_broker() {
        let db = test_db();
        let err = db.create_case(&draft("  ", Utc::now())).unwrap_err();
        assert!(matches!(err, CaseError::MissingRequiredField(ref f) if f == "broker_id"));
    }

    #[test]
    fn test_get_missing_case_is_not_found() {
        let db = test_db();
        assert!(db.get_case("nope").unwrap().is_none());
        assert!(matches!(db.require_case("nope"), Err(CaseError::NotFound(_))));
    }

    #[test]
    fn test_update_refreshes_updated_at() {
        let db = test_db();
        let created = Utc::now() - chrono::Duration::hours(1);
        let case = db.create_case(&draft("b1", created)).unwrap();
        let now = Utc::now();
        let updated = db
            .update_case(&case.id, &CasePatch::new().assigned_master("master-2"), now)
            .unwrap();
        assert_eq!(updated.updated_at.timestamp_micros(), now.timestamp_micros());
        assert_eq!(updated.assigned_master_id.as_deref(), Some("master-2"));
    }

    #[test]
    fn test_update_rejects_illegal_edge_and_keeps_status() {
        let db = test_db();
        let case = db.create_case(&draft("b1", Utc::now())).unwrap();
        let err = db
            .update_case(
                &case.id,
                &CasePatch::new().status(CaseStatus::CerradoRenovado),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, CaseError::InvalidTransition { .. }));
        assert_eq!(db.require_case(&case.id).unwrap().status, CaseStatus::Pendiente);
    }

    #[test]
    fn test_update_rejects_cancel_without_reason() {
        let db = test_db();
        let case = db.create_case(&draft("b1", Utc::now())).unwrap();
        db.update_case(&case.id, &CasePatch::new().status(CaseStatus::EnRevision), Utc::now())
            .unwrap();
        let err = db
            .update_case(
                &case.id,
                &CasePatch::new()
                    .status(CaseStatus::CerradoCancelado)
                    .cancellation_reason("   "),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, CaseError::MissingRequiredField(_)));
        assert_eq!(db.require_case(&case.id).unwrap().status, CaseStatus::EnRevision);
    }

    #[test]
    fn test_stale_expected_status_is_conflict() {
        let db = test_db();
        let case = db.create_case(&draft("b1", Utc::now())).unwrap();
        db.update_case(&case.id, &CasePatch::new().status(CaseStatus::EnRevision), Utc::now())
            .unwrap();
        let err = db
            .update_case(
                &case.id,
                &CasePatch::new()
                    .expecting(CaseStatus::Pendiente)
                    .status(CaseStatus::EnRevision),
                Utc::now(),
            )
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_ticket_is_set_once() {
        let db = test_db();
        let case = db.create_case(&draft("b1", Utc::now())).unwrap();
        let with_ticket = db
            .update_case(&case.id, &CasePatch::new().ticket("2601030102001"), Utc::now())
            .unwrap();
        assert_eq!(with_ticket.ticket.as_deref(), Some("2601030102001"));
        assert!(!with_ticket.is_provisional);

        let err = db
            .update_case(&case.id, &CasePatch::new().ticket("2601030102002"), Utc::now())
            .unwrap_err();
        assert!(matches!(err, CaseError::TicketAlreadyIssued { .. }));

        // Same value again is a no-op, not an error.
        db.update_case(&case.id, &CasePatch::new().ticket("2601030102001"), Utc::now())
            .unwrap();
    }

    #[test]
    fn test_codes_frozen_after_ticket() {
        let db = test_db();
        let case = db.create_case(&draft("b1", Utc::now())).unwrap();
        db.update_case(&case.id, &CasePatch::new().ticket("2601030102001"), Utc::now())
            .unwrap();
        let err = db
            .update_case(
                &case.id,
                &CasePatch::new().codes(Some("04".into()), None, None),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, CaseError::TicketAlreadyIssued { .. }));
    }

    #[test]
    fn test_sla_flag_is_monotonic() {
        let db = test_db();
        let case = db.create_case(&draft("b1", Utc::now())).unwrap();
        db.update_case(&case.id, &CasePatch::new().sla_breached(true), Utc::now())
            .unwrap();
        let after = db
            .update_case(&case.id, &CasePatch::new().sla_breached(false), Utc::now())
            .unwrap();
        assert!(after.sla_breached);
    }

    #[test]
    fn test_find_recent_by_broker_returns_newest_in_window() {
        let db = test_db();
        let now = Utc::now();
        db.create_case(&draft("b1", now - chrono::Duration::hours(30)))
            .unwrap();
        let older = db
            .create_case(&draft("b1", now - chrono::Duration::hours(5)))
            .unwrap();
        let newest = db
            .create_case(&draft("b1", now - chrono::Duration::hours(1)))
            .unwrap();
        db.create_case(&draft("b2", now)).unwrap();

        let found = db
            .find_recent_by_broker("b1", chrono::Duration::hours(24), now)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, newest.id);
        assert_ne!(found.id, older.id);

        assert!(db
            .find_recent_by_broker("b3", chrono::Duration::hours(24), now)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_cases_cannot_be_deleted() {
        let db = test_db();
        let case = db.create_case(&draft("b1", Utc::now())).unwrap();
        let result = db
            .conn_ref()
            .execute("DELETE FROM cases WHERE id = ?1", params![case.id]);
        assert!(result.is_err());
    }
}
