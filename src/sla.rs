//! First-response SLA.
//!
//! A case breaches when it has no first response, is not closed, and is older
//! than its type's threshold. The stored flag is monotonic: the sweep only
//! ever sets it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::audit::{self, AuditAction, HistoryEvent};
use crate::db::CaseDb;
use crate::error::CaseError;
use crate::types::{Actor, Case, CasePatch, Config};

/// Read-time SLA status of a case.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaView {
    pub breached: bool,
    pub threshold_hours: u32,
    pub hours_elapsed: f64,
    /// `None` once the clock has stopped (responded or closed).
    pub hours_remaining: Option<f64>,
}

/// Breach condition, evaluated at `now`.
pub fn is_breached(case: &Case, now: DateTime<Utc>, threshold_hours: u32) -> bool {
    case.first_response_at.is_none()
        && !case.status.is_terminal()
        && now - case.created_at > chrono::Duration::hours(threshold_hours as i64)
}

impl Case {
    pub fn sla_view(&self, now: DateTime<Utc>, threshold_hours: u32) -> SlaView {
        let clock_end = self.first_response_at.or(self.closed_at).unwrap_or(now);
        let hours_elapsed = (clock_end - self.created_at).num_seconds().max(0) as f64 / 3600.0;
        let running = self.first_response_at.is_none() && !self.status.is_terminal();
        SlaView {
            breached: self.sla_breached || is_breached(self, now, threshold_hours),
            threshold_hours,
            hours_elapsed,
            hours_remaining: running.then(|| (threshold_hours as f64 - hours_elapsed).max(0.0)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaSweepReport {
    pub checked: usize,
    pub newly_breached: Vec<String>,
    pub deferred: usize,
}

/// Flag every case that has breached its first-response SLA.
///
/// Each newly flagged case gets one `sla_breached` history row and one
/// `SLA_BREACHED` audit row in the same transaction as the flag.
pub fn sla_sweep(db: &CaseDb, config: &Config, now: DateTime<Utc>) -> Result<SlaSweepReport, CaseError> {
    let candidates = db.list_sla_candidates()?;
    let mut report = SlaSweepReport {
        checked: candidates.len(),
        ..Default::default()
    };

    for case in candidates {
        let threshold = config.sla_hours_for(&case.case_type);
        if !is_breached(&case, now, threshold) {
            continue;
        }

        let result = db.with_transaction(|tx| {
            let updated = tx.update_case(
                &case.id,
                &CasePatch::new().expecting(case.status).sla_breached(true),
                now,
            )?;
            let payload = json!({
                "threshold_hours": threshold,
                "created_at": case.created_at,
            });
            let actor = Actor::system();
            audit::record_history(tx, &case.id, HistoryEvent::SlaBreached, payload, &actor, now)?;
            audit::record_audit(
                tx,
                &actor,
                AuditAction::SlaBreached,
                &case.id,
                Some(&json!({ "sla_breached": false })),
                Some(&json!({ "sla_breached": true })),
                now,
            )?;
            Ok::<_, CaseError>(updated)
        });

        match result {
            Ok(_) => report.newly_breached.push(case.id.clone()),
            // A concurrent change (e.g. first response) won; the next sweep re-evaluates.
            Err(e) if e.is_retryable() => {
                log::warn!("SLA: case {} deferred: {}", case.id, e);
                report.deferred += 1;
            }
            Err(e) => return Err(e),
        }
    }

    if !report.newly_breached.is_empty() {
        log::info!(
            "SLA: {} of {} open case(s) newly breached",
            report.newly_breached.len(),
            report.checked
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::{sample_draft, test_db};
    use crate::lifecycle::{transition, TransitionRequest};
    use crate::types::CaseStatus;
    use chrono::Duration;

    #[test]
    fn test_sla_view_counts_down() {
        let db = test_db();
        let now = Utc::now();
        let case = db
            .create_case(&sample_draft("b1", now - Duration::hours(10)))
            .unwrap();
        let view = case.sla_view(now, 24);
        assert!(!view.breached);
        assert!((view.hours_elapsed - 10.0).abs() < 0.01);
        assert!((view.hours_remaining.unwrap() - 14.0).abs() < 0.01);

        let view = case.sla_view(now + Duration::hours(20), 24);
        assert!(view.breached);
        assert_eq!(view.hours_remaining, Some(0.0));
    }

    #[test]
    fn test_sweep_flags_only_overdue_unanswered_cases() {
        let db = test_db();
        let now = Utc::now();
        let overdue = db
            .create_case(&sample_draft("b1", now - Duration::hours(30)))
            .unwrap();
        let fresh = db
            .create_case(&sample_draft("b1", now - Duration::hours(2)))
            .unwrap();
        let answered = db
            .create_case(&sample_draft("b1", now - Duration::hours(30)))
            .unwrap();
        transition(
            &db,
            &TransitionRequest::new(&answered.id, CaseStatus::EnRevision, Actor::master("m1")),
            now - Duration::hours(29),
        )
        .unwrap();

        let report = sla_sweep(&db, &Config::default(), now).unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.newly_breached, vec![overdue.id.clone()]);

        assert!(db.require_case(&overdue.id).unwrap().sla_breached);
        assert!(!db.require_case(&fresh.id).unwrap().sla_breached);
        assert!(!db.require_case(&answered.id).unwrap().sla_breached);

        let history = db.list_history(&overdue.id, false).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, "sla_breached");
        assert!(!history[0].visible_to_broker);
        let audit = db.list_audit_logs("case", &overdue.id).unwrap();
        assert_eq!(audit[0].action, "SLA_BREACHED");
    }

    #[test]
    fn test_sweep_is_idempotent_and_flag_is_sticky() {
        let db = test_db();
        let now = Utc::now();
        let case = db
            .create_case(&sample_draft("b1", now - Duration::hours(30)))
            .unwrap();
        sla_sweep(&db, &Config::default(), now).unwrap();
        let second = sla_sweep(&db, &Config::default(), now + Duration::hours(1)).unwrap();
        assert!(second.newly_breached.is_empty());
        assert_eq!(db.count_history(&case.id).unwrap(), 1);

        // Responding later does not clear the flag.
        let responded = transition(
            &db,
            &TransitionRequest::new(&case.id, CaseStatus::EnRevision, Actor::master("m1")),
            now + Duration::hours(2),
        )
        .unwrap();
        assert!(responded.sla_breached);
    }

    #[test]
    fn test_threshold_follows_case_type() {
        let db = test_db();
        let now = Utc::now();
        let case = db
            .create_case(&sample_draft("b1", now - Duration::hours(10)))
            .unwrap();
        let mut config = Config::default();
        config.first_response_sla_hours.insert("renewal".to_string(), 8);
        let report = sla_sweep(&db, &config, now).unwrap();
        assert_eq!(report.newly_breached, vec![case.id]);
    }
}
