//! Ticket sequencer.
//!
//! A ticket is `AAMM` + ramo (2) + insurer (2) + procedure (2) + a
//! correlative that restarts at 1 for every distinct key. Correlatives come
//! from an atomic increment at the store, never from read-max-then-write.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::json;

use crate::audit::{self, AuditAction, HistoryEvent};
use crate::db::CaseDb;
use crate::error::CaseError;
use crate::types::{Actor, Case, CasePatch};

/// Minimum correlative width; larger values widen the ticket.
const CORRELATIVE_WIDTH: usize = 3;

/// The tuple a correlative is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TicketKey {
    pub period: String,
    pub ramo_code: String,
    pub insurer_code: String,
    pub procedure_code: String,
}

impl TicketKey {
    /// Build the key for a case at `now`. Fails while any code is missing.
    pub fn for_case(case: &Case, now: DateTime<Utc>, tz: Tz) -> Result<Self, CaseError> {
        let code = |value: &Option<String>, name: &str| {
            value
                .clone()
                .ok_or_else(|| CaseError::MissingRequiredField(name.to_string()))
        };
        Ok(Self {
            period: period_for(now, tz),
            ramo_code: code(&case.ramo_code, "ramo_code")?,
            insurer_code: code(&case.insurer_code, "insurer_code")?,
            procedure_code: code(&case.procedure_code, "procedure_code")?,
        })
    }
}

/// Ticket period (`AAMM`) for an instant, in the business timezone.
pub fn period_for(now: DateTime<Utc>, tz: Tz) -> String {
    now.with_timezone(&tz).format("%y%m").to_string()
}

/// Normalize a classifier code to two digits.
///
/// Blank means absent. `"1"` becomes `"01"`; `"001"` is accepted as `"01"`;
/// anything non-numeric or above 99 is rejected.
pub fn normalize_code(raw: &str) -> Result<Option<String>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("code '{}' is not numeric", trimmed));
    }
    match trimmed.parse::<u32>() {
        Ok(value) if value <= 99 => Ok(Some(format!("{:02}", value))),
        _ => Err(format!("code '{}' does not fit two digits", trimmed)),
    }
}

pub fn format_ticket(key: &TicketKey, correlative: u32) -> String {
    format!(
        "{}{}{}{}{:0width$}",
        key.period,
        key.ramo_code,
        key.insurer_code,
        key.procedure_code,
        correlative,
        width = CORRELATIVE_WIDTH
    )
}

/// Claim the next ticket for a key.
pub fn issue_ticket(db: &CaseDb, key: &TicketKey) -> Result<String, CaseError> {
    let correlative = db.next_correlative(
        &key.period,
        &key.ramo_code,
        &key.insurer_code,
        &key.procedure_code,
    )?;
    Ok(format_ticket(key, correlative))
}

/// Issue and attach a ticket to a provisional case, with its history and
/// audit rows, as one unit of work.
pub fn assign_ticket(
    db: &CaseDb,
    case: &Case,
    now: DateTime<Utc>,
    tz: Tz,
    actor: &Actor,
) -> Result<Case, CaseError> {
    if let Some(existing) = &case.ticket {
        return Err(CaseError::TicketAlreadyIssued {
            case_id: case.id.clone(),
            ticket: existing.clone(),
        });
    }
    let key = TicketKey::for_case(case, now, tz)?;

    db.with_transaction(|tx| {
        let ticket = issue_ticket(tx, &key)?;
        let updated = tx.update_case(
            &case.id,
            &CasePatch::new().expecting(case.status).ticket(&ticket),
            now,
        )?;

        audit::record_history(
            tx,
            &case.id,
            HistoryEvent::TicketGenerated,
            json!({ "ticket": ticket }),
            actor,
            now,
        )?;
        audit::record_audit(
            tx,
            actor,
            AuditAction::TicketGenerated,
            &case.id,
            Some(&json!({ "ticket": null })),
            Some(&json!({ "ticket": ticket })),
            now,
        )?;

        log::info!("TicketSequencer: issued {} for case {}", ticket, case.id);
        Ok(updated)
    })
}
