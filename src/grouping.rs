//! Dedup/grouping resolver.
//!
//! Decides whether an inbound message belongs to an existing case or needs a
//! new one. Rules run in strict precedence; the first match wins.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::db::CaseDb;
use crate::error::CaseError;
use crate::types::Case;
use crate::util::extract_email_address;

/// Ticket-shaped tokens: runs of 12 or more digits.
fn ticket_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{12,}").expect("ticket regex"))
}

/// Rule that attached a message to an existing case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingRule {
    TicketReference,
    SameSenderWindow,
}

impl GroupingRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupingRule::TicketReference => "ticket_reference",
            GroupingRule::SameSenderWindow => "same_sender_window",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupingMatch {
    pub case: Case,
    pub rule: GroupingRule,
}

/// Ticket-shaped tokens in a subject line, in order of appearance.
pub fn ticket_candidates(subject: &str) -> Vec<String> {
    ticket_pattern()
        .find_iter(subject)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Find the case an inbound message should join, if any.
///
/// 1. A ticket-shaped token in the subject that names an existing ticket.
/// 2. Otherwise, the single most recent case for the broker created inside
///    the window, provided its origin address equals the message sender.
///
/// Older cases in the window are never considered when the newest one does
/// not match the sender.
pub fn find_existing_case(
    db: &CaseDb,
    broker_id: &str,
    from_address: &str,
    subject: &str,
    window: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<Option<GroupingMatch>, CaseError> {
    for candidate in ticket_candidates(subject) {
        if let Some(case) = db.get_case_by_ticket(&candidate)? {
            log::debug!("Grouping: ticket {} -> case {}", candidate, case.id);
            return Ok(Some(GroupingMatch {
                case,
                rule: GroupingRule::TicketReference,
            }));
        }
    }

    let sender = extract_email_address(from_address);
    if sender.is_empty() {
        return Ok(None);
    }
    if let Some(case) = db.find_recent_by_broker(broker_id, window, now)? {
        let same_sender = case
            .origin_address
            .as_deref()
            .map(|origin| extract_email_address(origin) == sender)
            .unwrap_or(false);
        if same_sender {
            log::debug!("Grouping: same sender {} -> case {}", sender, case.id);
            return Ok(Some(GroupingMatch {
                case,
                rule: GroupingRule::SameSenderWindow,
            }));
        }
    }

    Ok(None)
}
