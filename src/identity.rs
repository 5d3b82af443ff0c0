//! Identity resolver: which broker a message belongs to, and which master
//! handles its routing bucket.

use std::collections::HashMap;

use serde::Serialize;

use crate::db::{CaseDb, DbRouting};
use crate::error::CaseError;
use crate::util::extract_email_address;

/// Routing bucket for life and personal lines.
pub const VIDA_PERSONAS: &str = "vida_personas";
/// Routing bucket for general lines.
pub const RAMOS_GENERALES: &str = "ramos_generales";

/// Which address produced the broker match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Detected,
    From,
    Cc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedBroker {
    pub broker_id: String,
    pub email: String,
    pub matched_by: MatchSource,
}

/// Resolve the broker for a message.
///
/// Candidates are tried in order: classifier-detected address, `From`, then
/// each `Cc` in order. The first active broker wins. Header forms like
/// `Name <addr>` are accepted; matching is case-insensitive.
pub fn resolve_broker(
    db: &CaseDb,
    detected: Option<&str>,
    from: &str,
    cc: &[String],
) -> Result<ResolvedBroker, CaseError> {
    let mut candidates: Vec<(MatchSource, String)> = Vec::with_capacity(cc.len() + 2);
    if let Some(detected) = detected {
        candidates.push((MatchSource::Detected, extract_email_address(detected)));
    }
    candidates.push((MatchSource::From, extract_email_address(from)));
    candidates.extend(cc.iter().map(|c| (MatchSource::Cc, extract_email_address(c))));

    for (source, email) in candidates {
        if email.is_empty() {
            continue;
        }
        if let Some(profile) = db.find_profile_by_email(&email)? {
            if profile.is_active_broker() {
                log::debug!("Identity: matched broker {} via {:?}", profile.id, source);
                return Ok(ResolvedBroker {
                    broker_id: profile.id,
                    email,
                    matched_by: source,
                });
            }
        }
    }

    Err(CaseError::UnresolvedBroker {
        from: from.to_string(),
        cc: cc.join(", "),
    })
}

/// Map a classifier bucket onto a routing bucket.
pub fn routing_bucket(classifier_bucket: &str) -> &'static str {
    match classifier_bucket.trim().to_lowercase().as_str() {
        "ramos_generales" => RAMOS_GENERALES,
        // vida_assa, ramo_personas and anything unplaced go to life/personal.
        _ => VIDA_PERSONAS,
    }
}

/// Routing table captured once per pipeline invocation.
#[derive(Debug, Clone, Default)]
pub struct RoutingSnapshot {
    entries: HashMap<String, DbRouting>,
}

impl RoutingSnapshot {
    pub fn load(db: &CaseDb) -> Result<Self, CaseError> {
        Ok(Self::from_entries(db.list_routing()?))
    }

    pub fn from_entries(entries: Vec<DbRouting>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.bucket.clone(), entry))
                .collect(),
        }
    }

    /// Effective master for a classifier bucket, if the bucket is routed.
    pub fn master_for(&self, classifier_bucket: &str) -> Option<&str> {
        self.entries
            .get(routing_bucket(classifier_bucket))
            .map(DbRouting::effective_master_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::DbProfile;

    fn profile(id: &str, email: &str, role: &str, active: bool) -> DbProfile {
        DbProfile {
            id: id.to_string(),
            email: email.to_string(),
            full_name: None,
            role: role.to_string(),
            active,
        }
    }

    fn seeded() -> CaseDb {
        let db = test_db();
        db.upsert_profile(&profile("b-detected", "detected@corredora.com", "broker", true))
            .unwrap();
        db.upsert_profile(&profile("b-from", "from@corredora.com", "broker", true))
            .unwrap();
        db.upsert_profile(&profile("b-cc", "cc@corredora.com", "broker", true))
            .unwrap();
        db.upsert_profile(&profile("b-gone", "gone@corredora.com", "broker", false))
            .unwrap();
        db.upsert_profile(&profile("m1", "master@lissa.com", "master", true))
            .unwrap();
        db
    }

    #[test]
    fn test_detected_address_wins() {
        let db = seeded();
        let resolved = resolve_broker(
            &db,
            Some("DETECTED@corredora.com"),
            "From@Corredora.com",
            &["cc@corredora.com".to_string()],
        )
        .unwrap();
        assert_eq!(resolved.broker_id, "b-detected");
        assert_eq!(resolved.matched_by, MatchSource::Detected);
    }

    #[test]
    fn test_falls_back_to_from_then_cc() {
        let db = seeded();
        let resolved =
            resolve_broker(&db, Some("nobody@x.com"), "Ana <from@corredora.com>", &[]).unwrap();
        assert_eq!(resolved.broker_id, "b-from");
        assert_eq!(resolved.matched_by, MatchSource::From);

        let resolved = resolve_broker(
            &db,
            None,
            "client@gmail.com",
            &["stranger@x.com".to_string(), "CC@corredora.com".to_string()],
        )
        .unwrap();
        assert_eq!(resolved.broker_id, "b-cc");
        assert_eq!(resolved.matched_by, MatchSource::Cc);
    }

    #[test]
    fn test_inactive_and_non_broker_profiles_do_not_resolve() {
        let db = seeded();
        let err = resolve_broker(
            &db,
            Some("gone@corredora.com"),
            "master@lissa.com",
            &["client@gmail.com".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, CaseError::UnresolvedBroker { .. }));
        assert!(err.requires_user_action());
    }

    #[test]
    fn test_bucket_mapping() {
        assert_eq!(routing_bucket("vida_assa"), VIDA_PERSONAS);
        assert_eq!(routing_bucket("ramo_personas"), VIDA_PERSONAS);
        assert_eq!(routing_bucket("Ramos_Generales"), RAMOS_GENERALES);
        assert_eq!(routing_bucket("desconocido"), VIDA_PERSONAS);
    }

    #[test]
    fn test_snapshot_uses_backup_while_on_leave() {
        let snapshot = RoutingSnapshot::from_entries(vec![
            DbRouting {
                bucket: VIDA_PERSONAS.to_string(),
                primary_master_id: "m-vida".to_string(),
                backup_master_id: Some("m-backup".to_string()),
                on_leave: true,
            },
            DbRouting {
                bucket: RAMOS_GENERALES.to_string(),
                primary_master_id: "m-generales".to_string(),
                backup_master_id: None,
                on_leave: true,
            },
        ]);
        assert_eq!(snapshot.master_for("vida_assa"), Some("m-backup"));
        // No backup: the primary stays responsible.
        assert_eq!(snapshot.master_for("ramos_generales"), Some("m-generales"));
        assert_eq!(RoutingSnapshot::default().master_for("vida_assa"), None);
    }

    #[test]
    fn test_snapshot_loads_from_store() {
        let db = test_db();
        db.set_routing(RAMOS_GENERALES, "m-generales", None).unwrap();
        let snapshot = RoutingSnapshot::load(&db).unwrap();
        assert_eq!(snapshot.master_for("ramos_generales"), Some("m-generales"));
        assert_eq!(snapshot.master_for("vida_assa"), None);
    }
}
