use super::*;

use crate::types::{InboundMessage, MessageState};

const INBOUND_COLUMNS: &str = "message_id, from_address, cc_addresses, subject, body, state,
    classification_attempts, last_error, case_id, received_at, updated_at";

impl CaseDb {
    // =========================================================================
    // Inbound message ledger
    // =========================================================================

    /// Record an inbound message. Re-recording a known message id is a no-op
    /// and returns the existing row.
    pub fn record_inbound(&self, msg: &InboundMessage, now: DateTime<Utc>) -> Result<DbInboundMessage, DbError> {
        let cc = serde_json::to_string(&msg.cc_addresses)?;
        self.conn.execute(
            "INSERT INTO inbound_messages
                (message_id, from_address, cc_addresses, subject, body, state, received_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'received', ?6, ?6)
             ON CONFLICT(message_id) DO NOTHING",
            params![msg.message_id, msg.from_address, cc, msg.subject, msg.body, ts(now)],
        )?;
        self.get_inbound(&msg.message_id)?
            .ok_or_else(|| DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }

    pub fn get_inbound(&self, message_id: &str) -> Result<Option<DbInboundMessage>, DbError> {
        let sql = format!("SELECT {INBOUND_COLUMNS} FROM inbound_messages WHERE message_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![message_id], map_inbound_row)
            .optional()?)
    }

    /// The message produced (or joined) a case.
    pub fn mark_inbound_linked(&self, message_id: &str, case_id: &str, now: DateTime<Utc>) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE inbound_messages
             SET state = 'linked', case_id = ?1, last_error = NULL, updated_at = ?2
             WHERE message_id = ?3",
            params![case_id, ts(now), message_id],
        )?;
        Ok(())
    }

    /// Park a message for manual handling.
    pub fn mark_inbound_triage(&self, message_id: &str, reason: &str, now: DateTime<Utc>) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE inbound_messages
             SET state = 'triage', last_error = ?1, updated_at = ?2
             WHERE message_id = ?3 AND state != 'linked'",
            params![reason, ts(now), message_id],
        )?;
        Ok(())
    }

    /// Count a failed classification attempt and queue the message for retry.
    /// Returns the attempt count after the increment.
    pub fn mark_inbound_retry(&self, message_id: &str, error: &str, now: DateTime<Utc>) -> Result<u32, DbError> {
        let attempts: Option<i64> = self
            .conn
            .query_row(
                "UPDATE inbound_messages
                 SET state = 'retry',
                     classification_attempts = classification_attempts + 1,
                     last_error = ?1,
                     updated_at = ?2
                 WHERE message_id = ?3 AND state != 'linked'
                 RETURNING classification_attempts",
                params![error, ts(now), message_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(attempts.unwrap_or(0) as u32)
    }

    pub fn list_inbound_by_state(&self, state: MessageState) -> Result<Vec<DbInboundMessage>, DbError> {
        let sql = format!(
            "SELECT {INBOUND_COLUMNS} FROM inbound_messages WHERE state = ?1 ORDER BY received_at"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![state.as_str()], map_inbound_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Messages waiting for manual triage.
    pub fn list_triage(&self) -> Result<Vec<DbInboundMessage>, DbError> {
        self.list_inbound_by_state(MessageState::Triage)
    }

    /// Messages queued for another classifier run, under the attempt cap.
    pub fn list_pending_classification(&self, max_attempts: u32) -> Result<Vec<DbInboundMessage>, DbError> {
        let sql = format!(
            "SELECT {INBOUND_COLUMNS} FROM inbound_messages
             WHERE state = 'retry' AND classification_attempts < ?1
             ORDER BY received_at"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![max_attempts], map_inbound_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // =========================================================================
    // Case <-> message links
    // =========================================================================

    /// Link a message to a case. A message links to at most one case;
    /// returns false when the link already existed.
    pub fn link_message(
        &self,
        case_id: &str,
        message_id: &str,
        linked_by: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let rows = self.conn.execute(
            "INSERT INTO case_messages (case_id, message_id, linked_by, linked_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT DO NOTHING",
            params![case_id, message_id, linked_by, ts(now)],
        )?;
        Ok(rows > 0)
    }

    /// The case a message is linked to, if any.
    pub fn case_for_message(&self, message_id: &str) -> Result<Option<String>, DbError> {
        Ok(self
            .conn
            .query_row(
                "SELECT case_id FROM case_messages WHERE message_id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn list_case_messages(&self, case_id: &str) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id FROM case_messages WHERE case_id = ?1 ORDER BY linked_at, rowid",
        )?;
        let rows = stmt.query_map(params![case_id], |row| row.get(0))?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

fn map_inbound_row(row: &Row<'_>) -> rusqlite::Result<DbInboundMessage> {
    let cc: String = row.get(2)?;
    let state: String = row.get(5)?;
    Ok(DbInboundMessage {
        message_id: row.get(0)?,
        from_address: row.get(1)?,
        cc_addresses: serde_json::from_str(&cc).unwrap_or_default(),
        subject: row.get(3)?,
        body: row.get(4)?,
        state: MessageState::parse(&state).unwrap_or(MessageState::Received),
        classification_attempts: row.get::<_, i64>(6)? as u32,
        last_error: row.get(7)?,
        case_id: row.get(8)?,
        received_at: get_ts(row, 9)?,
        updated_at: get_ts(row, 10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{sample_draft, test_db};
    use super::*;

    fn message(id: &str) -> InboundMessage {
        InboundMessage {
            message_id: id.to_string(),
            from_address: "broker@x.com".to_string(),
            cc_addresses: vec!["other@x.com".to_string()],
            subject: "Renovación póliza".to_string(),
            body: String::new(),
            attachments_summary: Vec::new(),
            classification: None,
        }
    }

    #[test]
    fn test_record_inbound_is_idempotent() {
        let db = test_db();
        let first = db.record_inbound(&message("m1"), Utc::now()).unwrap();
        db.mark_inbound_retry("m1", "timeout", Utc::now()).unwrap();
        let again = db.record_inbound(&message("m1"), Utc::now()).unwrap();
        assert_eq!(first.received_at, again.received_at);
        assert_eq!(again.state, MessageState::Retry);
        assert_eq!(again.cc_addresses, vec!["other@x.com".to_string()]);
    }

    #[test]
    fn test_retry_counts_attempts() {
        let db = test_db();
        db.record_inbound(&message("m1"), Utc::now()).unwrap();
        assert_eq!(db.mark_inbound_retry("m1", "timeout", Utc::now()).unwrap(), 1);
        assert_eq!(db.mark_inbound_retry("m1", "timeout", Utc::now()).unwrap(), 2);
        assert_eq!(db.list_pending_classification(3).unwrap().len(), 1);
        assert!(db.list_pending_classification(2).unwrap().is_empty());

        db.mark_inbound_triage("m1", "classifier unavailable", Utc::now())
            .unwrap();
        assert!(db.list_pending_classification(3).unwrap().is_empty());
        let triage = db.list_triage().unwrap();
        assert_eq!(triage.len(), 1);
        assert_eq!(triage[0].last_error.as_deref(), Some("classifier unavailable"));
    }

    #[test]
    fn test_linked_message_leaves_ledger_queues() {
        let db = test_db();
        db.record_inbound(&message("m1"), Utc::now()).unwrap();
        let case = db.create_case(&sample_draft("b1", Utc::now())).unwrap();
        db.mark_inbound_linked("m1", &case.id, Utc::now()).unwrap();
        db.mark_inbound_triage("m1", "late failure", Utc::now()).unwrap();
        let row = db.get_inbound("m1").unwrap().unwrap();
        assert_eq!(row.state, MessageState::Linked);
        assert_eq!(row.case_id.as_deref(), Some(case.id.as_str()));
    }

    #[test]
    fn test_message_links_to_one_case() {
        let db = test_db();
        let a = db.create_case(&sample_draft("b1", Utc::now())).unwrap();
        let b = db.create_case(&sample_draft("b1", Utc::now())).unwrap();
        assert!(db.link_message(&a.id, "m1", "system", Utc::now()).unwrap());
        assert!(!db.link_message(&a.id, "m1", "system", Utc::now()).unwrap());
        assert!(!db.link_message(&b.id, "m1", "system", Utc::now()).unwrap());
        assert_eq!(db.case_for_message("m1").unwrap(), Some(a.id.clone()));
        assert_eq!(db.list_case_messages(&a.id).unwrap(), vec!["m1".to_string()]);
        assert!(db.list_case_messages(&b.id).unwrap().is_empty());
    }
}
