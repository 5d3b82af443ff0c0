use super::*;

use uuid::Uuid;

impl CaseDb {
    // =========================================================================
    // Case history (broker-facing timeline)
    // =========================================================================

    /// Append a history event. Rows are never updated or deleted.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_history_event(
        &self,
        case_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        actor_role: &str,
        actor_id: Option<&str>,
        visible_to_broker: bool,
        created_at: DateTime<Utc>,
    ) -> Result<String, DbError> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO case_history_events
                (id, case_id, event_type, payload, actor_role, actor_id, visible_to_broker, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                case_id,
                event_type,
                serde_json::to_string(payload)?,
                actor_role,
                actor_id,
                visible_to_broker as i32,
                ts(created_at),
            ],
        )?;
        Ok(id)
    }

    /// History for a case in insertion order. `broker_view` hides internal rows.
    pub fn list_history(&self, case_id: &str, broker_view: bool) -> Result<Vec<DbCaseEvent>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, case_id, event_type, payload, actor_role, actor_id, visible_to_broker, created_at
             FROM case_history_events
             WHERE case_id = ?1 AND (?2 = 0 OR visible_to_broker = 1)
             ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(params![case_id, broker_view as i32], |row| {
            let payload: String = row.get(3)?;
            Ok(DbCaseEvent {
                id: row.get(0)?,
                case_id: row.get(1)?,
                event_type: row.get(2)?,
                payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                actor_role: row.get(4)?,
                actor_id: row.get(5)?,
                visible_to_broker: row.get::<_, i64>(6)? != 0,
                created_at: get_ts(row, 7)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn count_history(&self, case_id: &str) -> Result<usize, DbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM case_history_events WHERE case_id = ?1",
            params![case_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
