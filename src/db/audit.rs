use super::*;

use uuid::Uuid;

impl CaseDb {
    // =========================================================================
    // Security audit log (internal)
    // =========================================================================

    /// Append an audit row with optional before/after snapshots.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_audit_log(
        &self,
        actor_type: &str,
        actor_id: Option<&str>,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        before_state: Option<&serde_json::Value>,
        after_state: Option<&serde_json::Value>,
        created_at: DateTime<Utc>,
    ) -> Result<String, DbError> {
        let id = Uuid::new_v4().to_string();
        let before_json = before_state.map(serde_json::to_string).transpose()?;
        let after_json = after_state.map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT INTO security_audit_logs
                (id, actor_type, actor_id, action, entity_type, entity_id, before_state, after_state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                actor_type,
                actor_id,
                action,
                entity_type,
                entity_id,
                before_json,
                after_json,
                ts(created_at),
            ],
        )?;
        Ok(id)
    }

    /// Audit rows for one entity, oldest first.
    pub fn list_audit_logs(&self, entity_type: &str, entity_id: &str) -> Result<Vec<DbAuditLog>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, actor_type, actor_id, action, entity_type, entity_id,
                    before_state, after_state, created_at
             FROM security_audit_logs
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(params![entity_type, entity_id], |row| {
            let before: Option<String> = row.get(6)?;
            let after: Option<String> = row.get(7)?;
            Ok(DbAuditLog {
                id: row.get(0)?,
                actor_type: row.get(1)?,
                actor_id: row.get(2)?,
                action: row.get(3)?,
                entity_type: row.get(4)?,
                entity_id: row.get(5)?,
                before_state: before.and_then(|s| serde_json::from_str(&s).ok()),
                after_state: after.and_then(|s| serde_json::from_str(&s).ok()),
                created_at: get_ts(row, 8)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
