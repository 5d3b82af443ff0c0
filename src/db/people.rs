use super::*;

impl CaseDb {
    // =========================================================================
    // Profiles (identity store)
    // =========================================================================

    /// Insert or update a profile. Email is stored lowercased.
    pub fn upsert_profile(&self, profile: &DbProfile) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO profiles (id, email, full_name, role, active, created_at)
             VALUES (?1, LOWER(TRIM(?2)), ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                full_name = COALESCE(excluded.full_name, profiles.full_name),
                role = excluded.role,
                active = excluded.active",
            params![
                profile.id,
                profile.email,
                profile.full_name,
                profile.role,
                profile.active as i32,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Look up a profile by email (case-insensitive).
    pub fn find_profile_by_email(&self, email: &str) -> Result<Option<DbProfile>, DbError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Ok(None);
        }
        Ok(self
            .conn
            .query_row(
                "SELECT id, email, full_name, role, active FROM profiles
                 WHERE lower(email) = ?1",
                params![email],
                map_profile_row,
            )
            .optional()?)
    }

    pub fn get_profile(&self, id: &str) -> Result<Option<DbProfile>, DbError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, email, full_name, role, active FROM profiles WHERE id = ?1",
                params![id],
                map_profile_row,
            )
            .optional()?)
    }

    // =========================================================================
    // Master routing
    // =========================================================================

    /// Set the primary and backup agents for a bucket. Leave state is kept.
    pub fn set_routing(
        &self,
        bucket: &str,
        primary_master_id: &str,
        backup_master_id: Option<&str>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO master_routing (bucket, primary_master_id, backup_master_id, on_leave, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4)
             ON CONFLICT(bucket) DO UPDATE SET
                primary_master_id = excluded.primary_master_id,
                backup_master_id = excluded.backup_master_id,
                updated_at = excluded.updated_at",
            params![bucket, primary_master_id, backup_master_id, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Flag the primary agent of a bucket as absent (or back).
    /// Returns false when the bucket has no routing row.
    pub fn set_on_leave(&self, bucket: &str, on_leave: bool) -> Result<bool, DbError> {
        let rows = self.conn.execute(
            "UPDATE master_routing SET on_leave = ?1, updated_at = ?2 WHERE bucket = ?3",
            params![on_leave as i32, ts(Utc::now()), bucket],
        )?;
        Ok(rows > 0)
    }

    pub fn list_routing(&self) -> Result<Vec<DbRouting>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT bucket, primary_master_id, backup_master_id, on_leave
             FROM master_routing ORDER BY bucket",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DbRouting {
                bucket: row.get(0)?,
                primary_master_id: row.get(1)?,
                backup_master_id: row.get(2)?,
                on_leave: row.get::<_, i64>(3)? != 0,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

fn map_profile_row(row: &Row<'_>) -> rusqlite::Result<DbProfile> {
    Ok(DbProfile {
        id: row.get(0)?,
        email: row.get(1)?,
        full_name: row.get(2)?,
        role: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    fn broker(id: &str, email: &str) -> DbProfile {
        DbProfile {
            id: id.to_string(),
            email: email.to_string(),
            full_name: None,
            role: "broker".to_string(),
            active: true,
        }
    }

    #[test]
    fn test_profile_lookup_is_case_insensitive() {
        let db = test_db();
        db.upsert_profile(&broker("b1", "Ana@Corredora.com")).unwrap();
        let found = db.find_profile_by_email("  ANA@corredora.COM").unwrap().unwrap();
        assert_eq!(found.id, "b1");
        assert_eq!(found.email, "ana@corredora.com");
        assert!(db.find_profile_by_email("").unwrap().is_none());
    }

    #[test]
    fn test_upsert_profile_updates_in_place() {
        let db = test_db();
        db.upsert_profile(&broker("b1", "ana@corredora.com")).unwrap();
        let mut inactive = broker("b1", "ana@corredora.com");
        inactive.active = false;
        db.upsert_profile(&inactive).unwrap();
        let found = db.get_profile("b1").unwrap().unwrap();
        assert!(!found.is_active_broker());
    }

    #[test]
    fn test_routing_leave_flag() {
        let db = test_db();
        db.set_routing("vida_personas", "m1", Some("m2")).unwrap();
        assert!(db.set_on_leave("vida_personas", true).unwrap());
        assert!(!db.set_on_leave("unknown", true).unwrap());

        let routing = db.list_routing().unwrap();
        assert_eq!(routing.len(), 1);
        assert_eq!(routing[0].effective_master_id(), "m2");

        // Re-pointing the bucket keeps the leave flag.
        db.set_routing("vida_personas", "m3", None).unwrap();
        let routing = db.list_routing().unwrap();
        assert!(routing[0].on_leave);
        assert_eq!(routing[0].effective_master_id(), "m3");
    }
}
