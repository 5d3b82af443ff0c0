use super::*;

impl CaseDb {
    // =========================================================================
    // Ticket sequences
    // =========================================================================

    /// Atomically claim the next correlative for a ticket key.
    ///
    /// A single upsert ... RETURNING both creates the key at 1 and increments
    /// it, so two callers can never observe the same value. Called inside the
    /// ticket-assignment transaction, a rollback releases the claim.
    pub fn next_correlative(
        &self,
        year_month: &str,
        ramo_code: &str,
        insurer_code: &str,
        procedure_code: &str,
    ) -> Result<u32, DbError> {
        let value: i64 = self.conn.query_row(
            "INSERT INTO ticket_sequences
                (year_month, ramo_code, insurer_code, procedure_code, last_correlative, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)
             ON CONFLICT(year_month, ramo_code, insurer_code, procedure_code) DO UPDATE SET
                last_correlative = ticket_sequences.last_correlative + 1,
                updated_at = excluded.updated_at
             RETURNING last_correlative",
            params![year_month, ramo_code, insurer_code, procedure_code, ts(Utc::now())],
            |row| row.get(0),
        )?;
        Ok(value as u32)
    }

    /// Last issued correlative for a key, if any.
    pub fn current_correlative(
        &self,
        year_month: &str,
        ramo_code: &str,
        insurer_code: &str,
        procedure_code: &str,
    ) -> Result<Option<u32>, DbError> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "SELECT last_correlative FROM ticket_sequences
                 WHERE year_month = ?1 AND ramo_code = ?2 AND insurer_code = ?3 AND procedure_code = ?4",
                params![year_month, ramo_code, insurer_code, procedure_code],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|v| v as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_sequence_starts_at_one_per_key() {
        let db = test_db();
        assert_eq!(db.next_correlative("2601", "03", "01", "02").unwrap(), 1);
        assert_eq!(db.next_correlative("2601", "03", "01", "02").unwrap(), 2);
        assert_eq!(db.next_correlative("2601", "03", "01", "05").unwrap(), 1);
        assert_eq!(db.next_correlative("2602", "03", "01", "02").unwrap(), 1);
        assert_eq!(
            db.current_correlative("2601", "03", "01", "02").unwrap(),
            Some(2)
        );
        assert_eq!(db.current_correlative("2612", "03", "01", "02").unwrap(), None);
    }

    #[test]
    fn test_rolled_back_claim_is_released() {
        let db = test_db();
        db.next_correlative("2601", "03", "01", "02").unwrap();
        let result: Result<(), DbError> = db.with_transaction(|tx| {
            tx.next_correlative("2601", "03", "01", "02")?;
            Err(DbError::Migration("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(db.next_correlative("2601", "03", "01", "02").unwrap(), 2);
    }
}
