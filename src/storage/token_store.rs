use crate::{
    domain::{error::DomainError, models::EnrollTokenRecord},
    storage::{SqliteStore, util},
};

type TokenRow = (i64, String, String, i64, i64, Option<i64>, i64, i64);

const TOKEN_COLUMNS: &str =
    "id, token, remark, max_uses, used_count, expires_at_ms, enabled, created_at_ms";

impl SqliteStore {
    pub async fn insert_enroll_token(
        &self,
        token: &str,
        remark: &str,
        max_uses: i64,
        expires_at_ms: Option<i64>,
    ) -> Result<EnrollTokenRecord, DomainError> {
        let now = util::now_unix_ms();
        let id = sqlx::query(
            "INSERT INTO enroll_tokens(token, remark, max_uses, used_count, expires_at_ms, enabled, created_at_ms) \
             VALUES(?, ?, ?, 0, ?, 1, ?)",
        )
        .bind(token)
        .bind(remark)
        .bind(max_uses)
        .bind(expires_at_ms)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to insert token: {error}")))?
        .last_insert_rowid();

        Ok(EnrollTokenRecord {
            id,
            token: token.to_owned(),
            remark: remark.to_owned(),
            max_uses,
            used_count: 0,
            expires_at_ms,
            enabled: true,
            created_at_ms: now,
        })
    }

    pub async fn get_enroll_token(
        &self,
        token: &str,
    ) -> Result<Option<EnrollTokenRecord>, DomainError> {
        let row = sqlx::query_as::<_, TokenRow>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM enroll_tokens WHERE token = ? LIMIT 1"
        ))
        .bind(token)
        .fetch_optional(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to get token: {error}")))?;

        Ok(row.map(map_token_row))
    }

    pub async fn list_enroll_tokens(&self) -> Result<Vec<EnrollTokenRecord>, DomainError> {
        let rows = sqlx::query_as::<_, TokenRow>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM enroll_tokens ORDER BY id DESC"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to list tokens: {error}")))?;

        Ok(rows.into_iter().map(map_token_row).collect())
    }

    pub async fn remove_enroll_token(&self, id: i64) -> Result<bool, DomainError> {
        let result = sqlx::query("DELETE FROM enroll_tokens WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to remove token: {error}")))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_enroll_token_enabled(&self, id: i64, enabled: bool) -> Result<(), DomainError> {
        sqlx::query("UPDATE enroll_tokens SET enabled = ? WHERE id = ?")
            .bind(i64::from(enabled))
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to toggle token: {error}")))?;
        Ok(())
    }

    /// Single-statement increment so concurrent consumers cannot exceed
    /// the configured use budget.
    pub async fn consume_enroll_token(&self, id: i64) -> Result<bool, DomainError> {
        let result = sqlx::query(
            "UPDATE enroll_tokens SET used_count = used_count + 1 \
             WHERE id = ? AND (max_uses <= 0 OR used_count < max_uses)",
        )
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to consume token: {error}")))?;
        Ok(result.rows_affected() > 0)
    }
}

fn map_token_row(row: TokenRow) -> EnrollTokenRecord {
    let (id, token, remark, max_uses, used_count, expires_at_ms, enabled, created_at_ms) = row;
    EnrollTokenRecord {
        id,
        token,
        remark,
        max_uses,
        used_count,
        expires_at_ms,
        enabled: enabled == 1,
        created_at_ms,
    }
}
