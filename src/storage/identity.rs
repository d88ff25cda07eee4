use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::Result;

/// Repository for (tool, external id) -> identity mappings.
pub struct IdentityRepository {
    pool: SqlitePool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityMapping {
    pub tool: String,
    pub external_id: String,
    pub identity: String,
}

impl IdentityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn resolve(&self, tool: &str, external_id: &str) -> Result<Option<String>> {
        let identity: Option<String> = sqlx::query_scalar(
            "SELECT identity FROM identity_mappings WHERE tool = ? AND external_id = ?",
        )
        .bind(tool)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(identity)
    }

    /// Upsert one mapping. A rewrite of an existing pair replaces the
    /// identity (manual fix-up path).
    pub async fn set_mapping(&self, tool: &str, external_id: &str, identity: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO identity_mappings (tool, external_id, identity)
            VALUES (?, ?, ?)
            ON CONFLICT (tool, external_id) DO UPDATE SET identity = excluded.identity
            "#,
        )
        .bind(tool)
        .bind(external_id)
        .bind(identity)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_mappings(&self, mappings: &[IdentityMapping]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for mapping in mappings {
            sqlx::query(
                r#"
                INSERT INTO identity_mappings (tool, external_id, identity)
                VALUES (?, ?, ?)
                ON CONFLICT (tool, external_id) DO UPDATE SET identity = excluded.identity
                "#,
            )
            .bind(&mapping.tool)
            .bind(&mapping.external_id)
            .bind(&mapping.identity)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!("Stored {} identity mappings", mappings.len());
        Ok(())
    }

    /// External ids that appear in stored usage but have no mapping yet.
    /// Drives the choice between full and incremental resync.
    pub async fn unmapped_ids(&self, tool: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT u.provider_record_id AS external_id
            FROM usage_records u
            LEFT JOIN identity_mappings m
              ON m.tool = u.tool AND m.external_id = u.provider_record_id
            WHERE u.tool = ?
              AND u.provider_record_id IS NOT NULL
              AND m.identity IS NULL
            ORDER BY external_id
            "#,
        )
        .bind(tool)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get("external_id")).collect())
    }

    pub async fn delete_mapping(&self, tool: &str, external_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM identity_mappings WHERE tool = ? AND external_id = ?")
                .bind(tool)
                .bind(external_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}
