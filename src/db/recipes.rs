//! Persisted recipe bundles.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{JobId, Mode, RecipeBundle};
use crate::recipe::RecipeStore;

#[async_trait]
impl RecipeStore for super::Db {
    async fn get(&self, job_id: JobId, mode: Mode) -> Result<Option<RecipeBundle>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT bundle FROM recipe_bundles WHERE job_id = $1 AND mode = $2")
                .bind(job_id.0)
                .bind(mode.to_string())
                .fetch_optional(self.pool())
                .await?;
        row.map(|(bundle,)| serde_json::from_value(bundle))
            .transpose()
            .map_err(Into::into)
    }

    async fn put(&self, job_id: JobId, bundle: &RecipeBundle) -> Result<()> {
        sqlx::query(
            "INSERT INTO recipe_bundles (job_id, mode, context_hash, schema_version, bundle, updated_at)
             VALUES ($1, $2, $3, $4, $5, now())
             ON CONFLICT (job_id, mode) DO UPDATE
                SET context_hash = EXCLUDED.context_hash,
                    schema_version = EXCLUDED.schema_version,
                    bundle = EXCLUDED.bundle,
                    updated_at = now()",
        )
        .bind(job_id.0)
        .bind(bundle.mode.to_string())
        .bind(&bundle.context_hash)
        .bind(bundle.schema_version as i32)
        .bind(serde_json::to_value(bundle)?)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
