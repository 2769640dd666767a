//! Version database repository.
//!
//! Status updates are conditional on the current status, so a transition
//! applied against a stale read affects no row and reports `false`.

use anyhow::{Context, Result, bail};
use sqlx::SqlitePool;

use super::models::{Version, VersionStatus};

const VERSION_COLUMNS: &str = "id, module_id, seq, code, commit_sha, status, spec_content, message, created_at, updated_at";

/// Repository for version persistence.
#[derive(Debug, Clone)]
pub struct VersionRepository {
    pool: SqlitePool,
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

impl VersionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a SPEC_GENERATING version with the module's next `vN` code.
    pub async fn create(&self, module_id: &str) -> Result<Version> {
        let mut tx = self.pool.begin().await.context("starting version insert")?;

        let seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM versions WHERE module_id = ?",
        )
        .bind(module_id)
        .fetch_one(&mut *tx)
        .await
        .context("computing next version sequence")?;

        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO versions (id, module_id, seq, code, status)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(module_id)
        .bind(seq)
        .bind(format!("v{seq}"))
        .bind(VersionStatus::SpecGenerating.as_str())
        .execute(&mut *tx)
        .await
        .context("creating version")?;

        tx.commit().await.context("committing version insert")?;

        self.get(&id)
            .await?
            .context("version missing right after insert")
    }

    pub async fn get(&self, id: &str) -> Result<Option<Version>> {
        let version = sqlx::query_as::<_, Version>(&format!(
            "SELECT {VERSION_COLUMNS} FROM versions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching version")?;

        Ok(version)
    }

    pub async fn list_for_module(&self, module_id: &str) -> Result<Vec<Version>> {
        let versions = sqlx::query_as::<_, Version>(&format!(
            "SELECT {VERSION_COLUMNS} FROM versions WHERE module_id = ? ORDER BY seq"
        ))
        .bind(module_id)
        .fetch_all(&self.pool)
        .await
        .context("listing versions for module")?;

        Ok(versions)
    }

    /// Latest version of the module whose status is one of `statuses`.
    pub async fn find_by_module_statuses(
        &self,
        module_id: &str,
        statuses: &[VersionStatus],
    ) -> Result<Option<Version>> {
        if statuses.is_empty() {
            return Ok(None);
        }
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM versions WHERE module_id = ? AND status IN ({}) ORDER BY seq DESC LIMIT 1",
            placeholders(statuses.len())
        );
        let mut query = sqlx::query_as::<_, Version>(&sql).bind(module_id);
        for status in statuses {
            query = query.bind(status.as_str());
        }

        query
            .fetch_optional(&self.pool)
            .await
            .context("finding version by status")
    }

    /// Count versions in any of `statuses`, optionally ignoring one version.
    pub async fn count_by_statuses(
        &self,
        statuses: &[VersionStatus],
        excluding: Option<&str>,
    ) -> Result<i64> {
        if statuses.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "SELECT COUNT(*) FROM versions WHERE status IN ({}) AND id != ?",
            placeholders(statuses.len())
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }

        query
            .bind(excluding.unwrap_or_default())
            .fetch_one(&self.pool)
            .await
            .context("counting versions by status")
    }

    /// Versions holding an admission slot.
    pub async fn count_active(&self, excluding: Option<&str>) -> Result<i64> {
        self.count_by_statuses(&VersionStatus::ACTIVE, excluding)
            .await
    }

    /// Move `id` from `from` to `to` along a forward edge. Returns false when
    /// the version was no longer in `from`.
    pub async fn transition(
        &self,
        id: &str,
        from: VersionStatus,
        to: VersionStatus,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            bail!("invalid version transition {from} -> {to}");
        }
        self.set_status_if(id, from, to, None).await
    }

    /// Take the compensating edge, recording why.
    pub async fn roll_back(
        &self,
        id: &str,
        from: VersionStatus,
        to: VersionStatus,
        message: &str,
    ) -> Result<bool> {
        if !from.can_roll_back_to(to) {
            bail!("invalid version rollback {from} -> {to}");
        }
        self.set_status_if(id, from, to, Some(message)).await
    }

    async fn set_status_if(
        &self,
        id: &str,
        from: VersionStatus,
        to: VersionStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE versions
            SET status = ?, message = COALESCE(?, message), updated_at = datetime('now')
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(message)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .context("updating version status")?;

        Ok(result.rows_affected() == 1)
    }

    /// Store a generated spec, moving SPEC_GENERATING to SPEC_GENERATED. A
    /// SPEC_GENERATED version has its spec replaced.
    pub async fn complete_spec(&self, id: &str, spec_content: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE versions
            SET status = ?, spec_content = ?, message = NULL, updated_at = datetime('now')
            WHERE id = ? AND status IN (?, ?)
            "#,
        )
        .bind(VersionStatus::SpecGenerated.as_str())
        .bind(spec_content)
        .bind(id)
        .bind(VersionStatus::SpecGenerating.as_str())
        .bind(VersionStatus::SpecGenerated.as_str())
        .execute(&self.pool)
        .await
        .context("storing generated spec")?;

        Ok(result.rows_affected() == 1)
    }

    /// CODE_BUILDING -> BUILD_COMPLETED with the commit sha.
    pub async fn complete_build(&self, id: &str, commit: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE versions
            SET status = ?, commit_sha = ?, message = NULL, updated_at = datetime('now')
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(VersionStatus::BuildCompleted.as_str())
        .bind(commit)
        .bind(id)
        .bind(VersionStatus::CodeBuilding.as_str())
        .execute(&self.pool)
        .await
        .context("storing build commit")?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn set_message(&self, id: &str, message: &str) -> Result<()> {
        sqlx::query("UPDATE versions SET message = ?, updated_at = datetime('now') WHERE id = ?")
            .bind(message)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting version message")?;

        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM versions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting version")?;

        Ok(())
    }

    /// Move every version of the module to DELETED. Returns rows changed.
    pub async fn mark_deleted_for_module(&self, module_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE versions SET status = ?, updated_at = datetime('now') WHERE module_id = ? AND status != ?",
        )
        .bind(VersionStatus::Deleted.as_str())
        .bind(module_id)
        .bind(VersionStatus::Deleted.as_str())
        .execute(&self.pool)
        .await
        .context("marking module versions deleted")?;

        Ok(result.rows_affected())
    }
}
