//! Module persistence: the owner of a workspace, its sandbox and versions.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Module {
    pub id: String,
    pub name: String,
    /// Sandbox container currently serving the module.
    pub container_id: Option<String>,
    pub preview_url: Option<String>,
    pub deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

const MODULE_COLUMNS: &str =
    "id, name, container_id, preview_url, deleted, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct ModuleRepository {
    pool: SqlitePool,
}

impl ModuleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, name: &str) -> Result<Module> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO modules (id, name) VALUES (?, ?)")
            .bind(&id)
            .bind(name)
            .execute(&self.pool)
            .await
            .context("creating module")?;

        self.get(&id)
            .await?
            .context("module missing right after insert")
    }

    /// Fetch a module, deleted or not.
    pub async fn get(&self, id: &str) -> Result<Option<Module>> {
        let module = sqlx::query_as::<_, Module>(&format!(
            "SELECT {MODULE_COLUMNS} FROM modules WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching module")?;

        Ok(module)
    }

    /// Modules not marked deleted, oldest first.
    pub async fn list(&self) -> Result<Vec<Module>> {
        let modules = sqlx::query_as::<_, Module>(&format!(
            "SELECT {MODULE_COLUMNS} FROM modules WHERE deleted = 0 ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing modules")?;

        Ok(modules)
    }

    /// Record (or clear, with `None`) the module's sandbox.
    pub async fn set_container(
        &self,
        id: &str,
        container_id: Option<&str>,
        preview_url: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE modules SET container_id = ?, preview_url = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(container_id)
        .bind(preview_url)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("setting module container")?;

        Ok(())
    }

    pub async fn mark_deleted(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE modules SET deleted = 1, container_id = NULL, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking module deleted")?;

        Ok(())
    }
}
