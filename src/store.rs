//! C2 — Persistence Abstraction.
//!
//! A transactional store over Users, Projects, Deployments and the Intent
//! Log. Row-level locking on `Project` is approximated the way sqlite makes
//! possible: every mutating operation opens an immediate-mode transaction,
//! which the sqlite driver serializes against all other writers, and the
//! `is_locked` column additionally rejects overlapping application-level
//! attempts (I2). Bootstrap is migration-based, following the auth
//! component's `Sqlite::new` rather than inline `CREATE TABLE` statements,
//! since the schema here is expected to evolve.

use chrono::Utc;
use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool, Transaction,
};
use std::str::FromStr;

use crate::models::{
    CreateProjectRequest, Deployment, DeploymentStatus, EnvVars, IntentLogEntry, Project,
    ProjectStatus, User,
};
use crate::{Error, ErrorKind, Result};

static MIGRATIONS: Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| Error::from_source(ErrorKind::Integration, e, "bad database path"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(|e| Error::from_source(ErrorKind::Integration, e, "failed to open database"))?;

        MIGRATIONS
            .run(&pool)
            .await
            .map_err(|e| Error::from_source(ErrorKind::Integration, e, "failed to run migrations"))?;

        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(|e| Error::from_source(ErrorKind::Integration, e, "failed to open database"))?;
        MIGRATIONS
            .run(&pool)
            .await
            .map_err(|e| Error::from_source(ErrorKind::Integration, e, "failed to run migrations"))?;
        Ok(Self { pool })
    }

    // -- users --------------------------------------------------------

    /// Upserts a user by `external_id`, the identity verifier's subject claim.
    pub async fn upsert_user(&self, external_id: &str, email: &str, username: &str) -> Result<User> {
        if let Some(user) = self.get_user_by_external_id(external_id).await? {
            return Ok(user);
        }
        let id = sqlx::query("INSERT INTO users (external_id, email, username) VALUES (?1, ?2, ?3)")
            .bind(external_id)
            .bind(email)
            .bind(username)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        Ok(User {
            id,
            external_id: external_id.to_string(),
            email: email.to_string(),
            username: username.to_string(),
        })
    }

    pub async fn get_user_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, external_id, email, username FROM users WHERE external_id = ?1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    // -- projects -------------------------------------------------------

    pub async fn create_project(&self, owner_id: i64, req: &CreateProjectRequest) -> Result<Project> {
        let env_vars = EnvVars(req.env_vars.clone().unwrap_or_default());
        let now = Utc::now();
        let id = sqlx::query(
            r#"INSERT INTO projects
               (owner_id, name, git_url, project_type, port, tier, env_vars, status,
                is_locked, last_active_at, daily_runtime_minutes, total_runtime_minutes, last_reset_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'CREATED', 0, ?8, 0, 0, ?8)"#,
        )
        .bind(owner_id)
        .bind(&req.name)
        .bind(&req.git_url)
        .bind(&req.project_type)
        .bind(req.port)
        .bind(req.tier)
        .bind(&env_vars)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_project(id)
            .await?
            .ok_or_else(|| Error::new(ErrorKind::Integration, "project vanished after insert"))
    }

    pub async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(project)
    }

    pub async fn list_projects(&self, owner_id: i64) -> Result<Vec<Project>> {
        let projects = sqlx::query_as::<_, Project>(
            "SELECT * FROM projects WHERE owner_id = ?1 ORDER BY id",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(projects)
    }

    pub async fn list_all_projects(&self) -> Result<Vec<Project>> {
        let projects = sqlx::query_as::<_, Project>("SELECT * FROM projects ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(projects)
    }

    pub async fn latest_deployment_id(&self, project_id: i64) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM deployments WHERE project_id = ?1 ORDER BY id DESC LIMIT 1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    pub async fn latest_deployment(&self, project_id: i64) -> Result<Option<Deployment>> {
        let deployment = sqlx::query_as::<_, Deployment>(
            "SELECT * FROM deployments WHERE project_id = ?1 ORDER BY id DESC LIMIT 1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(deployment)
    }

    pub async fn count_running_for_owner(&self, owner_id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM projects WHERE owner_id = ?1 AND status = 'RUNNING'",
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn count_running_global(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM projects WHERE status = 'RUNNING'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn count_projects(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM projects")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn count_building(&self) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM deployments WHERE status = 'building'")
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    /// Begins an immediate-mode transaction, used by the project lifecycle
    /// transaction template to acquire exclusive access to a `Project` row.
    pub async fn begin(&self) -> Result<Transaction<'_, sqlx::Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn fetch_project_locked(
        &self,
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        id: i64,
    ) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(project)
    }

    pub async fn set_locked(
        &self,
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        id: i64,
        locked: bool,
    ) -> Result<()> {
        sqlx::query("UPDATE projects SET is_locked = ?1 WHERE id = ?2")
            .bind(locked)
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn set_project_status_tx(
        &self,
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        id: i64,
        status: ProjectStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE projects SET status = ?1 WHERE id = ?2")
            .bind(status)
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn touch_last_active(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE projects SET last_active_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drift-correcting write used by the reconciler; bypasses the normal
    /// transition check by design (reconciliation is authoritative).
    pub async fn set_project_status(&self, id: i64, status: ProjectStatus) -> Result<()> {
        sqlx::query("UPDATE projects SET status = ?1 WHERE id = ?2")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_runtime_minutes(&self, id: i64, minutes: i64) -> Result<()> {
        sqlx::query(
            "UPDATE projects SET daily_runtime_minutes = daily_runtime_minutes + ?1, \
             total_runtime_minutes = total_runtime_minutes + ?1 WHERE id = ?2",
        )
        .bind(minutes)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset_daily_runtime(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE projects SET daily_runtime_minutes = 0, last_reset_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_last_deployed(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE projects SET last_deployed = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- deployments ------------------------------------------------------

    pub async fn create_deployment(&self, project_id: i64) -> Result<Deployment> {
        let id = sqlx::query("INSERT INTO deployments (project_id, status) VALUES (?1, 'queued')")
            .bind(project_id)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        self.get_deployment(id)
            .await?
            .ok_or_else(|| Error::new(ErrorKind::Integration, "deployment vanished after insert"))
    }

    pub async fn get_deployment(&self, id: i64) -> Result<Option<Deployment>> {
        let deployment = sqlx::query_as::<_, Deployment>("SELECT * FROM deployments WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(deployment)
    }

    pub async fn list_live_deployments(&self) -> Result<Vec<Deployment>> {
        let deployments =
            sqlx::query_as::<_, Deployment>("SELECT * FROM deployments WHERE status = 'live'")
                .fetch_all(&self.pool)
                .await?;
        Ok(deployments)
    }

    pub async fn set_deployment_status(&self, id: i64, status: DeploymentStatus) -> Result<()> {
        sqlx::query("UPDATE deployments SET status = ?1 WHERE id = ?2")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_deployment_failed(&self, id: i64, error_message: &str) -> Result<()> {
        sqlx::query("UPDATE deployments SET status = 'failed', error_message = ?1 WHERE id = ?2")
            .bind(error_message)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_deployment_live(
        &self,
        id: i64,
        sandbox_id: &str,
        domain: &str,
        image_tag: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE deployments SET status = 'live', sandbox_id = ?1, domain = ?2, image_tag = ?3 WHERE id = ?4",
        )
        .bind(sandbox_id)
        .bind(domain)
        .bind(image_tag)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- intent log -------------------------------------------------------

    pub async fn record_intent(&self, entry: &IntentLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO intent_log (ts, project_id, user_id, intent, result, reason, meta) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(entry.ts)
        .bind(entry.project_id)
        .bind(entry.user_id)
        .bind(&entry.intent)
        .bind(entry.result.to_string())
        .bind(&entry.reason)
        .bind(entry.meta.as_ref().map(|v| v.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_deployments(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM deployments")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn count_intent_log(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM intent_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tier;

    async fn store_with_user() -> (Store, User) {
        let store = Store::new_in_memory().await.unwrap();
        let user = store.upsert_user("ext-1", "a@b.com", "alice").await.unwrap();
        (store, user)
    }

    #[tokio::test]
    async fn create_and_fetch_project() {
        let (store, user) = store_with_user().await;
        let project = store
            .create_project(
                user.id,
                &CreateProjectRequest {
                    name: "demo".into(),
                    project_type: None,
                    port: None,
                    git_url: None,
                    tier: Tier::Seed,
                    env_vars: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(project.status, ProjectStatus::Created);
        let fetched = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "demo");
    }

    #[tokio::test]
    async fn upsert_user_is_idempotent() {
        let store = Store::new_in_memory().await.unwrap();
        let a = store.upsert_user("ext-1", "a@b.com", "alice").await.unwrap();
        let b = store.upsert_user("ext-1", "other@b.com", "other").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.email, "a@b.com");
    }

    #[tokio::test]
    async fn running_counts_reflect_status() {
        let (store, user) = store_with_user().await;
        let project = store
            .create_project(
                user.id,
                &CreateProjectRequest {
                    name: "demo".into(),
                    project_type: None,
                    port: None,
                    git_url: None,
                    tier: Tier::Seed,
                    env_vars: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(store.count_running_for_owner(user.id).await.unwrap(), 0);
        store
            .set_project_status(project.id, ProjectStatus::Running)
            .await
            .unwrap();
        assert_eq!(store.count_running_for_owner(user.id).await.unwrap(), 1);
    }
}
