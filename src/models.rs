//! Domain types shared by persistence, the pipeline, and the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};

/// Resource/quota band applied at sandbox creation. Ordered SEED < LAUNCH < SCALE.
#[derive(sqlx::Type, Debug, Default, Display, Clone, Copy, EnumString, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[strum(ascii_case_insensitive, serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    #[default]
    Seed,
    Launch,
    Scale,
}

/// Project lifecycle states. See the adjacency table in guard::validate_transition.
#[derive(sqlx::Type, Debug, Default, Display, Clone, Copy, EnumString, Serialize, Deserialize, PartialEq, Eq)]
#[strum(ascii_case_insensitive, serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ProjectStatus {
    #[default]
    Created,
    Built,
    Waking,
    Running,
    Sleeping,
}

/// Deployment pipeline stages. Monotone except for the `failed` escape hatch.
#[derive(sqlx::Type, Debug, Default, Display, Clone, Copy, EnumString, Serialize, Deserialize, PartialEq, Eq)]
#[strum(ascii_case_insensitive, serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    #[default]
    Queued,
    Cloning,
    Building,
    Indexing,
    Deploying,
    Live,
    Failed,
}

/// Outcome of a guarded or pipeline-logged decision, recorded to the intent log.
#[derive(Debug, Clone, Copy, Display, Serialize, Deserialize, PartialEq, Eq)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum IntentResult {
    Success,
    Rejected,
    Failed,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow, Serialize)]
pub struct User {
    pub id: i64,
    pub external_id: String,
    pub email: String,
    pub username: String,
}

/// Wraps `Project.env_vars`, stored as a JSON object column.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvVars(pub HashMap<String, String>);

impl sqlx::Type<sqlx::Sqlite> for EnvVars {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <String as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for EnvVars {
    fn decode(
        value: sqlx::sqlite::SqliteValueRef<'r>,
    ) -> std::result::Result<Self, sqlx::error::BoxDynError> {
        let raw = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(EnvVars(serde_json::from_str(raw).unwrap_or_default()))
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for EnvVars {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> std::result::Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        let raw = serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string());
        <String as sqlx::Encode<sqlx::Sqlite>>::encode(raw, buf)
    }
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Project {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub git_url: Option<String>,
    pub project_type: Option<String>,
    pub port: Option<i64>,
    pub tier: Tier,
    pub env_vars: EnvVars,
    pub status: ProjectStatus,
    pub is_locked: bool,
    pub last_active_at: DateTime<Utc>,
    pub last_deployed: Option<DateTime<Utc>>,
    pub daily_runtime_minutes: i64,
    pub total_runtime_minutes: i64,
    pub last_reset_at: DateTime<Utc>,
}

/// Response DTO for `Project`. `latest_deployment_id` is computed at read
/// time from a join, never stored, to avoid cache invalidation (see design
/// note on the Project<->Deployment cyclic reference).
#[derive(Clone, Debug, Serialize)]
pub struct ProjectResponse {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub git_url: Option<String>,
    pub project_type: Option<String>,
    pub port: Option<i64>,
    pub tier: Tier,
    pub env_vars: HashMap<String, String>,
    pub status: ProjectStatus,
    pub last_active_at: DateTime<Utc>,
    pub last_deployed: Option<DateTime<Utc>>,
    pub daily_runtime_minutes: i64,
    pub total_runtime_minutes: i64,
    pub latest_deployment_id: Option<i64>,
}

impl Project {
    pub fn into_response(self, latest_deployment_id: Option<i64>) -> ProjectResponse {
        ProjectResponse {
            id: self.id,
            owner_id: self.owner_id,
            name: self.name,
            git_url: self.git_url,
            project_type: self.project_type,
            port: self.port,
            tier: self.tier,
            env_vars: self.env_vars.0,
            status: self.status,
            last_active_at: self.last_active_at,
            last_deployed: self.last_deployed,
            daily_runtime_minutes: self.daily_runtime_minutes,
            total_runtime_minutes: self.total_runtime_minutes,
            latest_deployment_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow, Serialize)]
pub struct Deployment {
    pub id: i64,
    pub project_id: i64,
    pub created_at: DateTime<Utc>,
    pub status: DeploymentStatus,
    pub image_tag: Option<String>,
    pub domain: Option<String>,
    pub sandbox_id: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct IntentLogEntry {
    pub ts: DateTime<Utc>,
    pub project_id: Option<i64>,
    pub user_id: Option<i64>,
    pub intent: String,
    pub result: IntentResult,
    pub reason: Option<String>,
    pub meta: Option<serde_json::Value>,
}

/// Request body for `POST /projects`.
#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub project_type: Option<String>,
    pub port: Option<i64>,
    pub git_url: Option<String>,
    pub tier: Tier,
    pub env_vars: Option<HashMap<String, String>>,
}

/// Body for `POST /deploy/{project_id}/git`.
#[derive(Debug, Deserialize)]
pub struct GitDeployRequest {
    pub repo_url: String,
}
