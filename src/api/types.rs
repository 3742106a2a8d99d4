use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    manager::types::{Manager, ManagerError},
    store::types::StoreError,
};

/// HTTP front of a [`Manager`].
pub struct TaskServer {
    pub manager: Manager,
    pub listen: String,
}

/// Body of `POST /settings` and `PUT /settings/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsRequest {
    #[serde(default)]
    pub owner_id: String,
    /// Either the configuration object itself or its JSON text.
    pub container_config: Value,
    pub ttl_interval: u64,
    pub replica: u32,
    pub max_sharing_users: u32,
    pub time_limit: u64,
}

impl SettingsRequest {
    pub fn raw_config(&self) -> String {
        match &self.container_config {
            Value::String(raw) => raw.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub settings_id: Uuid,
    pub user_id: String,
    pub username: String,
}

#[derive(Debug)]
pub struct ApiError(pub ManagerError);

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ManagerError::Store(StoreError::TaskNotFound(_))
            | ManagerError::Store(StoreError::SettingsNotFound(_)) => StatusCode::NOT_FOUND,
            ManagerError::Store(StoreError::Duplicate(_))
            | ManagerError::Store(StoreError::Conflict { .. }) => StatusCode::CONFLICT,
            ManagerError::Validation(_) => StatusCode::BAD_REQUEST,
            ManagerError::Store(StoreError::Backend(_)) | ManagerError::Cluster(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
