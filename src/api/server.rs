use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State as AxumState},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use super::types::{ApiError, SettingsRequest, TaskRequest, TaskServer};
use crate::{
    manager::types::Manager,
    tasks::types::{Task, TaskSettings},
};

type Shared = AxumState<Arc<TaskServer>>;

impl TaskServer {
    pub fn new(manager: Manager, listen: &str) -> Self {
        Self {
            manager,
            listen: listen.to_string(),
        }
    }

    async fn health() -> impl IntoResponse {
        Json(json!({ "status": "ok" }))
    }

    async fn list_settings(AxumState(server): Shared) -> Result<Json<Vec<TaskSettings>>, ApiError> {
        Ok(Json(server.manager.list_settings()?))
    }

    async fn get_settings(
        AxumState(server): Shared,
        Path(id): Path<Uuid>,
    ) -> Result<Json<TaskSettings>, ApiError> {
        Ok(Json(server.manager.get_settings(&id)?))
    }

    async fn create_settings(
        AxumState(server): Shared,
        Json(request): Json<SettingsRequest>,
    ) -> Result<impl IntoResponse, ApiError> {
        let settings = TaskSettings::new(
            &request.owner_id,
            &request.raw_config(),
            request.ttl_interval,
            request.replica,
            request.max_sharing_users,
            request.time_limit,
        );
        let settings = server.manager.create_settings(settings)?;
        Ok((StatusCode::CREATED, Json(settings)))
    }

    async fn update_settings(
        AxumState(server): Shared,
        Path(id): Path<Uuid>,
        Json(request): Json<SettingsRequest>,
    ) -> Result<Json<TaskSettings>, ApiError> {
        let settings = TaskSettings {
            id,
            owner_id: request.owner_id.clone(),
            container_config: request.raw_config(),
            ttl_interval: request.ttl_interval,
            replica: request.replica,
            max_sharing_users: request.max_sharing_users,
            time_limit: request.time_limit,
        };
        Ok(Json(server.manager.update_settings(settings)?))
    }

    async fn delete_settings(
        AxumState(server): Shared,
        Path(id): Path<Uuid>,
    ) -> Result<StatusCode, ApiError> {
        server.manager.delete_settings(&id).await?;
        Ok(StatusCode::NO_CONTENT)
    }

    async fn list_tasks(AxumState(server): Shared) -> Result<Json<Vec<Task>>, ApiError> {
        Ok(Json(server.manager.list_tasks()?))
    }

    async fn get_task(
        AxumState(server): Shared,
        Path(id): Path<Uuid>,
    ) -> Result<Json<Task>, ApiError> {
        Ok(Json(server.manager.get_task(&id)?))
    }

    async fn submit_task(
        AxumState(server): Shared,
        Json(request): Json<TaskRequest>,
    ) -> Result<impl IntoResponse, ApiError> {
        let task =
            server
                .manager
                .submit_task(&request.settings_id, &request.user_id, &request.username)?;
        Ok((StatusCode::CREATED, Json(task)))
    }

    async fn delete_task(
        AxumState(server): Shared,
        Path(id): Path<Uuid>,
    ) -> Result<impl IntoResponse, ApiError> {
        let task = server.manager.request_deletion(&id)?;
        Ok((StatusCode::ACCEPTED, Json(task)))
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/health", get(TaskServer::health))
            .route(
                "/settings",
                get(TaskServer::list_settings).post(TaskServer::create_settings),
            )
            .route(
                "/settings/{id}",
                get(TaskServer::get_settings)
                    .put(TaskServer::update_settings)
                    .delete(TaskServer::delete_settings),
            )
            .route(
                "/tasks",
                get(TaskServer::list_tasks).post(TaskServer::submit_task),
            )
            .route(
                "/tasks/{id}",
                get(TaskServer::get_task).delete(TaskServer::delete_task),
            )
            .with_state(Arc::new(self))
    }

    /// Serves until `shutdown` is cancelled.
    pub async fn start_server(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let listen = self.listen.clone();
        let listener = TcpListener::bind(&listen).await?;
        info!("Task server listening on {}", listen);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}
