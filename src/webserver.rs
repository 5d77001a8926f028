use crate::run::Engine;
use crate::snapshot_store::{CONTAINERS, IMAGE_UPDATES, IMAGES};
use crate::state::{ContainerRecord, ImageInventoryEntry, UpdateCandidate};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, http::StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub async fn readiness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// Serves a snapshot as a JSON array. Failures are logged, the client only sees a 500.
fn snapshot<T: Serialize + DeserializeOwned>(state: &AppState, name: &str) -> Response {
    match state.engine.store().read_all::<T>(name) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            error!("Failed to serve snapshot {}: {}", name, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}

pub async fn containers(State(state): State<AppState>) -> Response {
    snapshot::<ContainerRecord>(&state, CONTAINERS)
}

pub async fn image_updates(State(state): State<AppState>) -> Response {
    snapshot::<UpdateCandidate>(&state, IMAGE_UPDATES)
}

pub async fn images(State(state): State<AppState>) -> Response {
    snapshot::<ImageInventoryEntry>(&state, IMAGES)
}

pub async fn refresh(State(state): State<AppState>) -> impl IntoResponse {
    state.engine.trigger("manual refresh");
    (StatusCode::OK, "Reconciliation run triggered")
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/api/containers", get(containers))
        .route("/api/imageUpdates", get(image_updates))
        .route("/api/images", get(images))
        .route("/api/data/refresh", post(refresh))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::FakeCluster;
    use crate::notifier::testing::RecordingNotifier;
    use crate::state::fixtures::{candidate, workload};
    use crate::update_candidates::testing::StaticTags;
    use axum::body::Body;
    use axum::http::{Request, header};
    use std::path::Path;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn app(data_dir: &Path) -> (Router, Arc<Engine>) {
        let yaml = format!(
            "system:\n  dataDir: \"{}\"\nnotifications:\n  ntfy:\n    url: https://ntfy.invalid\n    topic: t\n    reminder: 1d\n",
            data_dir.display()
        );
        let engine = Arc::new(Engine::new(
            Arc::new(serde_yaml_ng::from_str(&yaml).unwrap()),
            Arc::new(FakeCluster::default()),
            Arc::new(StaticTags::default()),
            Arc::new(RecordingNotifier::default()),
            CancellationToken::new(),
        ));
        let router = create_app(AppState {
            engine: engine.clone(),
        });
        (router, engine)
    }

    async fn get_uri(app: &Router, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_empty_snapshots_are_empty_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path());
        for uri in ["/api/containers", "/api/imageUpdates", "/api/images"] {
            let resp = get_uri(&app, uri).await;
            assert_eq!(resp.status(), StatusCode::OK, "{uri}");
            assert_eq!(body(resp).await, "[]");
        }
    }

    #[tokio::test]
    async fn test_image_updates_serves_snapshot_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (app, engine) = app(dir.path());
        let row = candidate(workload("default", "api", "repo/app:1.0.0"), "1.1.0");
        engine.store().write_all(IMAGE_UPDATES, &[row]).unwrap();

        let resp = get_uri(&app, "/api/imageUpdates").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let rows: serde_json::Value = serde_json::from_str(&body(resp).await).unwrap();
        assert_eq!(rows[0]["newTag"], "1.1.0");
        assert_eq!(rows[0]["workload"]["namespace"], "default");
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_generic_500() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path());
        std::fs::write(dir.path().join("containers.json"), "{not json").unwrap();

        let resp = get_uri(&app, "/api/containers").await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(resp).await, "Internal server error");
    }

    #[tokio::test]
    async fn test_refresh_acknowledges_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/data/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body(resp).await, "Reconciliation run triggered");
    }

    #[tokio::test]
    async fn test_cors_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/containers")
                    .header(header::ORIGIN, "https://dashboard.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let allow_origin = resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap();
        assert_eq!(allow_origin.to_str().unwrap(), "*");
    }

    #[tokio::test]
    async fn test_health_probes() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path());
        assert_eq!(get_uri(&app, "/health/live").await.status(), StatusCode::NO_CONTENT);
        assert_eq!(get_uri(&app, "/health/ready").await.status(), StatusCode::NO_CONTENT);
    }
}
