use crate::config::StreamConfig;
use crate::error::{Result, SentinelError};
use crate::evidence;
use crate::preview::PreviewSlot;
use crate::status::StatusQuery;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

/// Shared state for the Axum server
#[derive(Clone)]
pub struct WebState {
    pub(crate) status: Arc<StatusQuery>,
    pub(crate) preview: Arc<PreviewSlot>,
    pub(crate) recording_dir: PathBuf,
}

/// Operator-facing HTTP surface: live status, the MJPEG preview feed and
/// the evidence segment listing. Nothing here mutates the appliance.
pub struct WebServer {
    config: StreamConfig,
    state: WebState,
}

impl WebServer {
    pub fn new(
        config: StreamConfig,
        status: Arc<StatusQuery>,
        preview: Arc<PreviewSlot>,
        recording_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            state: WebState {
                status,
                preview,
                recording_dir,
            },
        }
    }

    /// Serve until the token is cancelled, then drain gracefully.
    pub async fn start(self, cancel: CancellationToken) -> Result<()> {
        let app = build_router(self.state);
        let addr = format!("{}:{}", self.config.ip, self.config.port);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SentinelError::system(format!("Failed to bind {}: {}", addr, e)))?;

        info!("Web server listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| SentinelError::system(format!("Web server error: {}", e)))?;

        info!("Web server stopped");
        Ok(())
    }
}

fn build_router(state: WebState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status_handler))
        .route("/api/evidence", get(evidence_handler))
        .route("/video_feed", get(video_feed_handler))
        .with_state(state)
}

/// Handler for the live status snapshot
async fn status_handler(State(state): State<WebState>) -> impl IntoResponse {
    Json(state.status.report())
}

/// Handler for the evidence segment listing
async fn evidence_handler(State(state): State<WebState>) -> impl IntoResponse {
    Json(evidence::list_segments(&state.recording_dir))
}

/// Handler for the MJPEG preview endpoint
async fn video_feed_handler(State(state): State<WebState>) -> impl IntoResponse {
    info!("New preview stream client connected");

    let stream = async_stream::stream! {
        let mut frame_interval = interval(Duration::from_millis(100));
        frame_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_sequence: Option<u64> = None;

        loop {
            frame_interval.tick().await;

            let Some(frame) = state.preview.latest() else {
                trace!("No preview frame available yet");
                continue;
            };
            // Repeat frames are skipped; the slot only ever holds the newest.
            if last_sequence == Some(frame.sequence) {
                continue;
            }
            last_sequence = Some(frame.sequence);

            let boundary = format!(
                "--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                frame.data.len()
            );
            yield Ok::<_, axum::Error>(Bytes::from(boundary));
            yield Ok(Bytes::from(frame.data));
            yield Ok(Bytes::from("\r\n"));
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=FRAME",
        )
        .header(header::CACHE_CONTROL, "no-cache, private")
        .header(header::PRAGMA, "no-cache")
        .body(axum::body::Body::from_stream(stream))
        .unwrap()
}

/// Simple HTML page showing the preview feed
async fn index_handler() -> impl IntoResponse {
    Html(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>MapleCam Sentinel</title>
    <style>
        :root { color-scheme: dark; }
        body {
            margin: 0;
            background: #000;
            display: flex;
            align-items: center;
            justify-content: center;
            min-height: 100vh;
        }
        img.stream {
            display: block;
            max-width: 100vw;
            max-height: 100vh;
            object-fit: contain;
        }
    </style>
</head>
<body>
    <img class="stream" src="/video_feed" alt="Live preview">
</body>
</html>
"#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScheduleConfig, ZoneConfig};
    use crate::geofence::GeofenceEvaluator;
    use crate::pipeline::{CapturePipeline, PipelineConfig};
    use crate::telemetry::TelemetryStore;

    fn test_state(recording_dir: PathBuf) -> (WebState, CapturePipeline) {
        let store = Arc::new(TelemetryStore::new());
        let evaluator = Arc::new(
            GeofenceEvaluator::from_config(
                &[ZoneConfig::default()],
                &ScheduleConfig::default(),
            )
            .unwrap(),
        );
        let pipeline = CapturePipeline::build(
            PipelineConfig {
                width: 1920,
                height: 1080,
                framerate: 30,
                bitrate: 4_000_000,
                recording_dir: recording_dir.clone(),
                chunk_seconds: 60,
            },
            Arc::new(PreviewSlot::new()),
        )
        .unwrap();
        let status = Arc::new(StatusQuery::new(
            store,
            evaluator,
            pipeline.state_handle(),
        ));
        (
            WebState {
                status,
                preview: Arc::new(PreviewSlot::new()),
                recording_dir,
            },
            pipeline,
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_status_endpoint_returns_full_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _pipeline) = test_state(dir.path().to_path_buf());

        let response = status_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert!(json.get("telemetry").is_some());
        assert!(json.get("zone").is_some());
        assert_eq!(json["pipeline"], "Building");
    }

    #[tokio::test]
    async fn test_evidence_endpoint_lists_segments() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("evidence_00000.mp4"), b"x").unwrap();
        let (state, _pipeline) = test_state(dir.path().to_path_buf());

        let response = evidence_handler(State(state)).await.into_response();
        let json = body_json(response).await;
        assert_eq!(json, serde_json::json!(["evidence_00000.mp4"]));
    }

    #[tokio::test]
    async fn test_server_shuts_down_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _pipeline) = test_state(dir.path().to_path_buf());
        let server = WebServer {
            config: StreamConfig {
                ip: "127.0.0.1".to_string(),
                port: 0,
            },
            state,
        };

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.start(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
