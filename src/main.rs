pub mod config;
pub mod error;
pub mod helpers;
pub mod transcode;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{rejection::QueryRejection, Query},
    http::header::{CONTENT_LENGTH, CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Router,
};
use config::Config;
use error::{AppError, ConvertError};
use tracing::{debug, info};
use tracing_subscriber::FmtSubscriber;
use transcode::{ConvertQuery, Encoded, Encoder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    info!(
        "serving {} with {} on {}",
        config.input_dir.display(),
        config.ffmpeg_path.display(),
        config.bind_addr
    );
    debug!("{:?}", config);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    axum::serve(listener, app(config))
        .with_graceful_shutdown(helpers::do_shutdown())
        .await?;

    Ok(())
}

fn app(config: Arc<Config>) -> Router {
    let encoder = Encoder::new(config.ffmpeg_path.clone())
        .with_global_args(config.ffmpeg_global_args.iter().cloned());

    Router::new()
        .route("/convert", get(convert))
        .fallback(helpers::handler_404)
        .layer(Extension(Arc::new(encoder)))
        .layer(Extension(config))
}

/// `GET /convert?format=&quality=&delivery=&input=`
///
/// Buffered responses carry a `Content-Length`. Streamed responses are
/// chunked. A streamed conversion that fails before its first chunk gets the
/// same JSON 500 as a buffered one; a failure after that can only abort the
/// body, since the status line has already gone out as 200.
#[axum_macros::debug_handler]
async fn convert(
    Extension(config): Extension<Arc<Config>>,
    Extension(encoder): Extension<Arc<Encoder>>,
    query: Result<Query<ConvertQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query.map_err(|rejection| ConvertError::InvalidParameter {
        field: "query",
        reason: rejection.body_text(),
    })?;
    let (request, delivery) = query.resolve(&config)?;
    debug!(
        "converting {} to {} ({}, {})",
        request.input_path.display(),
        request.format,
        request.quality,
        delivery
    );
    let content_type = request.format.content_type();

    let response = match transcode::convert(&encoder, &request, delivery, &config.scratch_dir).await? {
        Encoded::Buffered(bytes) => (
            [
                (CONTENT_TYPE, content_type),
                (CONTENT_LENGTH, bytes.len().to_string()),
            ],
            bytes,
        )
            .into_response(),
        Encoded::Streamed(chunks) => {
            ([(CONTENT_TYPE, content_type)], Body::from_stream(chunks)).into_response()
        }
    };

    Ok(response)
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::transcode::ParamPolicy;

    // stands in for ffmpeg: echoes its args into the output, stdout for pipe:1
    const FAKE_FFMPEG: &str = r#"
        for last; do :; done
        if [ "$last" = "pipe:1" ]; then
            printf '%s\n' "$@"
        else
            printf '%s\n' "$@" > "$last"
        fi
    "#;

    fn setup(script: &str) -> (TempDir, Config) {
        let dir = TempDir::new().unwrap();
        let videos = dir.path().join("videos");
        let scratch = dir.path().join("scratch");
        std::fs::create_dir(&videos).unwrap();
        std::fs::create_dir(&scratch).unwrap();
        std::fs::write(videos.join("sample.mp4"), b"source").unwrap();

        let config = Config {
            input_dir: videos,
            scratch_dir: scratch,
            ffmpeg_path: "/bin/sh".into(),
            ffmpeg_global_args: vec!["-c".into(), script.into(), "fake-ffmpeg".into()],
            ..Config::default()
        };
        (dir, config)
    }

    async fn get(config: Config, uri: &str) -> Response {
        app(Arc::new(config))
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn lines(bytes: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(bytes).lines().map(String::from).collect()
    }

    fn scratch_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn buffered_mp4_low() {
        let (_dir, config) = setup(FAKE_FFMPEG);
        let scratch = config.scratch_dir.clone();
        let response = get(config, "/convert?format=mp4&quality=low").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "video/mp4");
        let length: usize = response.headers()[CONTENT_LENGTH]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(!body.is_empty());
        assert_eq!(body.len(), length);
        let args = lines(&body);
        assert!(args.windows(4).any(|w| w == ["-c:v", "libx264", "-c:a", "aac"]));
        assert!(args.windows(4).any(|w| w == ["-crf", "28", "-preset", "fast"]));
        assert!(args.windows(2).any(|w| w == ["-movflags", "+faststart"]));
        assert!(scratch_is_empty(&scratch));
    }

    #[tokio::test]
    async fn streamed_webm_high() {
        let (_dir, config) = setup(FAKE_FFMPEG);
        let response = get(config, "/convert?format=webm&quality=high&delivery=streamed").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "video/webm");
        assert!(response.headers().get(CONTENT_LENGTH).is_none());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let args = lines(&body);
        assert!(args.windows(4).any(|w| w == ["-c:v", "libvpx-vp9", "-c:a", "libopus"]));
        assert!(args.windows(4).any(|w| w == ["-crf", "18", "-b:v", "0"]));
        assert!(args.windows(2).any(|w| w == ["-cpu-used", "1"]));
        assert!(!args.iter().any(|a| a == "-preset"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[tokio::test]
    async fn defaults_are_mp4_medium() {
        let (_dir, config) = setup(FAKE_FFMPEG);
        let response = get(config, "/convert").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "video/mp4");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let args = lines(&body);
        assert!(args.windows(4).any(|w| w == ["-crf", "23", "-preset", "medium"]));
    }

    #[tokio::test]
    async fn absent_input_is_404() {
        let (dir, config) = setup(FAKE_FFMPEG);
        std::fs::remove_file(dir.path().join("videos/sample.mp4")).unwrap();
        let response = get(config, "/convert?format=mp4").await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "error": "Input file not found" })
        );
    }

    #[tokio::test]
    async fn missing_encoder_is_500() {
        let (_dir, mut config) = setup(FAKE_FFMPEG);
        config.ffmpeg_path = "/nonexistent/ffmpeg".into();
        config.ffmpeg_global_args.clear();
        let response = get(config, "/convert").await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Video conversion failed");
        assert!(body["details"]
            .as_str()
            .unwrap()
            .contains("FFmpeg binary not found"));
    }

    #[tokio::test]
    async fn encoder_failure_is_500_with_stderr() {
        let (_dir, config) = setup("echo 'Invalid data found' >&2; exit 1");
        let scratch = config.scratch_dir.clone();
        let response = get(config, "/convert").await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        let details = body["details"].as_str().unwrap();
        assert!(details.contains("code 1"), "{details}");
        assert!(details.contains("Invalid data found"), "{details}");
        assert!(scratch_is_empty(&scratch));
    }

    #[tokio::test]
    async fn streamed_failure_aborts_the_body() {
        let (_dir, config) = setup("printf 'some bytes'; exit 1");
        let response = get(config, "/convert?delivery=streamed").await;

        // headers are out before the encoder fails
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.into_body().collect().await.is_err());
    }

    #[tokio::test]
    async fn streamed_failure_before_output_is_500() {
        let (_dir, config) = setup("echo 'Invalid data found' >&2; exit 1");
        let response = get(config, "/convert?delivery=streamed").await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Video conversion failed");
        let details = body["details"].as_str().unwrap();
        assert!(details.contains("code 1"), "{details}");
        assert!(details.contains("Invalid data found"), "{details}");
    }

    #[tokio::test]
    async fn streamed_empty_output_is_an_empty_200() {
        let (_dir, config) = setup("exit 0");
        let response = get(config, "/convert?delivery=streamed").await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn malformed_query_is_json_400() {
        let (_dir, config) = setup(FAKE_FFMPEG);
        let response = get(config, "/convert?format=mp4&format=webm").await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Invalid parameter");
        assert!(body["details"].as_str().unwrap().starts_with("query:"));
    }

    #[tokio::test]
    async fn unknown_values_are_rejected_by_default() {
        let (_dir, config) = setup(FAKE_FFMPEG);
        let response = get(config, "/convert?format=avi").await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Invalid parameter");
        assert!(body["details"].as_str().unwrap().starts_with("format:"));
    }

    #[tokio::test]
    async fn fallback_policy_uses_defaults() {
        let (_dir, mut config) = setup(FAKE_FFMPEG);
        config.param_policy = ParamPolicy::Fallback;
        let response = get(config, "/convert?format=avi&quality=ultra").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "video/mp4");
    }

    #[tokio::test]
    async fn empty_input_name_is_400() {
        let (_dir, config) = setup(FAKE_FFMPEG);
        let response = get(config, "/convert?input=").await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "error": "Input file parameter required" })
        );
    }

    #[tokio::test]
    async fn other_paths_are_404() {
        let (_dir, config) = setup(FAKE_FFMPEG);
        let response = get(config, "/transcode").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
