use askama_axum::Template;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, FromRef, Query, State},
    routing::post,
    Json, Router,
};
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};
use tower_sombrero::csp::CspNonce;

use crate::{
    convert::{ConversionRequest, ConversionResult, Converter, MAX_FILE_SIZE_BYTES},
    format::TargetFormat,
    session::{Identity, SessionGate, COOKIE_NAME},
    AppState, Error,
};

#[derive(Template)]
#[template(path = "index.hbs", ext = "html", escape = "html")]
pub struct Index {
    identity: Option<Identity>,
    formats: [TargetFormat; 4],
    max_bytes: usize,
    nonce: String,
}

pub async fn index(
    State(state): State<AppState>,
    CspNonce(nonce): CspNonce,
    jar: CookieJar,
) -> Result<Index, Error> {
    let token = jar.get(COOKIE_NAME).map(|c| c.value());
    let identity = state.sessions.current_identity(token).await?;
    Ok(Index {
        identity,
        formats: TargetFormat::ALL,
        max_bytes: MAX_FILE_SIZE_BYTES,
        nonce,
    })
}

#[derive(Serialize)]
pub struct FormatInfo {
    id: TargetFormat,
    mime: &'static str,
}

pub async fn formats() -> Json<Vec<FormatInfo>> {
    Json(
        TargetFormat::ALL
            .into_iter()
            .map(|id| FormatInfo {
                id,
                mime: id.mime_type(),
            })
            .collect(),
    )
}

#[derive(Deserialize)]
pub struct ConvertQuery {
    filename: Option<String>,
    format: Option<String>,
}

/// Transport-level cap on request bodies. Larger than the conversion limit so
/// oversized files get a proper result instead of a bare 413.
pub const BODY_LIMIT: usize = 16 * 1024 * 1024;

pub fn convert_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    Converter: FromRef<S>,
{
    Router::new().route(
        "/convert",
        post(convert).layer(DefaultBodyLimit::max(BODY_LIMIT)),
    )
}

pub async fn convert(
    State(converter): State<Converter>,
    jar: CookieJar,
    Query(query): Query<ConvertQuery>,
    body: Bytes,
) -> Json<ConversionResult> {
    let request = ConversionRequest {
        file_bytes: body,
        original_filename: query.filename.unwrap_or_default(),
        target_format: query.format,
    };
    let token = jar.get(COOKIE_NAME).map(|c| c.value());
    Json(converter.run(token, request).await)
}

pub async fn not_found() -> Error {
    Error::NotFound
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::Ordering, Arc, Mutex};

    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        codec::tests::sample_png,
        convert::tests::{user, CountingCodec, MockUploader, Reply, URL},
    };

    const TOKEN: &str = "abc123";

    #[derive(Default)]
    struct RecordingSessions {
        tokens: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl SessionGate for RecordingSessions {
        async fn current_identity(&self, token: Option<&str>) -> Result<Option<Identity>, Error> {
            self.tokens.lock().unwrap().push(token.map(str::to_owned));
            Ok((token == Some(TOKEN)).then(user))
        }
    }

    struct Harness {
        sessions: Arc<RecordingSessions>,
        codec: Arc<CountingCodec>,
        uploader: Arc<MockUploader>,
        app: Router,
    }

    fn harness() -> Harness {
        let sessions = Arc::new(RecordingSessions::default());
        let codec = Arc::new(CountingCodec::default());
        let uploader = Arc::new(MockUploader::new(Reply::Url));
        let converter = Converter {
            sessions: sessions.clone(),
            codec: codec.clone(),
            uploader: uploader.clone(),
        };
        Harness {
            sessions,
            codec,
            uploader,
            app: convert_router().with_state(converter),
        }
    }

    fn post_convert(body: Vec<u8>, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::post("/convert?filename=photo.png&format=WEBP");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn session_cookie_reaches_gate_and_result_is_camel_case() {
        let h = harness();
        let response = h
            .app
            .oneshot(post_convert(sample_png(), Some(&format!("token={TOKEN}"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "success": true, "fileUrl": URL, "originalFilename": "photo.png" })
        );
        assert_eq!(
            *h.sessions.tokens.lock().unwrap(),
            vec![Some(TOKEN.to_owned())]
        );
        assert_eq!(h.uploader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn anonymous_request_still_answers_ok() {
        let h = harness();
        let response = h.app.oneshot(post_convert(sample_png(), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({
                "success": false,
                "error": "Authentication required.",
                "originalFilename": "photo.png",
            })
        );
        assert_eq!(*h.sessions.tokens.lock().unwrap(), vec![None]);
        assert_eq!(h.codec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn body_over_conversion_limit_gets_structured_result() {
        let h = harness();
        let body = vec![0; 12 * 1024 * 1024];
        let response = h
            .app
            .oneshot(post_convert(body, Some(&format!("token={TOKEN}"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let result = json_body(response).await;
        assert_eq!(result["success"], json!(false));
        assert_eq!(result["error"], json!("File size exceeds the limit of 10MB."));
        assert_eq!(h.codec.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.uploader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn body_over_transport_limit_is_rejected() {
        let h = harness();
        let body = vec![0; BODY_LIMIT + 1];
        let response = h
            .app
            .oneshot(post_convert(body, Some(&format!("token={TOKEN}"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(h.sessions.tokens.lock().unwrap().is_empty());
    }

    #[test]
    fn upload_page_rows_offer_every_format_and_removal() {
        let page = Index {
            identity: Some(user()),
            formats: TargetFormat::ALL,
            max_bytes: MAX_FILE_SIZE_BYTES,
            nonce: "n0nce".to_owned(),
        }
        .render()
        .unwrap();
        for id in ["JPG", "PNG", "GIF", "WEBP"] {
            assert!(page.contains(&format!("<option value=\"{id}\">")), "{id}");
        }
        assert!(page.contains("class=\"remove\""));
        assert!(page.contains("data-max-bytes=\"10485760\""));
        assert!(page.contains("<script nonce=\"n0nce\""));
    }

    #[test]
    fn anonymous_upload_page_links_to_login() {
        let page = Index {
            identity: None,
            formats: TargetFormat::ALL,
            max_bytes: MAX_FILE_SIZE_BYTES,
            nonce: "n0nce".to_owned(),
        }
        .render()
        .unwrap();
        assert!(page.contains("href=\"/oauth2\""));
        assert!(!page.contains("class=\"remove\""));
    }
}
