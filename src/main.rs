#![warn(clippy::all, clippy::nursery, clippy::pedantic)]
use std::sync::Arc;

use askama_axum::Template;
use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, RequestExt, Router,
};
use oauth2::{
    basic::BasicErrorResponseType, HttpClientError, RequestTokenError, StandardErrorResponse,
};
use rand::{distributions::Alphanumeric, Rng};
use tokio::net::TcpListener;
use tower_http::{compression::CompressionLayer, services::ServeDir};
use tower_sombrero::{
    csp::CspNonce,
    headers::{ContentSecurityPolicy, CspSource},
    Sombrero,
};
use tracing_subscriber::EnvFilter;

pub use crate::state::AppState;

mod auth;
mod codec;
mod convert;
mod filename;
mod format;
mod handler;
mod session;
mod state;
mod storage;

#[macro_use]
extern crate tracing;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
    let state = AppState::new().await;

    let app = router(state);

    let bind_address = AppState::bind_address();
    info!(%bind_address, "Binding to address");
    let tcp = TcpListener::bind(bind_address).await.unwrap();
    info!(%bind_address, "Server listening on socket");
    axum::serve(tcp, app)
        .with_graceful_shutdown(vss::shutdown_signal())
        .await
        .unwrap();
}

pub fn router(state: AppState) -> Router {
    let serve_dir = ServeDir::new(AppState::asset_dir())
        .append_index_html_on_directories(false)
        .precompressed_br()
        .precompressed_deflate()
        .precompressed_gzip()
        .precompressed_zstd();

    let csp = ContentSecurityPolicy::strict_default()
        .script_src([CspSource::Nonce, CspSource::StrictDynamic])
        .style_src(CspSource::Nonce)
        .connect_src(CspSource::SelfOrigin)
        .base_uri(CspSource::None)
        .img_src([CspSource::Host(state.uploader.host()), CspSource::SelfOrigin]);
    let sombrero = Sombrero::default().content_security_policy(csp);

    Router::new()
        .route("/", get(handler::index))
        .route("/formats", get(handler::formats))
        .merge(handler::convert_router::<AppState>())
        .route("/oauth2", get(auth::redirect))
        .route("/oauth2/callback", get(auth::authenticate))
        .route("/logout", post(auth::logout))
        .nest_service("/assets", serve_dir)
        .fallback(handler::not_found)
        .layer(CompressionLayer::new())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            error_middleware,
        ))
        .layer(sombrero)
        .with_state(state)
}

fn check_truthy(data: &str) -> bool {
    let d = data.to_ascii_lowercase();
    !(d == "f" || d == "false" || d == "0" || d == "n" || d == "no")
}

type RequestTokenFailure = RequestTokenError<
    HttpClientError<reqwest::Error>,
    StandardErrorResponse<BasicErrorResponseType>,
>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Redis error")]
    Redis(#[from] redis::RedisError),
    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
    #[error("JSON error")]
    Json(#[from] serde_json::Error),
    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("OAuth2 token exchange failed")]
    OAuth2RequestToken(#[from] RequestTokenFailure),
    #[error("Join error")]
    Join(#[from] tokio::task::JoinError),
    #[error("WebP reported an unusual error: {0}")]
    WebPStr(String),
    #[error("{0}")]
    Upload(String),
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("Identity provider did not return a user id")]
    MissingUserId,
    #[error("Invalid OAuth2 State")]
    InvalidState,
    #[error("404 Page Not Found")]
    NotFound,
}

#[derive(Template)]
#[template(path = "error.hbs", ext = "html", escape = "html")]
struct ErrorTemplate {
    root_url: Arc<str>,
    error: Arc<Error>,
    nonce: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(source = ?self, "Error handling request");
        } else {
            debug!(source = ?self, "Failed to handle request");
        }

        (status, Extension(Arc::new(self)), Body::empty()).into_response()
    }
}

impl Error {
    const fn status(&self) -> StatusCode {
        match self {
            Self::Redis(_)
            | Self::Http(_)
            | Self::Json(_)
            | Self::Join(_)
            | Self::WebPStr(_)
            | Self::Upload(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::OAuth2RequestToken(_) | Self::MissingUserId => StatusCode::BAD_GATEWAY,
            Self::InvalidState | Self::Image(_) | Self::UnsupportedFormat(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

async fn error_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let nonce = match req.extract_parts::<CspNonce>().await {
        Ok(CspNonce(n)) => n,
        Err(err) => return err.into_response(),
    };
    let resp = next.run(req).await;
    if let Some(error) = resp.extensions().get::<Arc<Error>>().cloned() {
        let status = error.status();
        let error = ErrorTemplate {
            root_url: state.root_url,
            error,
            nonce,
        };
        (status, error).into_response()
    } else {
        resp
    }
}

pub fn randstring(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        for value in ["1", "true", "yes", "on", "Y"] {
            assert!(check_truthy(value), "{value}");
        }
        for value in ["0", "false", "FALSE", "no", "n", "f"] {
            assert!(!check_truthy(value), "{value}");
        }
    }

    #[test]
    fn error_statuses() {
        assert_eq!(Error::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::InvalidState.status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::MissingUserId.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            Error::UnsupportedFormat("BMP".to_owned()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Upload("down".to_owned()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn error_response_carries_error_for_template() {
        let response = Error::NotFound.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.extensions().get::<Arc<Error>>().is_some());
    }

    #[test]
    fn randstring_is_alphanumeric() {
        let token = randstring(64);
        assert_eq!(token.len(), 64);
        assert!(token.bytes().all(|b| b.is_ascii_alphanumeric()));
    }
}
