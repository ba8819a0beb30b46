use std::sync::Arc;

use axum::body::Bytes;
use serde::Serialize;
use tracing::instrument;

use crate::{
    codec::Codec,
    filename::generate_filename,
    format::TargetFormat,
    session::{Identity, SessionGate},
    storage::Uploader,
};

pub const MAX_FILE_SIZE_BYTES: usize = 10 * 1024 * 1024;

pub struct ConversionRequest {
    pub file_bytes: Bytes,
    pub original_filename: String,
    pub target_format: Option<String>,
}

/// Outcome of one conversion. Exactly one of `file_url` and `error` is set,
/// which the two constructors guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub original_filename: String,
}

impl ConversionResult {
    pub fn success(file_url: String, original_filename: String) -> Self {
        Self {
            success: true,
            file_url: Some(file_url),
            error: None,
            original_filename,
        }
    }

    pub fn failure(error: impl Into<String>, original_filename: String) -> Self {
        Self {
            success: false,
            file_url: None,
            error: Some(error.into()),
            original_filename,
        }
    }
}

/// The collaborators one conversion needs, shared across requests.
#[derive(Clone)]
pub struct Converter {
    pub sessions: Arc<dyn SessionGate>,
    pub codec: Arc<dyn Codec>,
    pub uploader: Arc<dyn Uploader>,
}

impl Converter {
    pub async fn run(&self, token: Option<&str>, request: ConversionRequest) -> ConversionResult {
        convert_with_session(
            self.sessions.as_ref(),
            self.codec.as_ref(),
            self.uploader.as_ref(),
            token,
            request,
        )
        .await
    }
}

/// Resolves the session first, then converts.
///
/// A broken session lookup is reported on its own so it can't be confused
/// with a user who simply isn't logged in.
pub async fn convert_with_session(
    sessions: &dyn SessionGate,
    codec: &dyn Codec,
    uploader: &dyn Uploader,
    token: Option<&str>,
    request: ConversionRequest,
) -> ConversionResult {
    match sessions.current_identity(token).await {
        Ok(identity) => convert(codec, uploader, request, identity.as_ref()).await,
        Err(source) => {
            error!(?source, "Session lookup failed");
            ConversionResult::failure("Session check failed.", request.original_filename)
        }
    }
}

#[instrument(
    skip_all,
    fields(
        filename = %request.original_filename,
        format = ?request.target_format,
        size = request.file_bytes.len(),
    )
)]
pub async fn convert(
    codec: &dyn Codec,
    uploader: &dyn Uploader,
    request: ConversionRequest,
    identity: Option<&Identity>,
) -> ConversionResult {
    let ConversionRequest {
        file_bytes,
        original_filename,
        target_format,
    } = request;

    let Some(identity) = identity else {
        return ConversionResult::failure("Authentication required.", original_filename);
    };
    if file_bytes.len() > MAX_FILE_SIZE_BYTES {
        return ConversionResult::failure(
            format!(
                "File size exceeds the limit of {}MB.",
                MAX_FILE_SIZE_BYTES / 1024 / 1024
            ),
            original_filename,
        );
    }
    if file_bytes.is_empty() {
        return ConversionResult::failure("No file provided.", original_filename);
    }
    let Some(raw_format) = target_format.filter(|f| !f.trim().is_empty()) else {
        return ConversionResult::failure("No target format specified.", original_filename);
    };
    let format: TargetFormat = match raw_format.parse() {
        Ok(format) => format,
        Err(source) => return ConversionResult::failure(source.to_string(), original_filename),
    };

    info!(user = %identity.user_id, %format, "Converting image");
    let converted = match codec.encode(file_bytes, format).await {
        Ok(converted) => converted,
        Err(source) => {
            warn!(?source, "Image conversion failed");
            return ConversionResult::failure(source.to_string(), original_filename);
        }
    };

    let filename = generate_filename(&original_filename, format);
    debug!(%filename, size = converted.len(), "Uploading converted image");
    match uploader.upload(converted, &filename, format.mime_type()).await {
        Ok(uploaded) => match uploaded.url {
            Some(url) => {
                info!(%url, "Converted and uploaded image");
                ConversionResult::success(url, original_filename)
            }
            None => {
                error!(%filename, "Uploader returned no URL");
                ConversionResult::failure(
                    "Upload succeeded but no URL was returned.",
                    original_filename,
                )
            }
        },
        Err(source) => {
            error!(?source, "Upload failed");
            ConversionResult::failure(source.to_string(), original_filename)
        }
    }
}
