use std::sync::Arc;

use async_trait::async_trait;
use s3::Bucket;
use tracing::instrument;

use crate::Error;

const KEY_PREFIX: &str = "converted";

/// What the object store reported for a stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub url: Option<String>,
}

/// Durably stores a converted file and hands back where it can be fetched.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, data: Vec<u8>, filename: &str, mime: &str)
        -> Result<UploadedFile, Error>;
}

#[derive(Clone)]
pub struct BucketUploader {
    bucket: Arc<Bucket>,
    public_url: Option<Arc<str>>,
}

impl BucketUploader {
    /// Every object written through this uploader is served as a download.
    pub fn new(mut bucket: Bucket, public_url: Option<String>) -> Self {
        bucket.add_header("Content-Disposition", "attachment");
        Self {
            bucket: Arc::new(bucket),
            public_url: public_url.map(|url| url.trim_end_matches('/').into()),
        }
    }

    pub fn url_for(&self, key: &str) -> String {
        match &self.public_url {
            Some(base) => object_url(base, key),
            None => object_url(&self.bucket.url(), key),
        }
    }

    pub fn host(&self) -> String {
        self.public_url
            .as_deref()
            .map_or_else(|| self.bucket.url(), str::to_owned)
    }
}

#[async_trait]
impl Uploader for BucketUploader {
    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn upload(
        &self,
        data: Vec<u8>,
        filename: &str,
        mime: &str,
    ) -> Result<UploadedFile, Error> {
        let key = object_key(filename);
        self.bucket
            .put_object_with_content_type(&key, &data, mime)
            .await
            .map_err(|source| {
                error!(?source, %key, "Bucket rejected upload");
                Error::Upload(format!("Upload failed: {source}"))
            })?;
        Ok(UploadedFile {
            url: Some(self.url_for(&key)),
        })
    }
}

fn object_key(filename: &str) -> String {
    format!("{KEY_PREFIX}/{filename}")
}

/// Joins a base URL and an object key, escaping each key segment so names
/// containing `#`, `?` or `%` still address the stored object.
fn object_url(base: &str, key: &str) -> String {
    let path = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/{path}", base.trim_end_matches('/'))
}
