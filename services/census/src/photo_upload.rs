use crate::config::{S3Config, UploadConfig};
use crate::s3_gateway::{PhotoGateway, PutResponse, StoredObject};
use crate::transcoder::{TranscodeError, TranscodeOutcome, Transcoder};
use bytes::Bytes;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Errors surfaced by the photo upload pipeline
#[derive(Debug, Error)]
pub enum PhotoError {
    /// Rejected before any storage call
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error("Photo upload failed")]
    Upload(#[source] anyhow::Error),
}

/// A file received from a multipart form
#[derive(Debug, Clone)]
pub struct IncomingFile {
    /// Name the client gave the file
    pub file_name: String,
    /// Declared MIME type
    pub content_type: String,
    pub data: Bytes,
}

/// A photo written to object storage, ready to be recorded on its owner
#[derive(Debug, Clone)]
pub struct UploadedPhoto {
    pub filename: String,
    pub object: StoredObject,
    pub public_url: String,
    pub provider_response: PutResponse,
    pub transcode: TranscodeOutcome,
    pub deleted_previous: bool,
}

/// Validates, re-encodes and stores focal point photos
pub struct PhotoUploader {
    gateway: PhotoGateway,
    transcoder: Transcoder,
    upload_path: String,
    max_file_size_bytes: usize,
    max_file_size_mb: f64,
}

impl PhotoUploader {
    pub fn new(
        gateway: PhotoGateway,
        transcoder: Transcoder,
        s3: &S3Config,
        upload: &UploadConfig,
    ) -> Self {
        Self {
            gateway,
            transcoder,
            upload_path: s3.upload_path.trim_matches('/').to_string(),
            max_file_size_bytes: upload.max_file_size_bytes,
            max_file_size_mb: upload.max_file_size_mb(),
        }
    }

    pub fn max_file_size_bytes(&self) -> usize {
        self.max_file_size_bytes
    }

    /// Message shown when a file is over the size limit
    pub fn too_large_message(&self) -> String {
        format!(
            "Please upload an image less than {}MB",
            self.max_file_size_mb
        )
    }

    /// Check presence, type and size of the inbound file
    pub fn validate<'a>(&self, file: Option<&'a IncomingFile>) -> Result<&'a IncomingFile, PhotoError> {
        let file = file.ok_or_else(|| PhotoError::Validation("Please upload a file".to_string()))?;

        if !file.content_type.to_ascii_lowercase().starts_with("image/") {
            return Err(PhotoError::Validation(
                "Please upload an image file".to_string(),
            ));
        }

        if file.data.len() > self.max_file_size_bytes {
            return Err(PhotoError::Validation(self.too_large_message()));
        }

        Ok(file)
    }

    /// Object key for `filename` under the upload prefix
    pub fn key_for(&self, filename: &str) -> String {
        if self.upload_path.is_empty() {
            filename.to_string()
        } else {
            format!("{}/{}", self.upload_path, filename)
        }
    }

    /// Validate, re-encode, retire the superseded object and store the new one
    #[instrument(skip(self, file, current))]
    pub async fn upload(
        &self,
        owner_id: Uuid,
        file: Option<IncomingFile>,
        current: Option<&StoredObject>,
    ) -> Result<UploadedPhoto, PhotoError> {
        let file = self.validate(file.as_ref())?;

        let filename = photo_file_name(owner_id, file);
        let key = self.key_for(&filename);

        let transcoded = self
            .transcoder
            .transcode_blocking(file.data.clone(), file.content_type.clone())
            .await?;
        match transcoded.outcome {
            TranscodeOutcome::Reencoded { quality, .. } => {
                info!(quality, "Photo quality reduced before upload");
                metrics::counter!("census.photos.transcoded").increment(1);
            }
            TranscodeOutcome::Downscaled { width, height } => {
                info!(width, height, "Photo scaled down before upload");
                metrics::counter!("census.photos.transcoded").increment(1);
            }
            TranscodeOutcome::Unchanged => {}
        }

        let deleted_previous = self
            .gateway
            .delete_if_superseded(current, &key)
            .await
            .map_err(|e| self.upload_failed(e))?;

        let put = self
            .gateway
            .put(&key, transcoded.bytes, &transcoded.content_type)
            .await
            .map_err(|e| self.upload_failed(e))?;

        metrics::counter!("census.photos.uploaded").increment(1);

        Ok(UploadedPhoto {
            filename,
            public_url: put.object.public_url(),
            object: put.object,
            provider_response: put.provider_response,
            transcode: transcoded.outcome,
            deleted_previous,
        })
    }

    fn upload_failed(&self, e: anyhow::Error) -> PhotoError {
        error!(bucket = %self.gateway.bucket(), error = ?e, "Photo upload failed");
        metrics::counter!("census.photos.upload_failures").increment(1);
        PhotoError::Upload(e)
    }
}

/// Deterministic per-owner file name, so re-uploads land in the same slot
pub fn photo_file_name(owner_id: Uuid, file: &IncomingFile) -> String {
    let extension = Path::new(&file.file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(sanitize_path_component)
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| extension_for_content_type(&file.content_type));

    format!("photo_{owner_id}.{extension}")
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect()
}

/// File extension for an image MIME type
fn extension_for_content_type(content_type: &str) -> String {
    match content_type.to_lowercase().as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => "jpg".to_string(),
        "image/png" => "png".to_string(),
        "image/webp" => "webp".to_string(),
        "image/bmp" => "bmp".to_string(),
        "image/gif" => "gif".to_string(),
        other => other
            .strip_prefix("image/")
            .map(sanitize_path_component)
            .filter(|ext| !ext.is_empty())
            .unwrap_or_else(|| "bin".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::s3_gateway::{MemoryObjectStore, MockObjectStore, ObjectOp};
    use image::codecs::jpeg::JpegEncoder;
    use image::{DynamicImage, RgbImage};
    use std::collections::HashMap;
    use std::sync::Arc;

    const BUCKET: &str = "dev-census-surveyor-0";

    fn s3_config() -> S3Config {
        S3Config {
            bucket: BUCKET.to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
            upload_path: "/focal-point-photos/".to_string(),
            multipart_threshold_bytes: 5 * 1024 * 1024,
            part_size_bytes: 5 * 1024 * 1024,
            environment_buckets: HashMap::from([(Environment::Development, BUCKET.to_string())]),
        }
    }

    fn uploader(store: Arc<MemoryObjectStore>) -> PhotoUploader {
        let s3 = s3_config();
        PhotoUploader::new(
            PhotoGateway::new(store, &s3, Environment::Development),
            Transcoder::default(),
            &s3,
            &UploadConfig::default(),
        )
    }

    fn file(name: &str, content_type: &str, data: &'static [u8]) -> IncomingFile {
        IncomingFile {
            file_name: name.to_string(),
            content_type: content_type.to_string(),
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_photo_file_name() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();

        assert_eq!(
            photo_file_name(id, &file("Me.JPG", "image/jpeg", b"")),
            "photo_550e8400-e29b-41d4-a716-446655440000.jpg"
        );
        assert_eq!(
            photo_file_name(id, &file("no-extension", "image/png", b"")),
            "photo_550e8400-e29b-41d4-a716-446655440000.png"
        );
        assert_eq!(
            photo_file_name(id, &file("odd.p/g", "image/x-icon", b"")),
            "photo_550e8400-e29b-41d4-a716-446655440000.x-icon"
        );
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("jpg"), "jpg");
        assert_eq!(sanitize_path_component("../x"), "___x");
        assert_eq!(sanitize_path_component("PnG"), "png");
    }

    #[test]
    fn test_extension_for_content_type() {
        assert_eq!(extension_for_content_type("image/jpeg"), "jpg");
        assert_eq!(extension_for_content_type("IMAGE/PNG"), "png");
        assert_eq!(extension_for_content_type("image/"), "bin");
    }

    #[tokio::test]
    async fn test_rejects_missing_file() {
        let store = Arc::new(MemoryObjectStore::new());
        let err = uploader(store.clone())
            .upload(Uuid::new_v4(), None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, PhotoError::Validation(ref m) if m == "Please upload a file"));
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_non_image_before_storage() {
        let store = Arc::new(MemoryObjectStore::new());
        let err = uploader(store.clone())
            .upload(Uuid::new_v4(), Some(file("notes.txt", "text/plain", b"hello")), None)
            .await
            .unwrap_err();

        assert!(matches!(err, PhotoError::Validation(ref m) if m == "Please upload an image file"));
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_oversized_file_with_mb_message() {
        let store = Arc::new(MemoryObjectStore::new());
        let big = IncomingFile {
            file_name: "big.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
            data: Bytes::from(vec![0u8; 5_000_001]),
        };

        let err = uploader(store.clone())
            .upload(Uuid::new_v4(), Some(big), None)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Please upload an image less than 5MB");
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_repeat_upload_reuses_key_and_deletes_previous() {
        let store = Arc::new(MemoryObjectStore::new());
        let uploader = uploader(store.clone());
        let owner = Uuid::new_v4();

        let first = uploader
            .upload(owner, Some(file("a.gif", "image/gif", b"GIF89a-first")), None)
            .await
            .unwrap();
        assert!(!first.deleted_previous);
        assert_eq!(first.object.key, format!("focal-point-photos/photo_{owner}.gif"));
        assert_eq!(
            first.public_url,
            format!("https://{BUCKET}.s3.us-east-1.amazonaws.com/focal-point-photos/photo_{owner}.gif")
        );

        let second = uploader
            .upload(
                owner,
                Some(file("b.gif", "image/gif", b"GIF89a-second")),
                Some(&first.object),
            )
            .await
            .unwrap();
        assert!(second.deleted_previous);
        assert_eq!(second.object, first.object);

        let key = first.object.key.clone();
        assert_eq!(
            store.ops(),
            vec![
                ObjectOp::Put { bucket: BUCKET.to_string(), key: key.clone() },
                ObjectOp::Delete { bucket: BUCKET.to_string(), key: key.clone() },
                ObjectOp::Put { bucket: BUCKET.to_string(), key: key.clone() },
            ]
        );
        assert_eq!(
            store.object(BUCKET, &key).unwrap(),
            Bytes::from_static(b"GIF89a-second")
        );
    }

    #[tokio::test]
    async fn test_gif_reaches_store_unchanged() {
        let store = Arc::new(MemoryObjectStore::new());
        let mut raw = b"GIF89a".to_vec();
        raw.resize(3_200_000, 1);
        let gif = IncomingFile {
            file_name: "anim.gif".to_string(),
            content_type: "image/gif".to_string(),
            data: Bytes::from(raw.clone()),
        };

        let uploaded = uploader(store.clone())
            .upload(Uuid::new_v4(), Some(gif), None)
            .await
            .unwrap();

        assert_eq!(uploaded.transcode, TranscodeOutcome::Unchanged);
        assert_eq!(
            store.object(BUCKET, &uploaded.object.key).unwrap(),
            Bytes::from(raw)
        );
    }

    #[tokio::test]
    async fn test_storage_failure_is_upload_error() {
        let store = Arc::new(MemoryObjectStore::new());
        store.fail_puts(true);

        let err = uploader(store)
            .upload(Uuid::new_v4(), Some(file("a.png", "image/png", b"png")), None)
            .await
            .unwrap_err();

        assert!(matches!(err, PhotoError::Upload(_)));
    }

    #[tokio::test]
    async fn test_stored_content_type_follows_image_bytes() {
        let mut jpeg = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(16, 16))
            .write_with_encoder(JpegEncoder::new(&mut jpeg))
            .unwrap();

        let mut store = MockObjectStore::new();
        store
            .expect_put_object()
            .withf(|bucket, key, _, content_type| {
                bucket == BUCKET
                    && key.starts_with("focal-point-photos/photo_")
                    && key.ends_with(".png")
                    && content_type == "image/jpeg"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(PutResponse::default()));

        let s3 = s3_config();
        let uploader = PhotoUploader::new(
            PhotoGateway::new(Arc::new(store), &s3, Environment::Development),
            Transcoder::default(),
            &s3,
            &UploadConfig::default(),
        );
        let photo = IncomingFile {
            file_name: "me.png".to_string(),
            content_type: "image/png".to_string(),
            data: Bytes::from(jpeg),
        };

        uploader.upload(Uuid::new_v4(), Some(photo), None).await.unwrap();
    }
}
