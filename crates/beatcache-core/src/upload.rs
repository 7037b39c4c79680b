//! Profile-image upload to an unsigned image endpoint.
//!
//! The endpoint takes a multipart form with the file and an upload preset
//! and answers with the hosted image's `secure_url`, which then goes into
//! the profile's `profile_image`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ActionError;
use crate::utils::truncate_string;

/// Largest image accepted for upload.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// Uploads can be slow on poor connections.
const UPLOAD_TIMEOUT_SECS: u64 = 60;

const MAX_UPLOAD_RETRIES: u32 = 2;

const UPLOAD_RETRY_DELAY_MS: u64 = 1000;

/// Error bodies are cut to this many characters in messages.
const MAX_ERROR_BODY_LEN: usize = 200;

const IMAGE_TYPES: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
];

#[derive(Debug, Deserialize)]
struct UploadResponse {
    secure_url: String,
}

/// MIME type for an image file name, judged by extension.
pub fn image_mime(file_name: &str) -> Result<&'static str, ActionError> {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| ActionError::validation("Image file has no extension"))?;
    IMAGE_TYPES
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, mime)| *mime)
        .ok_or_else(|| ActionError::validation("Please choose a JPEG, PNG, GIF or WebP image"))
}

pub fn check_image_size(len: usize) -> Result<(), ActionError> {
    if len == 0 {
        return Err(ActionError::validation("Image file is empty"));
    }
    if len > MAX_IMAGE_BYTES {
        return Err(ActionError::validation(format!(
            "Image must be at most {} MB",
            MAX_IMAGE_BYTES / (1024 * 1024)
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ImageUploader {
    client: Client,
    endpoint: Url,
    preset: String,
}

impl ImageUploader {
    pub fn new(endpoint: &str, preset: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;
        let endpoint = Url::parse(endpoint).context("Invalid upload URL")?;
        Ok(Self {
            client,
            endpoint,
            preset: preset.into(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let endpoint = config
            .upload_url
            .as_deref()
            .context("No upload URL configured (set BEATCACHE_UPLOAD_URL)")?;
        let preset = config
            .upload_preset
            .as_deref()
            .context("No upload preset configured (set BEATCACHE_UPLOAD_PRESET)")?;
        Self::new(endpoint, preset)
    }

    /// Read and upload an image from disk, returning its hosted URL.
    pub async fn upload_file(&self, path: &Path) -> Result<String, ActionError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ActionError::validation("Invalid image path"))?;
        image_mime(file_name)?;
        let metadata = std::fs::metadata(path)
            .map_err(|e| ActionError::validation(format!("Cannot read {}: {}", path.display(), e)))?;
        check_image_size(usize::try_from(metadata.len()).unwrap_or(usize::MAX))?;
        let bytes = std::fs::read(path)
            .map_err(|e| ActionError::validation(format!("Cannot read {}: {}", path.display(), e)))?;
        self.upload(file_name, bytes).await
    }

    /// Upload image bytes, returning the hosted URL.
    pub async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, ActionError> {
        let mime = image_mime(file_name)?;
        check_image_size(bytes.len())?;
        debug!(file_name, size = bytes.len(), "Uploading image");

        let mut attempt = 0;
        loop {
            let part = Part::bytes(bytes.clone())
                .file_name(file_name.to_string())
                .mime_str(mime)
                .map_err(|e| ActionError::Upload(e.to_string()))?;
            let form = Form::new()
                .part("file", part)
                .text("upload_preset", self.preset.clone());

            match self.client.post(self.endpoint.clone()).multipart(form).send().await {
                Ok(response) => return Self::parse(response).await,
                Err(e) if attempt < MAX_UPLOAD_RETRIES && (e.is_connect() || e.is_timeout()) => {
                    attempt += 1;
                    warn!(attempt, error = %e, "Image upload failed, retrying");
                    tokio::time::sleep(Duration::from_millis(UPLOAD_RETRY_DELAY_MS)).await;
                }
                Err(e) => return Err(ActionError::Upload(e.to_string())),
            }
        }
    }

    async fn parse(response: Response) -> Result<String, ActionError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ActionError::Upload(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate_string(&body, MAX_ERROR_BODY_LEN)
            )));
        }
        let parsed: UploadResponse = response
            .json()
            .await
            .map_err(|e| ActionError::Upload(format!("Unexpected upload response: {}", e)))?;
        info!(url = %parsed.secure_url, "Image uploaded");
        Ok(parsed.secure_url)
    }
}
