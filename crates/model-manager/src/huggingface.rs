//! Hugging Face hub client
//!
//! Pulls a model snapshot file by file over the public HTTP API and pushes a
//! trained checkpoint by creating the repository and uploading every file.
//! Downloads are streamed to disk; nothing is held fully in memory.

use std::path::{Component, Path};
use std::time::Duration;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Body, Client, StatusCode};
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::utils::{format_bytes, format_duration, measure_execution_time_async};
use config::HubSettings;
use storage_adapter::tree;

use crate::hub::ModelHub;

/// Model metadata returned by the hub API
#[derive(Debug, Deserialize)]
struct ModelInfo {
    /// Files in the repository at the requested revision
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: String,
}

/// HTTP client for the Hugging Face hub
pub struct HuggingFaceHub {
    /// HTTP client
    client: Client,

    /// Hub endpoint without trailing slash
    endpoint: String,

    /// Revision pulled for base models
    revision: String,

    /// Bearer token
    token: Option<String>,

    /// Create pushed repositories as private
    private: bool,
}

impl HuggingFaceHub {
    /// Creates a hub client from settings
    pub fn new(settings: &HubSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("lora-flow/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(settings.timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("failed to build hub client: {}", e)))?;

        let token = settings
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(Self::resolve_token);

        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            revision: settings.revision.clone(),
            token,
            private: settings.private,
        })
    }

    /// Resolves an access token from the environment
    ///
    /// Looks at `HF_TOKEN` first, then `~/.huggingface/token`.
    pub fn resolve_token() -> Option<String> {
        if let Ok(token) = std::env::var("HF_TOKEN") {
            if !token.trim().is_empty() {
                return Some(token.trim().to_string());
            }
        }

        let token_path = dirs::home_dir()?.join(".huggingface").join("token");
        std::fs::read_to_string(token_path)
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    }

    /// Whether a token is available
    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// URL of the model info endpoint
    pub fn info_url(&self, model_id: &str) -> String {
        format!("{}/api/models/{}/revision/{}", self.endpoint, model_id, self.revision)
    }

    /// URL a repository file is downloaded from
    pub fn file_url(&self, model_id: &str, file: &str) -> String {
        format!("{}/{}/resolve/{}/{}", self.endpoint, model_id, self.revision, file)
    }

    /// URL a repository file is uploaded to
    pub fn upload_url(&self, repo_id: &str, path_in_repo: &str) -> String {
        format!("{}/api/models/{}/upload/main/{}", self.endpoint, repo_id, path_in_repo)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Lists the files of a model at the configured revision
    pub async fn list_files(&self, model_id: &str) -> Result<Vec<String>> {
        let url = self.info_url(model_id);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| hub_error(&format!("model info request for {}", model_id), e))?;

        let response = check_status(response, &format!("model info for {}", model_id)).await?;
        let info: ModelInfo = response
            .json()
            .await
            .map_err(|e| hub_error(&format!("decoding model info for {}", model_id), e))?;

        let files: Vec<String> = info.siblings.into_iter().map(|s| s.rfilename).collect();
        for file in &files {
            validate_repo_path(file)?;
        }

        if files.is_empty() {
            return Err(Error::ExternalService(format!(
                "model '{}' has no files at revision {}",
                model_id, self.revision
            )));
        }

        Ok(files)
    }

    /// Streams one repository file into `destination`
    async fn download_file(&self, model_id: &str, file: &str, destination: &Path) -> Result<u64> {
        let target = destination.join(file);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = target.with_extension(match target.extension() {
            Some(ext) => format!("{}.part", ext.to_string_lossy()),
            None => "part".to_string(),
        });

        let url = self.file_url(model_id, file);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| hub_error(&format!("download of {}", url), e))?;
        let response = check_status(response, &format!("download of {}", url)).await?;

        let mut writer = File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| hub_error(&format!("download of {}", url), e))?;
            writer.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }

        writer.flush().await?;
        writer.sync_all().await?;
        drop(writer);

        tokio::fs::rename(&partial, &target).await?;

        debug!("Downloaded {}/{} ({})", model_id, file, format_bytes(downloaded));

        Ok(downloaded)
    }

    /// Creates a model repository; an existing repository is fine
    pub async fn create_repo(&self, repo_id: &str) -> Result<()> {
        let (organization, name) = match repo_id.split_once('/') {
            Some((org, name)) => (Some(org), name),
            None => (None, repo_id),
        };

        let mut body = serde_json::json!({
            "name": name,
            "type": "model",
            "private": self.private,
        });
        if let Some(org) = organization {
            body["organization"] = serde_json::Value::String(org.to_string());
        }

        let url = format!("{}/api/repos/create", self.endpoint);
        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| hub_error(&format!("create repo {}", repo_id), e))?;

        if response.status() == StatusCode::CONFLICT {
            debug!("Repository {} already exists", repo_id);
            return Ok(());
        }

        check_status(response, &format!("create repo {}", repo_id)).await?;
        info!("Created repository {}", repo_id);
        Ok(())
    }

    /// Uploads one local file to a repository
    async fn upload_file(&self, repo_id: &str, local_path: &Path, path_in_repo: &str) -> Result<()> {
        let file = File::open(local_path).await?;
        let size = file.metadata().await?.len();
        let body = Body::wrap_stream(ReaderStream::new(file));

        let url = self.upload_url(repo_id, path_in_repo);
        let response = self
            .authorize(self.client.put(&url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await
            .map_err(|e| hub_error(&format!("upload of {}", path_in_repo), e))?;

        check_status(response, &format!("upload of {}", path_in_repo)).await?;
        debug!("Uploaded {} to {} ({})", path_in_repo, repo_id, format_bytes(size));
        Ok(())
    }
}

#[async_trait]
impl ModelHub for HuggingFaceHub {
    async fn pull(&self, model_id: &str, destination: &Path) -> Result<()> {
        info!("Pulling {} from {} (revision {})", model_id, self.endpoint, self.revision);

        let (result, elapsed) = measure_execution_time_async(async {
            let files = self.list_files(model_id).await?;
            let mut total = 0u64;
            for file in &files {
                total += self.download_file(model_id, file, destination).await?;
            }
            Ok::<_, Error>((files.len(), total))
        })
        .await;

        let (count, total) = result?;
        info!(
            "Pulled {}: {} files, {} in {}",
            model_id,
            count,
            format_bytes(total),
            format_duration(elapsed)
        );
        Ok(())
    }

    async fn push(&self, model_id: &str, source: &Path) -> Result<()> {
        if self.token.is_none() {
            return Err(Error::ExternalService(format!(
                "cannot push {}: no hub token (set hub.token or HF_TOKEN)",
                model_id
            )));
        }

        let root = source.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || tree::list_files(&root))
            .await
            .map_err(|e| Error::ExternalService(format!("listing push source failed: {}", e)))??;

        if entries.is_empty() {
            warn!("Push source {:?} is empty", source);
            return Err(Error::InvalidArgument(format!(
                "nothing to push from {}",
                source.display()
            )));
        }

        self.create_repo(model_id).await?;

        for entry in &entries {
            self.upload_file(model_id, &entry.absolute, &entry.relative).await?;
        }

        info!("Pushed {} files to {}", entries.len(), model_id);
        Ok(())
    }
}

/// Rejects repository paths that would escape the destination directory
fn validate_repo_path(path: &str) -> Result<()> {
    let escapes = Path::new(path)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));

    if path.is_empty() || escapes {
        return Err(Error::ExternalService(format!(
            "hub returned unsafe file name '{}'",
            path
        )));
    }
    Ok(())
}

fn hub_error(action: &str, error: reqwest::Error) -> Error {
    Error::ExternalService(format!("{} failed: {}", action, error))
}

async fn check_status(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::ExternalService(format!("{} failed: HTTP {}: {}", action, status, body)))
}
