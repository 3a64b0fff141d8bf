use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::ContentScan;
use crate::config::ScannerConfig;
use crate::mime::{Attachment, EmbeddedFile};

const DEFAULT_UPLOAD_NAME: &str = "uploaded_file";

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("send request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{stage} returned non-200 status: {status}")]
    Status { stage: &'static str, status: u16 },

    #[error("no analysis ID in response")]
    MissingAnalysisId,

    #[error("analysis timed out after {0} retries")]
    Timeout(u32),

    #[error("file {name} flagged as malicious")]
    Flagged {
        name: String,
        malicious: u32,
        suspicious: u32,
    },

    #[error("malicious attachment detected: {name} ({source})")]
    Attachment {
        name: String,
        #[source]
        source: Box<ScanError>,
    },

    #[error("malicious embedded file detected: {content_id} ({source})")]
    EmbeddedFile {
        content_id: String,
        #[source]
        source: Box<ScanError>,
    },
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    data: UploadData,
}

#[derive(Debug, Default, Deserialize)]
struct UploadData {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    #[serde(default)]
    data: AnalysisData,
}

#[derive(Debug, Default, Deserialize)]
struct AnalysisData {
    #[serde(default)]
    attributes: AnalysisAttributes,
}

#[derive(Debug, Default, Deserialize)]
struct AnalysisAttributes {
    #[serde(default)]
    status: String,
    #[serde(default)]
    stats: AnalysisStats,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct AnalysisStats {
    #[serde(default)]
    malicious: u32,
    #[serde(default)]
    suspicious: u32,
}

/// VirusTotal v3 client: upload to `/files`, poll `/analyses/{id}`.
pub struct VirusTotalClient {
    upload_client: reqwest::Client,
    poll_client: reqwest::Client,
    config: ScannerConfig,
}

impl VirusTotalClient {
    pub fn new(config: ScannerConfig) -> Result<Self, ScanError> {
        let upload_client = reqwest::Client::builder()
            .timeout(config.upload_timeout())
            .build()?;
        let poll_client = reqwest::Client::builder()
            .timeout(config.poll_timeout())
            .build()?;

        Ok(Self {
            upload_client,
            poll_client,
            config,
        })
    }

    async fn scan_file(&self, data: &[u8], name: &str) -> Result<(), ScanError> {
        if data.is_empty() {
            debug!(name, "Skipping empty payload");
            return Ok(());
        }
        let name = if name.is_empty() { DEFAULT_UPLOAD_NAME } else { name };

        let analysis_id = self.upload(data, name).await?;
        debug!(name, %analysis_id, "File uploaded for analysis");

        let stats = self.wait_for_analysis(&analysis_id).await?;
        if stats.malicious > 0 || stats.suspicious > 0 {
            warn!(
                name,
                malicious = stats.malicious,
                suspicious = stats.suspicious,
                "File flagged by scanner"
            );
            return Err(ScanError::Flagged {
                name: name.to_string(),
                malicious: stats.malicious,
                suspicious: stats.suspicious,
            });
        }

        info!(name, "File scanned clean");
        Ok(())
    }

    async fn upload(&self, data: &[u8], name: &str) -> Result<String, ScanError> {
        let form = Form::new().part("file", Part::bytes(data.to_vec()).file_name(name.to_string()));

        let response = self
            .upload_client
            .post(format!("{}/files", self.config.api_url))
            .header("x-apikey", &self.config.api_key)
            .header("Accept", "application/json")
            .multipart(form)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(ScanError::Status {
                stage: "upload",
                status: response.status().as_u16(),
            });
        }

        let body: UploadResponse = response.json().await?;
        if body.data.id.is_empty() {
            return Err(ScanError::MissingAnalysisId);
        }
        Ok(body.data.id)
    }

    async fn wait_for_analysis(&self, analysis_id: &str) -> Result<AnalysisStats, ScanError> {
        let url = format!("{}/analyses/{}", self.config.api_url, analysis_id);
        let max_polls = self.config.max_polls;

        for attempt in 1..=max_polls {
            let response = self
                .poll_client
                .get(&url)
                .header("x-apikey", &self.config.api_key)
                .header("Accept", "application/json")
                .send()
                .await?;

            if response.status() != StatusCode::OK {
                return Err(ScanError::Status {
                    stage: "analysis",
                    status: response.status().as_u16(),
                });
            }

            let body: AnalysisResponse = response.json().await?;
            let attributes = body.data.attributes;
            if attributes.status.eq_ignore_ascii_case("completed") {
                return Ok(attributes.stats);
            }

            debug!(analysis_id, attempt, status = %attributes.status, "Analysis pending");
            if attempt < max_polls {
                tokio::time::sleep(self.config.poll_interval()).await;
            }
        }

        Err(ScanError::Timeout(max_polls))
    }
}

#[async_trait]
impl ContentScan for VirusTotalClient {
    async fn scan(
        &self,
        attachments: &[Attachment],
        embedded: &[EmbeddedFile],
    ) -> Result<(), ScanError> {
        for attachment in attachments {
            self.scan_file(&attachment.data, &attachment.filename)
                .await
                .map_err(|source| ScanError::Attachment {
                    name: attachment.filename.clone(),
                    source: Box::new(source),
                })?;
        }

        for file in embedded {
            self.scan_file(&file.data, &file.content_id)
                .await
                .map_err(|source| ScanError::EmbeddedFile {
                    content_id: file.content_id.clone(),
                    source: Box::new(source),
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Multipart, Path, State};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Fake scanner. The uploaded file name picks the analysis outcome:
    /// names containing "evil" are malicious, "slow" never completes,
    /// "noid" gets an upload response without an id.
    #[derive(Default)]
    struct FakeScanner {
        uploads: AtomicUsize,
        polls: AtomicUsize,
        analyses: Mutex<HashMap<String, String>>,
    }

    async fn upload(
        State(state): State<Arc<FakeScanner>>,
        mut multipart: Multipart,
    ) -> Json<Value> {
        let n = state.uploads.fetch_add(1, Ordering::SeqCst);
        let mut name = String::new();
        while let Some(field) = multipart.next_field().await.unwrap() {
            if field.name() == Some("file") {
                name = field.file_name().unwrap_or_default().to_string();
                let _ = field.bytes().await.unwrap();
            }
        }
        if name.contains("noid") {
            return Json(json!({"data": {}}));
        }
        let id = format!("analysis-{}", n);
        state.analyses.lock().unwrap().insert(id.clone(), name);
        Json(json!({"data": {"id": id, "type": "analysis"}}))
    }

    async fn analysis(
        State(state): State<Arc<FakeScanner>>,
        Path(id): Path<String>,
    ) -> Json<Value> {
        state.polls.fetch_add(1, Ordering::SeqCst);
        let name = state.analyses.lock().unwrap().get(&id).cloned().unwrap_or_default();
        let body = if name.contains("slow") {
            json!({"data": {"attributes": {"status": "queued"}}})
        } else if name.contains("evil") {
            json!({"data": {"attributes": {"status": "completed",
                "stats": {"malicious": 3, "suspicious": 0, "harmless": 0}}}})
        } else {
            json!({"data": {"attributes": {"status": "Completed",
                "stats": {"malicious": 0, "suspicious": 0, "undetected": 60}}}})
        };
        Json(body)
    }

    async fn fake_service() -> (String, Arc<FakeScanner>) {
        let state = Arc::new(FakeScanner::default());
        let app = Router::new()
            .route("/files", post(upload))
            .route("/analyses/:id", get(analysis))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), state)
    }

    fn client(url: String) -> VirusTotalClient {
        VirusTotalClient::new(ScannerConfig {
            api_url: url,
            api_key: "test-key".to_string(),
            poll_interval_ms: 10,
            max_polls: 3,
            ..ScannerConfig::default()
        })
        .unwrap()
    }

    fn attachment(name: &str, data: &[u8]) -> Attachment {
        Attachment {
            filename: name.to_string(),
            content_type: "application/octet-stream".to_string(),
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_clean_files_pass() {
        let (url, state) = fake_service().await;
        let embedded = EmbeddedFile {
            content_id: "logo@x".to_string(),
            content_type: "image/png".to_string(),
            data: b"png".to_vec(),
        };

        client(url)
            .scan(&[attachment("report.pdf", b"%PDF")], &[embedded])
            .await
            .unwrap();
        assert_eq!(state.uploads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_payload_not_uploaded() {
        let (url, state) = fake_service().await;
        client(url).scan(&[attachment("empty.txt", b"")], &[]).await.unwrap();
        assert_eq!(state.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malicious_attachment_aborts_scan() {
        let (url, state) = fake_service().await;
        let err = client(url)
            .scan(
                &[attachment("evil.exe", b"MZ"), attachment("later.txt", b"hi")],
                &[],
            )
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "malicious attachment detected: evil.exe (file evil.exe flagged as malicious)"
        );
        assert_eq!(state.uploads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malicious_embedded_file() {
        let (url, _) = fake_service().await;
        let embedded = EmbeddedFile {
            content_id: "evil@cid".to_string(),
            content_type: "image/gif".to_string(),
            data: b"GIF89a".to_vec(),
        };
        let err = client(url).scan(&[], &[embedded]).await.unwrap_err();
        assert!(matches!(err, ScanError::EmbeddedFile { ref content_id, .. } if content_id == "evil@cid"));
    }

    #[tokio::test]
    async fn test_poll_exhaustion_times_out() {
        let (url, state) = fake_service().await;
        let err = client(url)
            .scan(&[attachment("slow.bin", b"data")], &[])
            .await
            .unwrap_err();

        match err {
            ScanError::Attachment { source, .. } => {
                assert_eq!(source.to_string(), "analysis timed out after 3 retries")
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(state.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_analysis_id() {
        let (url, _) = fake_service().await;
        let err = client(url)
            .scan(&[attachment("noid.txt", b"x")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Attachment { ref source, .. }
            if matches!(**source, ScanError::MissingAnalysisId)));
    }

    #[tokio::test]
    async fn test_empty_name_uses_default() {
        let (url, state) = fake_service().await;
        client(url).scan(&[attachment("", b"x")], &[]).await.unwrap();
        let names: Vec<String> = state.analyses.lock().unwrap().values().cloned().collect();
        assert_eq!(names, vec![DEFAULT_UPLOAD_NAME.to_string()]);
    }
}
