//! HTTP side of a ComfyUI instance.
//!
//! One method per endpoint the connector talks to: `/` (liveness),
//! `/prompt`, `/queue`, `/history/{id}`, `/view` and `/upload/image`.
//! Non-2xx answers become [`ComfyUIApiError::ApiError`] with the body
//! preserved.

use indexmap::IndexMap;
use serde::Deserialize;

use crate::graph::JobGraph;
use crate::messages::ErrorData;

/// REST client bound to one instance's base URL.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Body of a `/prompt` answer.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    /// Queue position; some builds omit it.
    #[serde(default)]
    pub number: i32,
}

/// One prompt's entry in the `/history/{prompt_id}` response.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryRecord {
    /// Node ID -> output produced by that node, in server order.
    #[serde(default)]
    pub outputs: IndexMap<String, NodeOutput>,
    /// Execution outcome; older servers omit it.
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// `status` block of a history record.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryStatus {
    /// `success` or `error`.
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
    /// `[kind, data]` pairs replayed from the event stream.
    #[serde(default)]
    pub messages: Vec<(String, serde_json::Value)>,
}

impl HistoryStatus {
    pub fn is_error(&self) -> bool {
        self.status_str == "error"
    }

    /// The recorded `execution_error` event, if any.
    pub fn execution_error(&self) -> Option<ErrorData> {
        self.messages
            .iter()
            .find(|(kind, _)| kind == "execution_error")
            .and_then(|(_, data)| serde_json::from_value(data.clone()).ok())
    }
}

/// Output of a single node as recorded in history.
///
/// Only image outputs are modelled; other kinds (text, gifs, ...) are
/// ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

/// Location of one output file on the ComfyUI server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Folder type: `output`, `input` or `temp`.
    #[serde(rename = "type")]
    pub folder_type: String,
}

/// Response of the `/upload/image` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    /// Name the file was stored under (may differ from the upload name
    /// when `overwrite` is false and the name was taken).
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type")]
    pub folder_type: String,
}

/// Errors from the REST layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ComfyUI answered {status}: {body}")]
    ApiError { status: u16, body: String },
}

impl ComfyUIApi {
    /// `api_url` is the instance root, e.g. `http://127.0.0.1:8188`.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Share a connection pool with other clients.
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// `GET /`. Only reports the status; a 200 means the web layer is
    /// up, not that jobs can run.
    pub async fn probe(&self) -> Result<reqwest::StatusCode, ComfyUIApiError> {
        let response = self.client.get(&self.api_url).send().await?;
        Ok(response.status())
    }

    /// `POST /prompt` with `{prompt, client_id}`.
    pub async fn submit_workflow(
        &self,
        workflow: &JobGraph,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });
        let response = self.client.post(self.endpoint("prompt")).json(&body).send().await?;
        Self::decode(response).await
    }

    /// `POST /queue` with `{delete: [prompt_id]}`: drops a job that has
    /// not started yet. Running jobs are unaffected.
    pub async fn delete_from_queue(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({ "delete": [prompt_id] });
        let response = self.client.post(self.endpoint("queue")).json(&body).send().await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    /// `GET /history/{prompt_id}`. The map is empty for unknown prompts.
    pub async fn get_history(
        &self,
        prompt_id: &str,
    ) -> Result<IndexMap<String, HistoryRecord>, ComfyUIApiError> {
        let response = self
            .client
            .get(self.endpoint(&format!("history/{prompt_id}")))
            .send()
            .await?;
        Self::decode(response).await
    }

    /// `GET /view`: raw bytes of one output file.
    pub async fn view(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(self.endpoint("view"))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.folder_type.as_str()),
            ])
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Multipart `POST /upload/image`.
    ///
    /// With `overwrite = false` the server renames on collision; the
    /// stored name is in the response.
    pub async fn upload_image(
        &self,
        file_name: String,
        data: Vec<u8>,
        subfolder: Option<&str>,
        folder_type: Option<&str>,
        overwrite: bool,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        let image = reqwest::multipart::Part::bytes(data).file_name(file_name);
        let mut form = reqwest::multipart::Form::new()
            .part("image", image)
            .text("overwrite", overwrite.to_string());
        if let Some(subfolder) = subfolder {
            form = form.text("subfolder", subfolder.to_string());
        }
        if let Some(folder_type) = folder_type {
            form = form.text("type", folder_type.to_string());
        }

        let response = self
            .client
            .post(self.endpoint("upload/image"))
            .multipart(form)
            .send()
            .await?;
        Self::decode(response).await
    }

    // ---- private helpers ----

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.api_url.trim_end_matches('/'))
    }

    /// Pass 2xx responses through; turn anything else into `ApiError`.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => format!("<body unavailable: {e}>"),
        };
        Err(ComfyUIApiError::ApiError {
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}
