//! The CDS client contract (§6): how the sync engine asks the
//! collaborative document service for folder metadata and content. Actual
//! CRDT wire parsing is out of scope — this trait is the seam, and the one
//! shipped implementation assumes a plain-JSON realization of it.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::persistence::state::Filemeta;
use crate::resource::Resource;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FolderDoc {
    pub filemeta: Filemeta,
}

/// A canvas document: ordered edges/nodes (each an arbitrary JSON map) plus
/// any top-level CRDT text keys, which the canonical serializer (§6) uses
/// to overwrite a node's `text` field when the key matches the node's id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanvasDoc {
    pub edges: Vec<serde_json::Map<String, serde_json::Value>>,
    pub nodes: Vec<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub texts: BTreeMap<String, String>,
}

/// Transport-level failure talking to the CDS. Distinct from "absent",
/// which is a normal 404 and represented as `None`/`Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum CdsError {
    #[error("CDS transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Consumed by the sync engine; generic rather than `dyn`-dispatched since
/// every method is `async fn` (native trait-async, no `dyn` object needed —
/// the engine is generic over its client). `Send + Sync` so `SyncEngine<C>`
/// can be wrapped in `Arc` and shared across the spawned worker/committer
/// tasks.
pub trait CdsClient: Send + Sync {
    fn get_folder_doc(
        &self,
        resource: &Resource,
    ) -> impl std::future::Future<Output = Result<Option<FolderDoc>, CdsError>> + Send;

    fn get_document_text(
        &self,
        resource: &Resource,
    ) -> impl std::future::Future<Output = Result<Option<String>, CdsError>> + Send;

    fn get_canvas(
        &self,
        resource: &Resource,
    ) -> impl std::future::Future<Output = Result<Option<CanvasDoc>, CdsError>> + Send;

    fn get_file_download_url(
        &self,
        resource: &Resource,
        hash: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>, CdsError>> + Send;

    fn download_bytes(
        &self,
        url: &str,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, CdsError>> + Send;
}

/// The compound id, `relay_id + "-" + inner_id`, as used at the wire
/// boundary. Construction is confined to this module and the webhook
/// parser — nothing else in the crate is allowed to build one.
fn compound_id(resource: &Resource) -> String {
    format!("{}-{}", resource.relay_id(), resource.resource_id())
}

/// HTTP implementation of [`CdsClient`] against a plain-JSON realization of
/// the contract: one GET per operation, the compound id in the path.
pub struct HttpCdsClient {
    base_url: String,
    metadata_client: reqwest::Client,
    download_client: reqwest::Client,
}

impl HttpCdsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpCdsClient {
            base_url: base_url.into(),
            metadata_client: reqwest::Client::builder()
                .timeout(METADATA_TIMEOUT)
                .build()
                .expect("reqwest client builds"),
            download_client: reqwest::Client::builder()
                .timeout(DOWNLOAD_TIMEOUT)
                .build()
                .expect("reqwest client builds"),
        }
    }

    async fn get_json_or_absent<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, CdsError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.metadata_client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.json::<T>().await?))
    }
}

impl CdsClient for HttpCdsClient {
    async fn get_folder_doc(&self, resource: &Resource) -> Result<Option<FolderDoc>, CdsError> {
        let path = format!("/folders/{}/filemeta", compound_id(resource));
        let filemeta: Option<Filemeta> = self.get_json_or_absent(&path).await?;
        Ok(filemeta.map(|filemeta| FolderDoc { filemeta }))
    }

    async fn get_document_text(&self, resource: &Resource) -> Result<Option<String>, CdsError> {
        #[derive(Deserialize)]
        struct DocResponse {
            contents: String,
        }
        let path = format!("/documents/{}", compound_id(resource));
        let doc: Option<DocResponse> = self.get_json_or_absent(&path).await?;
        Ok(doc.map(|d| d.contents))
    }

    async fn get_canvas(&self, resource: &Resource) -> Result<Option<CanvasDoc>, CdsError> {
        let path = format!("/canvases/{}", compound_id(resource));
        self.get_json_or_absent(&path).await
    }

    async fn get_file_download_url(
        &self,
        resource: &Resource,
        hash: &str,
    ) -> Result<Option<String>, CdsError> {
        #[derive(Deserialize)]
        struct UrlResponse {
            url: String,
        }
        let path = format!("/files/{}/download-url?hash={}", compound_id(resource), hash);
        let response: Option<UrlResponse> = self.get_json_or_absent(&path).await?;
        Ok(response.map(|r| r.url))
    }

    async fn download_bytes(&self, url: &str) -> Result<Vec<u8>, CdsError> {
        let response = self.download_client.get(url).send().await?;
        let response = response.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}
