use crate::error::RelayError;
use anyhow::Context as _;
use bytes::Bytes;
use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const ASSET_DESCRIPTION_HEADER: &str = "x-amz-meta-nvcf-asset-description";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateAssetRequest<'a> {
    content_type: &'a str,
    description: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAssetResponse {
    upload_url: String,
    asset_id: String,
}

/// Client for the NVCF asset store, used for media too large to inline
#[derive(Clone)]
pub struct AssetClient {
    http: Client,
    assets_url: String,
    api_key: String,
    request_timeout: Duration,
    stream_timeout: Duration,
}

impl AssetClient {
    pub fn new(
        http: Client,
        assets_url: impl Into<String>,
        api_key: impl Into<String>,
        request_timeout: Duration,
        stream_timeout: Duration,
    ) -> Self {
        Self {
            http,
            assets_url: assets_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            request_timeout,
            stream_timeout,
        }
    }

    /// Reserve an asset and push `data` to its upload location.
    ///
    /// The returned lease owns the asset. If the push fails the reserved asset
    /// is deleted before the error is returned.
    pub async fn upload(
        &self,
        data: Bytes,
        mime_type: &str,
        description: &str,
    ) -> Result<AssetLease, RelayError> {
        let created = self
            .create(mime_type, description)
            .await
            .map_err(RelayError::AssetUpload)?;
        let lease = self.lease(created.asset_id);
        debug!(asset_id = lease.id(), bytes = data.len(), "Uploading asset bytes");

        let pushed = self
            .http
            .put(&created.upload_url)
            .header(ASSET_DESCRIPTION_HEADER, description)
            .header(CONTENT_TYPE, mime_type)
            .body(data)
            .timeout(self.stream_timeout)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .context("Failed to upload asset bytes");

        if let Err(cause) = pushed {
            lease.release().await;
            return Err(RelayError::AssetUpload(cause));
        }

        info!(asset_id = lease.id(), mime_type, "Asset uploaded");
        Ok(lease)
    }

    async fn create(&self, mime_type: &str, description: &str) -> anyhow::Result<CreateAssetResponse> {
        let response = self
            .http
            .post(&self.assets_url)
            .bearer_auth(&self.api_key)
            .header(ACCEPT, "application/json")
            .json(&CreateAssetRequest {
                content_type: mime_type,
                description,
            })
            .timeout(self.request_timeout)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .context("Failed to create asset")?;

        response
            .json::<CreateAssetResponse>()
            .await
            .context("Invalid asset creation response")
    }

    /// Delete an asset. Failures are logged and swallowed.
    pub async fn delete(&self, asset_id: &str) {
        let result = self
            .http
            .delete(format!("{}/{asset_id}", self.assets_url))
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match result {
            Ok(_) => info!(asset_id, "Asset deleted"),
            Err(err) => error!(asset_id, error = %err.without_url(), "Failed to delete asset"),
        }
    }

    /// Tie `asset_id` to a lease that deletes it exactly once
    pub fn lease(&self, asset_id: String) -> AssetLease {
        AssetLease {
            client: self.clone(),
            asset_id: Some(asset_id),
        }
    }
}

/// Ownership of a remote asset for the duration of one request.
///
/// Call [`AssetLease::release`] on every normal path. If the lease is dropped
/// unreleased (cancelled request, panic) the delete is spawned on the runtime.
pub struct AssetLease {
    client: AssetClient,
    asset_id: Option<String>,
}

impl AssetLease {
    pub fn id(&self) -> &str {
        self.asset_id.as_deref().unwrap_or_default()
    }

    pub async fn release(mut self) {
        if let Some(asset_id) = self.asset_id.take() {
            self.client.delete(&asset_id).await;
        }
    }
}

impl Drop for AssetLease {
    fn drop(&mut self) {
        let Some(asset_id) = self.asset_id.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(%asset_id, "Asset lease dropped unreleased, deleting in background");
                let client = self.client.clone();
                handle.spawn(async move { client.delete(&asset_id).await });
            }
            Err(_) => error!(%asset_id, "No runtime to delete asset, it will be left behind"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ASSETS_PATH: &str = "/v2/nvcf/assets";

    fn client(server: &MockServer) -> AssetClient {
        AssetClient::new(
            Client::new(),
            format!("{}{ASSETS_PATH}", server.uri()),
            "nvapi-test",
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    async fn mount_create(server: &MockServer, asset_id: &str) {
        Mock::given(method("POST"))
            .and(path(ASSETS_PATH))
            .and(header("authorization", "Bearer nvapi-test"))
            .and(body_json(json!({
                "contentType": "video/mp4",
                "description": "Video analysis request"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uploadUrl": format!("{}/upload/{asset_id}", server.uri()),
                "assetId": asset_id,
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    async fn delete_count(server: &MockServer) -> usize {
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.method.as_str() == "DELETE")
            .count()
    }

    #[tokio::test]
    async fn test_upload_creates_then_puts() {
        let server = MockServer::start().await;
        mount_create(&server, "asset-123").await;
        Mock::given(method("PUT"))
            .and(path("/upload/asset-123"))
            .and(header("content-type", "video/mp4"))
            .and(header(ASSET_DESCRIPTION_HEADER, "Video analysis request"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("DELETE"))
            .and(path(format!("{ASSETS_PATH}/asset-123")))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let lease = client(&server)
            .upload(
                Bytes::from_static(b"\x00\x00\x00\x18ftypmp42"),
                "video/mp4",
                "Video analysis request",
            )
            .await
            .unwrap();
        assert_eq!(lease.id(), "asset-123");
        assert_eq!(delete_count(&server).await, 0);
        lease.release().await;
        assert_eq!(delete_count(&server).await, 1);

        let put = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.method.as_str() == "PUT")
            .unwrap();
        assert_eq!(put.body, b"\x00\x00\x00\x18ftypmp42");
    }

    #[tokio::test]
    async fn test_create_failure_is_upload_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .upload(Bytes::from_static(b"data"), "video/mp4", "Video analysis request")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::AssetUpload(_)));
        assert_eq!(err.to_string(), "Asset upload failed");
        assert_eq!(delete_count(&server).await, 0);
    }

    #[tokio::test]
    async fn test_put_failure_deletes_reserved_asset() {
        let server = MockServer::start().await;
        mount_create(&server, "asset-403").await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("{ASSETS_PATH}/asset-403")))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .upload(Bytes::from_static(b"data"), "video/mp4", "Video analysis request")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::AssetUpload(_)));
        assert_eq!(delete_count(&server).await, 1);
    }

    #[tokio::test]
    async fn test_delete_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path(format!("{ASSETS_PATH}/gone")))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).delete("gone").await;
    }

    #[tokio::test]
    async fn test_release_deletes_once() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path(format!("{ASSETS_PATH}/asset-1")))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let lease = client(&server).lease("asset-1".into());
        assert_eq!(lease.id(), "asset-1");
        lease.release().await;

        assert_eq!(delete_count(&server).await, 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_still_deletes() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path(format!("{ASSETS_PATH}/asset-2")))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        drop(client(&server).lease("asset-2".into()));

        for _ in 0..50 {
            if delete_count(&server).await == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("asset was not deleted after lease drop");
    }
}
