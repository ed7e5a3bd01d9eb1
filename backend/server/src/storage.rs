//! # Blob Storage
//!
//! Uploaded images go to an S3-style HTTP bucket: `PUT` and `DELETE` on `<bucket>/<path>`,
//! public reads through a separate base URL (CDN or reverse proxy).
use async_trait::async_trait;
use ledger::{
    StoreError,
    ports::{BlobLocation, BlobStore},
};
use reqwest::{Client, RequestBuilder, StatusCode, header::CONTENT_TYPE};
use tracing::info;

pub struct HttpBlobStore {
    client: Client,
    bucket_url: String,
    public_url: String,
    token: Option<String>,
}

impl HttpBlobStore {
    pub fn new(bucket_url: &str, public_url: &str, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            bucket_url: bucket_url.trim_end_matches('/').to_string(),
            public_url: public_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/{}", self.bucket_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn unavailable(e: reqwest::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<BlobLocation, StoreError> {
        self.authorize(self.client.put(self.object_url(path)))
            .header(CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(unavailable)?;

        info!("Uploaded {} bytes to {path}", bytes.len());
        Ok(BlobLocation {
            path: path.to_string(),
        })
    }

    async fn public_url(&self, location: &BlobLocation) -> Result<String, StoreError> {
        Ok(format!(
            "{}/{}",
            self.public_url,
            location.path.trim_start_matches('/')
        ))
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let response = self
            .authorize(self.client.delete(self.object_url(path)))
            .send()
            .await
            .map_err(unavailable)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::Missing(path.to_string()));
        }

        response.error_for_status().map_err(unavailable)?;
        Ok(())
    }
}
