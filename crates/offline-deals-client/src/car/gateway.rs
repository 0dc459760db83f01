//! HTTP gateway block source.

use super::{BlockSource, StoreConnector};
use crate::api::ApiClient;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use reqwest::StatusCode;
use std::sync::Arc;

const RAW_BLOCK_MEDIA_TYPE: &str = "application/vnd.ipld.raw";

/// Fetches raw blocks from a trustless HTTP gateway.
///
/// `GET <endpoint>/ipfs/<cid>?format=raw`
#[derive(Debug, Clone)]
pub struct GatewayBlockSource {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl GatewayBlockSource {
    pub fn new(http: reqwest::Client, endpoint: &str, token: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }
}

#[async_trait]
impl BlockSource for GatewayBlockSource {
    async fn get_block(&self, cid: &Cid) -> Result<Bytes> {
        let url = format!("{}/ipfs/{}", self.endpoint, cid);
        let mut request = self
            .http
            .get(&url)
            .query(&[("format", "raw")])
            .header(reqwest::header::ACCEPT, RAW_BLOCK_MEDIA_TYPE);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::BlockNotFound(*cid)),
            status if status.is_success() => Ok(response.bytes().await?),
            status => Err(Error::Store {
                cid: *cid,
                status: status.as_u16(),
            }),
        }
    }
}

/// Opens gateway block sources with credentials from the coordination API.
#[derive(Debug, Clone)]
pub struct RemoteStoreConnector {
    api: ApiClient,
    http: reqwest::Client,
}

impl RemoteStoreConnector {
    pub fn new(api: ApiClient, http: reqwest::Client) -> Self {
        Self { api, http }
    }
}

#[async_trait]
impl StoreConnector for RemoteStoreConnector {
    async fn connect(&self) -> Result<Arc<dyn BlockSource>> {
        let creds = self.api.data_auth().await?;
        if creds.endpoint.is_empty() {
            return Err(Error::Api {
                code: 200,
                msg: "data auth returned no store endpoint".to_string(),
            });
        }
        Ok(Arc::new(GatewayBlockSource::new(
            self.http.clone(),
            &creds.endpoint,
            &creds.token,
        )))
    }
}
