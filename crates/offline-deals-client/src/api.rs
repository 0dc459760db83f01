//! Client for the remote coordination API.
//!
//! Every call is a `POST` with a bearer token. Responses share one envelope:
//!
//! ```json
//! {"code": 200, "msg": "ok", "data": { ... }}
//! ```
//!
//! Any `code` other than 200 is a domain error carrying `msg`.

use crate::{Error, Result};
use async_trait::async_trait;
use offline_deals_core::Deal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Path of the pending-deal list.
pub const OFFLINE_LIST_PATH: &str = "/v1/deal/offlineList";

/// Path of the content-store credential endpoint.
pub const DATA_AUTH_PATH: &str = "/v1/deal/dataAuth";

/// Domain code of a successful response.
const CODE_OK: i64 = 200;

/// Something that can list the deals waiting to be transferred.
#[async_trait]
pub trait DealSource: Send + Sync {
    /// Fetch the current pending-deal list.
    async fn pending_deals(&self) -> Result<Vec<Deal>>;
}

/// The pending-deal list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealList {
    /// Total number of pending deals on the server.
    #[serde(default)]
    pub total: i64,
    /// The deals themselves. Entries that do not decode are skipped.
    #[serde(default, deserialize_with = "lenient_deals")]
    pub list: Vec<Deal>,
}

fn lenient_deals<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<Deal>, D::Error> {
    let entries = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<Deal>(entry.clone()) {
            Ok(deal) => Some(deal),
            Err(e) => {
                warn!(entry = %entry, "skip undecodable deal: {}", e);
                None
            }
        })
        .collect())
}

/// Short-lived credentials for the remote content store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCredentials {
    /// Base URL of the content store.
    #[serde(default)]
    pub endpoint: String,
    /// Bearer token for the content store.
    #[serde(default)]
    pub token: String,
    /// Store-specific fields passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

/// Remote coordination API client.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl ApiClient {
    /// Create a client for `endpoint` authenticated with `token`.
    pub fn new(endpoint: &str, token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_http(http, endpoint, token))
    }

    /// Create a client sharing an existing HTTP connection pool.
    pub fn with_http(http: reqwest::Client, endpoint: &str, token: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// Base URL, without a trailing slash.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Fetch the pending offline deals.
    pub async fn offline_deals(&self) -> Result<DealList> {
        let list: Option<DealList> = self.post(OFFLINE_LIST_PATH).await?;
        Ok(list.unwrap_or_default())
    }

    /// Fetch fresh content-store credentials.
    pub async fn data_auth(&self) -> Result<StoreCredentials> {
        let creds: Option<StoreCredentials> = self.post(DATA_AUTH_PATH).await?;
        let creds = creds.unwrap_or_default();
        debug!(endpoint = %creds.endpoint, "get data auth success");
        Ok(creds)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{}", self.endpoint, path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await
            .inspect_err(|e| error!("request api failed, {}", e))?;

        let payload = response
            .bytes()
            .await
            .inspect_err(|e| error!("request api failed, {}", e))?;

        let envelope: Envelope<T> = serde_json::from_slice(&payload).inspect_err(|e| {
            error!(
                url = %url,
                payload = %String::from_utf8_lossy(&payload),
                "json unmarshal failed: {}",
                e
            )
        })?;

        if envelope.code != CODE_OK {
            return Err(Error::Api {
                code: envelope.code,
                msg: envelope.msg,
            });
        }
        Ok(envelope.data)
    }
}

#[async_trait]
impl DealSource for ApiClient {
    async fn pending_deals(&self) -> Result<Vec<Deal>> {
        Ok(self.offline_deals().await?.list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn deal_json() -> serde_json::Value {
        json!({
            "Miner": "f01000",
            "Client": "f1client",
            "DataCid": {"/": "QmYnsC47dUxaWFeoo3bvtoARw79TtdFgAn3UDkQKo1J1NF"},
            "Verified": true,
            "PropCid": {"/": "bafyreibf2znjlonzbpn6pwbhvugiauto2g37zv4pb4wargpoedeglo44zq"},
            "PieceSize": 34359738368u64,
            "PieceCid": null
        })
    }

    #[test]
    fn test_endpoint_trailing_slash_trimmed() {
        let client = ApiClient::new("https://datasets.example.io/", "t").unwrap();
        assert_eq!(client.endpoint(), "https://datasets.example.io");
    }

    #[tokio::test]
    async fn test_offline_deals() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(OFFLINE_LIST_PATH)
                    .header("authorization", "Bearer secret")
                    .header("content-type", "application/json");
                then.status(200).json_body(json!({
                    "code": 200,
                    "msg": "success",
                    "data": {"total": 1, "list": [deal_json()]}
                }));
            })
            .await;

        let client = ApiClient::new(&server.base_url(), "secret").unwrap();
        let deals = client.offline_deals().await.unwrap();
        mock.assert_async().await;

        assert_eq!(deals.total, 1);
        assert_eq!(deals.list.len(), 1);
        assert_eq!(deals.list[0].miner, "f01000");
        assert_eq!(
            deals.list[0].key(),
            "QmYnsC47dUxaWFeoo3bvtoARw79TtdFgAn3UDkQKo1J1NF"
        );

        let via_trait = client.pending_deals().await.unwrap();
        assert_eq!(via_trait, deals.list);
    }

    #[tokio::test]
    async fn test_bad_entry_does_not_hide_other_deals() {
        let mut broken = deal_json();
        broken["PropCid"] = serde_json::Value::Null;
        let mut anonymous = deal_json();
        anonymous["DataCid"] = json!({"/": "bafkreigh2akiscaildcqabsyg3dfr6chu3fgpregiymsck7e7aqa4s52zy"});
        anonymous.as_object_mut().unwrap().remove("Miner");

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(OFFLINE_LIST_PATH);
                then.status(200).json_body(json!({
                    "code": 200,
                    "msg": "success",
                    "data": {"total": 3, "list": [broken, deal_json(), anonymous]}
                }));
            })
            .await;

        let client = ApiClient::new(&server.base_url(), "t").unwrap();
        let deals = client.offline_deals().await.unwrap();

        assert_eq!(deals.total, 3);
        assert_eq!(deals.list.len(), 2);
        assert_eq!(
            deals.list[0].key(),
            "QmYnsC47dUxaWFeoo3bvtoARw79TtdFgAn3UDkQKo1J1NF"
        );
        assert_eq!(deals.list[1].miner, "");
        assert_eq!(deals.list[1].client, "f1client");
    }

    #[tokio::test]
    async fn test_non_200_code_is_api_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(OFFLINE_LIST_PATH);
                then.status(200)
                    .json_body(json!({"code": 401, "msg": "token expired", "data": null}));
            })
            .await;

        let client = ApiClient::new(&server.base_url(), "stale").unwrap();
        let err = client.offline_deals().await.unwrap_err();
        match err {
            Error::Api { code, msg } => {
                assert_eq!(code, 401);
                assert_eq!(msg, "token expired");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_json_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(OFFLINE_LIST_PATH);
                then.status(502).body("<html>bad gateway</html>");
            })
            .await;

        let client = ApiClient::new(&server.base_url(), "t").unwrap();
        let err = client.offline_deals().await.unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[tokio::test]
    async fn test_empty_data_is_empty_list() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(OFFLINE_LIST_PATH);
                then.status(200).json_body(json!({"code": 200, "msg": "ok"}));
            })
            .await;

        let client = ApiClient::new(&server.base_url(), "t").unwrap();
        let deals = client.offline_deals().await.unwrap();
        assert_eq!(deals, DealList::default());
    }

    #[tokio::test]
    async fn test_data_auth() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(DATA_AUTH_PATH)
                    .header("authorization", "Bearer secret");
                then.status(200).json_body(json!({
                    "code": 200,
                    "msg": "ok",
                    "data": {
                        "endpoint": "https://store.example.io",
                        "token": "short-lived",
                        "region": "eu"
                    }
                }));
            })
            .await;

        let client = ApiClient::new(&format!("{}/", server.base_url()), "secret").unwrap();
        let creds = client.data_auth().await.unwrap();
        mock.assert_async().await;

        assert_eq!(creds.endpoint, "https://store.example.io");
        assert_eq!(creds.token, "short-lived");
        assert_eq!(creds.extra.get("region"), Some(&json!("eu")));
    }
}
