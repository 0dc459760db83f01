//! Local storage node: endpoint discovery and deal-data import.
//!
//! The node publishes its API address and auth token as two files in its
//! configuration directory:
//!
//! ```text
//! <dir>/api    /ip4/127.0.0.1/tcp/2345/http
//! <dir>/token  eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9...
//! ```
//!
//! The directory comes from `LOTUS_MARKETS_PATH`, then `LOTUS_MINER_PATH`,
//! then `~/.lotusminer`. Both files are re-read on every import so a node
//! restart with a new token is picked up without restarting the client.

use crate::{Error, Result};
use async_trait::async_trait;
use cid::Cid;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error};

/// Environment variable naming a markets node's config directory.
pub const MARKETS_PATH_ENV: &str = "LOTUS_MARKETS_PATH";

/// Environment variable naming a miner node's config directory.
pub const MINER_PATH_ENV: &str = "LOTUS_MINER_PATH";

/// JSON-RPC method that registers an offline deal's data.
pub const IMPORT_METHOD: &str = "Filecoin.MarketImportDealData";

/// Something that can hand a deal's archive to the storage node.
#[async_trait]
pub trait DealImporter: Send + Sync {
    /// Import the archive at `path` (absolute) for the deal proposed as `prop_cid`.
    async fn import(&self, prop_cid: &Cid, path: &Path) -> Result<()>;
}

/// The storage node's configuration directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfigDir {
    /// Directory holding the `api` and `token` files.
    pub path: PathBuf,
    /// Which node process is expected to have written it, for error messages.
    pub node_type: &'static str,
}

impl NodeConfigDir {
    /// Resolve the directory from the process environment.
    pub fn from_env() -> Self {
        Self::resolve(
            std::env::var_os(MARKETS_PATH_ENV).map(PathBuf::from),
            std::env::var_os(MINER_PATH_ENV).map(PathBuf::from),
            dirs::home_dir(),
        )
    }

    fn resolve(markets: Option<PathBuf>, miner: Option<PathBuf>, home: Option<PathBuf>) -> Self {
        if let Some(path) = markets {
            return Self {
                path,
                node_type: "markets",
            };
        }
        if let Some(path) = miner {
            return Self {
                path,
                node_type: "miner or markets",
            };
        }
        Self {
            path: home.unwrap_or_default().join(".lotusminer"),
            node_type: "miner or markets",
        }
    }

    fn read(&self, name: &str) -> Result<String> {
        let path = self.path.join(name);
        std::fs::read_to_string(&path).map_err(|e| Error::NodeEndpoint {
            path: path.display().to_string(),
            node_type: self.node_type,
            reason: e.to_string(),
        })
    }
}

/// Where to reach the storage node's JSON-RPC API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEndpoint {
    /// `http://<host>:<port>/rpc/v0`
    pub url: String,
    /// Bearer token.
    pub token: String,
}

impl NodeEndpoint {
    /// Read the endpoint from the `api` and `token` files in `dir`.
    ///
    /// Missing or malformed files are [`Error::NodeEndpoint`], which is fatal.
    pub fn read(dir: &NodeConfigDir) -> Result<Self> {
        let api = dir.read("api")?;
        let url = rpc_url(&api).ok_or_else(|| Error::NodeEndpoint {
            path: dir.path.join("api").display().to_string(),
            node_type: dir.node_type,
            reason: format!("unrecognized API address {:?}", api.trim()),
        })?;
        let token = dir.read("token")?.trim().to_string();
        Ok(Self { url, token })
    }
}

/// Turn an API multiaddr (`/ip4/<host>/tcp/<port>/http`) into an RPC URL.
fn rpc_url(multiaddr: &str) -> Option<String> {
    let parts: Vec<&str> = multiaddr.trim().split('/').collect();
    if parts.len() < 5 || !parts[0].is_empty() {
        return None;
    }
    let (proto, host, port) = (parts[1], parts[2], parts[4]);
    if host.is_empty() || port.parse::<u16>().is_err() {
        return None;
    }
    match proto {
        "ip6" => Some(format!("http://[{host}]:{port}/rpc/v0")),
        _ => Some(format!("http://{host}:{port}/rpc/v0")),
    }
}

#[derive(Debug, Clone)]
enum EndpointSource {
    /// Re-read from the config directory on every call.
    Dir(NodeConfigDir),
    Fixed(NodeEndpoint),
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// JSON-RPC client for the storage node's market API.
#[derive(Debug, Clone)]
pub struct NodeRpcClient {
    http: reqwest::Client,
    source: EndpointSource,
}

impl NodeRpcClient {
    /// A client that discovers the node through `dir` on every import.
    pub fn new(dir: NodeConfigDir) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            source: EndpointSource::Dir(dir),
        })
    }

    /// A client pinned to a known endpoint.
    pub fn with_endpoint(endpoint: NodeEndpoint) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            source: EndpointSource::Fixed(endpoint),
        })
    }

    fn endpoint(&self) -> Result<NodeEndpoint> {
        match &self.source {
            EndpointSource::Dir(dir) => NodeEndpoint::read(dir),
            EndpointSource::Fixed(endpoint) => Ok(endpoint.clone()),
        }
    }
}

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()?)
}

#[async_trait]
impl DealImporter for NodeRpcClient {
    async fn import(&self, prop_cid: &Cid, path: &Path) -> Result<()> {
        let endpoint = self.endpoint()?;
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": IMPORT_METHOD,
            "params": [offline_deals_core::cid_json::to_link(prop_cid), path.display().to_string()],
            "id": 3,
        });

        let response = self
            .http
            .post(&endpoint.url)
            .bearer_auth(&endpoint.token)
            .json(&body)
            .send()
            .await
            .inspect_err(|e| error!("request rpc api failed, {}", e))?;

        let status = response.status();
        let payload = response.bytes().await?;
        debug!(
            prop_cid = %prop_cid,
            "rpc response: {}",
            String::from_utf8_lossy(&payload)
        );

        if !status.is_success() {
            return Err(Error::Rpc {
                code: i64::from(status.as_u16()),
                message: String::from_utf8_lossy(&payload).trim().to_string(),
            });
        }

        let reply: RpcResponse = serde_json::from_slice(&payload)?;
        if let Some(err) = reply.error {
            return Err(Error::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(())
    }
}
