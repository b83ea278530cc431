use super::{AliveIps, DEFAULT_INTERVAL, NodeInfo, PanelClient, Security, UserInfo, UserTraffic};
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, ETAG, HOST, IF_NONE_MATCH};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument};

const CONFIG_PATH: &str = "/api/v1/server/UniProxy/config";
const USER_PATH: &str = "/api/v1/server/UniProxy/user";
const ALIVE_IPS_PATH: &str = "/api/v1/server/UniProxy/aips";
const PUSH_PATH: &str = "/api/v1/server/UniProxy/push";
const ALIVE_PATH: &str = "/api/v1/server/UniProxy/alive";

/// Panel client speaking the UniProxy HTTP API over plain HTTP/1.1.
///
/// Each request opens its own connection. Every GET endpoint keeps its own ETag so a 304 on one
/// endpoint never masks a change on another.
pub struct HttpPanelClient {
    authority: String,
    base_path: String,
    query: String,
    node_id: i64,
    node_type: String,
    timeout: Duration,
    etags: Mutex<HashMap<&'static str, String>>,
    last_report_online: Mutex<HashMap<i64, usize>>,
}

#[derive(Deserialize)]
struct NodeConfigBody {
    #[serde(default)]
    server_port: u16,
    #[serde(default)]
    tls: i64,
    #[serde(default)]
    base_config: Option<BaseConfig>,
}

#[derive(Deserialize)]
struct BaseConfig {
    #[serde(default)]
    push_interval: Option<Value>,
    #[serde(default)]
    pull_interval: Option<Value>,
}

#[derive(Deserialize)]
struct UserListBody {
    users: Vec<WireUser>,
}

#[derive(Deserialize)]
struct WireUser {
    id: i64,
    uuid: String,
    #[serde(default)]
    speed_limit: Option<u64>,
    #[serde(default)]
    device_limit: Option<usize>,
}

#[derive(Deserialize)]
struct AliveIpsBody {
    users: Vec<WireAliveIps>,
}

#[derive(Deserialize)]
struct WireAliveIps {
    id: i64,
    #[serde(default)]
    alive_ips: Vec<String>,
}

impl HttpPanelClient {
    pub fn new(config: &NodeConfig) -> Result<Self> {
        let uri: Uri = config
            .api_host
            .parse()
            .map_err(|e| NodeError::Configuration(format!("invalid api_host: {}", e)))?;
        if uri.scheme_str() != Some("http") {
            return Err(NodeError::Configuration(format!(
                "unsupported api_host scheme: {}",
                config.api_host
            )));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| NodeError::Configuration("api_host has no host".to_string()))?;
        let authority = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));

        Ok(Self {
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
            query: panel_query(config),
            node_id: config.node_id,
            node_type: config.node_type.clone(),
            timeout: config.timeout(),
            etags: Mutex::new(HashMap::new()),
            last_report_online: Mutex::new(HashMap::new()),
        })
    }

    async fn get(&self, path: &'static str) -> Result<Option<Bytes>> {
        self.request(Method::GET, path, Bytes::new()).await
    }

    async fn post<T: serde::Serialize>(&self, path: &'static str, body: &T) -> Result<()> {
        let body = Bytes::from(serde_json::to_vec(body)?);
        self.request(Method::POST, path, body).await?;
        Ok(())
    }

    async fn request(
        &self,
        method: Method,
        path: &'static str,
        body: Bytes,
    ) -> Result<Option<Bytes>> {
        tokio::time::timeout(self.timeout, self.send(method, path, body))
            .await
            .map_err(|_| NodeError::Panel(format!("{} timed out after {:?}", path, self.timeout)))?
    }

    async fn send(&self, method: Method, path: &'static str, body: Bytes) -> Result<Option<Bytes>> {
        let conditional = method == Method::GET;
        let stream = TcpStream::connect(&self.authority).await?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Panel connection error: {}", e);
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}?{}", self.base_path, path, self.query))
            .header(HOST, self.authority.as_str())
            .header(CONTENT_TYPE, "application/json");
        if conditional && let Some(etag) = self.etags.lock().get(path) {
            builder = builder.header(IF_NONE_MATCH, etag.as_str());
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| NodeError::Panel(format!("failed to build request: {}", e)))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.collect().await?.to_bytes();

        if !status.is_success() {
            return Err(NodeError::Panel(format!(
                "{} returned {}: {}",
                path,
                status,
                String::from_utf8_lossy(&body)
            )));
        }
        if conditional && let Some(etag) = etag {
            self.etags.lock().insert(path, etag);
        }
        Ok(Some(body))
    }
}

#[async_trait]
impl PanelClient for HttpPanelClient {
    #[instrument(skip(self), fields(node_id = self.node_id))]
    async fn fetch_node_info(&self) -> Result<Option<NodeInfo>> {
        match self.get(CONFIG_PATH).await? {
            Some(body) => parse_node_info(&body, self.node_id, &self.node_type).map(Some),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(node_id = self.node_id))]
    async fn fetch_user_list(&self) -> Result<Option<Vec<UserInfo>>> {
        match self.get(USER_PATH).await? {
            Some(body) => parse_user_list(&body).map(Some),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(node_id = self.node_id))]
    async fn fetch_alive_ips(&self) -> Result<Option<AliveIps>> {
        let Some(body) = self.get(ALIVE_IPS_PATH).await? else {
            return Ok(None);
        };
        let alive = parse_alive_ips(&body)?;
        let last_report = self.last_report_online.lock();
        for (uid, ips) in &alive {
            debug!(
                "Alive ips: uid={}, ips={:?}, last reported online={}",
                uid,
                ips,
                last_report.get(uid).copied().unwrap_or(0)
            );
        }
        Ok(Some(alive))
    }

    #[instrument(skip(self, traffic), fields(node_id = self.node_id, users = traffic.len()))]
    async fn push_user_traffic(&self, traffic: &[UserTraffic]) -> Result<()> {
        let data: HashMap<i64, [u64; 2]> = traffic
            .iter()
            .map(|t| (t.uid, [t.upload, t.download]))
            .collect();
        self.post(PUSH_PATH, &data).await
    }

    #[instrument(skip(self, ips, counts), fields(node_id = self.node_id, users = counts.len()))]
    async fn push_online_users(
        &self,
        ips: &HashMap<i64, Vec<String>>,
        counts: &HashMap<i64, usize>,
    ) -> Result<()> {
        *self.last_report_online.lock() = counts.clone();
        self.post(ALIVE_PATH, ips).await?;
        info!("Reported online devices for {} users", counts.len());
        Ok(())
    }
}

/// Characters left as-is in query values, the RFC 3986 unreserved set
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn panel_query(config: &NodeConfig) -> String {
    format!(
        "node_id={}&node_type={}&token={}",
        config.node_id,
        utf8_percent_encode(&config.node_type, QUERY_VALUE),
        utf8_percent_encode(&config.api_key, QUERY_VALUE)
    )
}

fn parse_interval(value: Option<&Value>) -> Duration {
    let secs = match value {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    secs.filter(|s| *s > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_INTERVAL)
}

fn parse_node_info(body: &[u8], node_id: i64, node_type: &str) -> Result<NodeInfo> {
    let body: NodeConfigBody = serde_json::from_slice(body)?;
    let security = match body.tls {
        1 => Security::Tls,
        2 => Security::Reality,
        _ => Security::None,
    };
    let base = body.base_config.as_ref();
    Ok(NodeInfo {
        id: node_id,
        node_type: node_type.to_string(),
        server_port: body.server_port,
        security,
        push_interval: parse_interval(base.and_then(|b| b.push_interval.as_ref())),
        pull_interval: parse_interval(base.and_then(|b| b.pull_interval.as_ref())),
    })
}

fn parse_user_list(body: &[u8]) -> Result<Vec<UserInfo>> {
    let body: UserListBody = serde_json::from_slice(body)?;
    Ok(body
        .users
        .into_iter()
        .map(|u| UserInfo {
            id: u.id,
            uuid: u.uuid,
            speed_limit: u.speed_limit.unwrap_or(0),
            device_limit: u.device_limit.unwrap_or(0),
        })
        .collect())
}

fn parse_alive_ips(body: &[u8]) -> Result<AliveIps> {
    let body: AliveIpsBody = serde_json::from_slice(body)?;
    Ok(body
        .users
        .into_iter()
        .filter(|u| !u.alive_ips.is_empty())
        .map(|u| (u.id, u.alive_ips))
        .collect())
}
