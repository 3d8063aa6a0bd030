//! Publish forwarding
//!
//! A PUB is turned into an HTTP request against the backend configured for
//! its subcommand. Failed attempts are retried immediately, at most
//! [`MAX_ATTEMPTS`] times in total.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error};

use crate::protocol::{Cmd, Message};

/// Hard cap on backend attempts per PUB, whatever the configured budget
pub const MAX_ATTEMPTS: u32 = 3;

/// HTTP method used for a publish target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubMethod {
    Get,
    Post,
}

/// A validated publish target
#[derive(Debug, Clone)]
pub struct PubTarget {
    pub addr_type: String,
    pub addr: String,
    pub method: PubMethod,
    /// Positional template filled with (cmd, subcmd, uid, sid, rid, body)
    pub params: String,
    /// Per-attempt timeout; `None` waits for the backend indefinitely
    pub timeout: Option<Duration>,
    pub retry: u32,
    pub cgi: String,
    pub host: String,
}

impl PubTarget {
    /// Total attempts a PUB against this target may make
    pub fn attempts(&self) -> u32 {
        self.retry.min(MAX_ATTEMPTS)
    }
}

/// Turns a configured (address type, address) into a dialable `host:port`
///
/// Swap in an implementation backed by service discovery when addresses
/// are logical names.
#[async_trait]
pub trait AddrResolver: Send + Sync {
    async fn resolve(&self, addr_type: &str, addr: &str) -> anyhow::Result<String>;
}

/// Uses the configured address as-is
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityResolver;

#[async_trait]
impl AddrResolver for IdentityResolver {
    async fn resolve(&self, _addr_type: &str, addr: &str) -> anyhow::Result<String> {
        Ok(addr.to_string())
    }
}

/// One backend HTTP call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRequest {
    pub method: PubMethod,
    pub uri: String,
    pub timeout: Option<Duration>,
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
}

/// Backend HTTP client
#[async_trait]
pub trait Backend: Send + Sync {
    /// Perform the call, returning the response body on success
    async fn call(&self, request: &BackendRequest) -> Result<Vec<u8>, BackendError>;
}

/// reqwest-backed [`Backend`]
///
/// GET sends params as the query string, POST as a form body. Any non-2xx
/// status is a failure.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
}

impl HttpBackend {
    pub fn new() -> Result<Self, BackendError> {
        let client = Client::builder().use_rustls_tls().build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn call(&self, request: &BackendRequest) -> Result<Vec<u8>, BackendError> {
        let mut builder = match request.method {
            PubMethod::Get => self.client.get(&request.uri).query(&request.params),
            PubMethod::Post => self.client.post(&request.uri).form(&request.params),
        };
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Backend call errors
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Extension payload a client may attach to a PUB
#[derive(Debug, Deserialize)]
struct ClientExt {
    #[serde(default)]
    cookie: Option<String>,
}

/// Routes PUB messages to their configured backend
pub struct PublishRouter {
    targets: HashMap<u8, PubTarget>,
    resolver: Arc<dyn AddrResolver>,
    backend: Arc<dyn Backend>,
}

impl PublishRouter {
    /// Create a router resolving addresses as-is
    pub fn new(targets: HashMap<u8, PubTarget>, backend: Arc<dyn Backend>) -> Self {
        Self {
            targets,
            resolver: Arc::new(IdentityResolver),
            backend,
        }
    }

    /// Replace the address resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn AddrResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Target configured for a subcommand
    pub fn target(&self, subcmd: u8) -> Option<&PubTarget> {
        self.targets.get(&subcmd)
    }

    /// Forward a PUB and build the reply
    ///
    /// `Err` means the PUB was dropped without a reply. Once a request is
    /// issued the result is always `Ok`: the backend's body, or the request
    /// tagged ERR when every attempt failed.
    pub async fn publish(&self, req: &Message) -> Result<Message, PublishError> {
        let target = self
            .target(req.subcmd)
            .ok_or(PublishError::NoTarget(req.subcmd))?;

        let addr = self
            .resolver
            .resolve(&target.addr_type, &target.addr)
            .await
            .map_err(PublishError::Resolve)?;

        let request = build_request(target, &addr, req)?;
        let attempts = target.attempts();

        for attempt in 1..=attempts {
            match self.backend.call(&request).await {
                Ok(body) => {
                    debug!(
                        uri = %request.uri,
                        subcmd = req.subcmd,
                        attempt,
                        len = body.len(),
                        "backend publish succeeded"
                    );
                    return Ok(req.reply_with_body(String::from_utf8_lossy(&body).into_owned()));
                }
                Err(e) => {
                    error!(
                        uri = %request.uri,
                        subcmd = req.subcmd,
                        uid = %req.uid,
                        attempt,
                        attempts,
                        error = %e,
                        "backend publish failed"
                    );
                }
            }
        }

        Ok(req.reply_with_cmd(Cmd::Err))
    }
}

impl std::fmt::Debug for PublishRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishRouter")
            .field("targets", &self.targets.len())
            .finish()
    }
}

/// Build the backend call for a PUB against `target` at `addr`
pub fn build_request(
    target: &PubTarget,
    addr: &str,
    req: &Message,
) -> Result<BackendRequest, PublishError> {
    let cmd = req.cmd.code().to_string();
    let subcmd = req.subcmd.to_string();
    let body = query_escape(&req.body);
    let args = [
        cmd.as_str(),
        subcmd.as_str(),
        req.uid.as_str(),
        req.sid.as_str(),
        req.rid.as_str(),
        body.as_str(),
    ];
    let params = parse_query(&format_params(&target.params, &args));

    let mut headers = BTreeMap::new();
    if !target.host.is_empty() {
        headers.insert("Host".to_string(), target.host.clone());
    }
    if !req.ext.is_empty() {
        let ext: Option<ClientExt> =
            serde_json::from_str(&req.ext).map_err(PublishError::MalformedExt)?;
        if let Some(cookie) = ext.and_then(|ext| ext.cookie) {
            headers.insert("Cookie".to_string(), cookie);
        }
    }

    Ok(BackendRequest {
        method: target.method,
        uri: format!("http://{}/{}", addr, target.cgi.trim_start_matches('/')),
        timeout: target.timeout,
        headers,
        params,
    })
}

/// Fill `%s` / `%v` placeholders in order; `%%` is a literal percent.
/// Placeholders beyond the supplied arguments render empty.
pub fn format_params(template: &str, args: &[&str]) -> String {
    let mut out = String::with_capacity(template.len() + args.iter().map(|a| a.len()).sum::<usize>());
    let mut args = args.iter();
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') | Some('v') => out.push_str(args.next().copied().unwrap_or_default()),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Parse a query string into a flat map; the first value for a key wins
pub fn parse_query(query: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    params
}

/// Escape a value for use inside a query string
pub fn query_escape(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Reasons a PUB is dropped without a reply
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("no publish target for subcmd {0}")]
    NoTarget(u8),
    #[error("address resolution failed: {0:#}")]
    Resolve(anyhow::Error),
    #[error("invalid ext payload: {0}")]
    MalformedExt(#[source] serde_json::Error),
}
