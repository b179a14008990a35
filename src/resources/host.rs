//! Host collaborators used by the loader.
//!
//! The [`Document`] is a headless registry of the `<link>`, `<style>` and
//! `<script>` nodes inserted into a page head. [`Network`] performs the actual
//! I/O; [`HttpNetwork`] talks HTTP (and reads local paths), [`MemoryNetwork`]
//! serves canned bodies and counts requests. A [`StylesheetCompiler`] turns
//! compiled-stylesheet sources into plain CSS.

use super::LoadError;
use crate::utils::lock;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Identifier of a node inserted into the [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTag {
    Link,
    Style,
    Script,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeadNode {
    pub id: NodeId,
    pub tag: NodeTag,
    pub attributes: BTreeMap<String, String>,
    pub text: String,
}

#[derive(Debug, Default)]
struct DocumentState {
    nodes: Vec<HeadNode>,
    next_id: u64,
}

/// Headless page head shared by every loader that renders into the same page.
#[derive(Debug, Clone, Default)]
pub struct Document {
    state: Arc<Mutex<DocumentState>>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node at the end of the head, or at its start when `prepend`
    pub fn insert(&self, tag: NodeTag, attributes: BTreeMap<String, String>, text: String, prepend: bool) -> NodeId {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let node = HeadNode {
            id: NodeId(state.next_id),
            tag,
            attributes,
            text,
        };
        let id = node.id;
        if prepend {
            state.nodes.insert(0, node);
        } else {
            state.nodes.push(node);
        }
        id
    }

    pub fn set_text(&self, id: NodeId, text: &str) {
        let mut state = lock(&self.state);
        if let Some(node) = state.nodes.iter_mut().find(|node| node.id == id) {
            node.text = text.to_string();
        }
    }

    pub fn get(&self, id: NodeId) -> Option<HeadNode> {
        lock(&self.state).nodes.iter().find(|node| node.id == id).cloned()
    }

    /// Find a stylesheet link by its href
    pub fn find_link(&self, href: &str) -> Option<HeadNode> {
        lock(&self.state)
            .nodes
            .iter()
            .find(|node| node.tag == NodeTag::Link && node.attributes.get("href").map(String::as_str) == Some(href))
            .cloned()
    }

    pub fn remove(&self, id: NodeId) -> bool {
        let mut state = lock(&self.state);
        let before = state.nodes.len();
        state.nodes.retain(|node| node.id != id);
        state.nodes.len() != before
    }

    /// Snapshot of the head, in document order
    pub fn nodes(&self) -> Vec<HeadNode> {
        lock(&self.state).nodes.clone()
    }

    pub fn count(&self, tag: NodeTag) -> usize {
        lock(&self.state).nodes.iter().filter(|node| node.tag == tag).count()
    }
}

/// Request options for a network fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchInit {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl Default for FetchInit {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

/// Response of a network fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub locator: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl FetchResponse {
    pub fn ok(locator: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            status: 200,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn non-2xx responses into a network error
    pub fn error_for_status(self) -> Result<Self, LoadError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(LoadError::Network {
                locator: self.locator,
                message: format!("HTTP status {}", self.status),
            })
        }
    }

    pub fn json(&self) -> Result<Value, LoadError> {
        serde_json::from_str(&self.body).map_err(|e| LoadError::Parse {
            locator: self.locator.clone(),
            message: e.to_string(),
        })
    }
}

/// Performs the physical I/O behind every load strategy.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, locator: &str, init: &FetchInit) -> Result<FetchResponse, LoadError>;
}

/// Compiles stylesheet sources (LESS and the like) into plain CSS.
#[async_trait]
pub trait StylesheetCompiler: Send + Sync {
    /// Locator of a script that must be loaded before the first compilation
    fn script(&self) -> Option<String> {
        None
    }

    async fn compile(&self, source: &str, args: &Map<String, Value>) -> Result<String, LoadError>;
}

#[derive(Debug, Clone)]
enum Canned {
    Body(u16, String),
    Failure(String),
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, Canned>,
    requests: HashMap<String, usize>,
}

/// In-memory network serving canned responses.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<MemoryState>>,
    latency: Duration,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with(self, locator: impl Into<String>, body: impl Into<String>) -> Self {
        self.insert(locator, body);
        self
    }

    pub fn insert(&self, locator: impl Into<String>, body: impl Into<String>) {
        lock(&self.state)
            .entries
            .insert(locator.into(), Canned::Body(200, body.into()));
    }

    pub fn insert_status(&self, locator: impl Into<String>, status: u16, body: impl Into<String>) {
        lock(&self.state)
            .entries
            .insert(locator.into(), Canned::Body(status, body.into()));
    }

    /// Make every request for `locator` fail at the transport level
    pub fn fail(&self, locator: impl Into<String>, message: impl Into<String>) {
        lock(&self.state)
            .entries
            .insert(locator.into(), Canned::Failure(message.into()));
    }

    /// Number of requests issued for `locator`
    pub fn requests(&self, locator: &str) -> usize {
        lock(&self.state).requests.get(locator).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        lock(&self.state).requests.values().sum()
    }
}

#[async_trait]
impl Network for MemoryNetwork {
    async fn fetch(&self, locator: &str, _init: &FetchInit) -> Result<FetchResponse, LoadError> {
        let canned = {
            let mut state = lock(&self.state);
            *state.requests.entry(locator.to_string()).or_insert(0) += 1;
            state.entries.get(locator).cloned()
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match canned {
            Some(Canned::Body(status, body)) => Ok(FetchResponse {
                locator: locator.to_string(),
                status,
                headers: BTreeMap::new(),
                body,
            }),
            Some(Canned::Failure(message)) => Err(LoadError::Network {
                locator: locator.to_string(),
                message,
            }),
            None => Ok(FetchResponse {
                locator: locator.to_string(),
                status: 404,
                headers: BTreeMap::new(),
                body: String::new(),
            }),
        }
    }
}

/// Network backed by `reqwest` for http(s) locators and the filesystem otherwise.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    pub fn new(user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self { client })
    }

    async fn fetch_http(&self, locator: &str, init: &FetchInit) -> Result<FetchResponse, LoadError> {
        let network_error = |message: String| LoadError::Network {
            locator: locator.to_string(),
            message,
        };

        let method = reqwest::Method::from_bytes(init.method.as_bytes()).map_err(|e| network_error(e.to_string()))?;
        let mut request = self.client.request(method, locator);
        for (key, value) in &init.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &init.body {
            request = request.body(body.clone());
        }

        let response = request.send().await.map_err(|e| network_error(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(key, value)| value.to_str().ok().map(|value| (key.to_string(), value.to_string())))
            .collect();
        let body = response.text().await.map_err(|e| network_error(e.to_string()))?;

        Ok(FetchResponse {
            locator: locator.to_string(),
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, locator: &str, init: &FetchInit) -> Result<FetchResponse, LoadError> {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            return self.fetch_http(locator, init).await;
        }

        let path = locator.strip_prefix("file://").unwrap_or(locator);
        let body = tokio::fs::read_to_string(path).await.map_err(|e| LoadError::Network {
            locator: locator.to_string(),
            message: e.to_string(),
        })?;
        Ok(FetchResponse::ok(locator, body))
    }
}
