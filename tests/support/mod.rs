#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use wait0::Service;
use wait0::config;
use wait0::proxy::AppContext;

/// One scripted origin response.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl ScriptedResponse {
    pub fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// A 200 response carrying the dynamic marker this proxy caches.
    pub fn dynamic(body: &str) -> Self {
        Self::new(200, body).with_header("Cache-Control", "no-cache")
    }
}

#[derive(Default)]
struct MockState {
    responses: Mutex<HashMap<String, ScriptedResponse>>,
    hits: Mutex<HashMap<String, usize>>,
    uris: Mutex<Vec<String>>,
}

/// Minimal scriptable HTTP origin, one connection per request.
pub struct MockOrigin {
    addr: SocketAddr,
    state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl MockOrigin {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(MockState::default());

        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(socket, state).await;
                });
            }
        });

        Ok(Self {
            addr,
            state,
            handle,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_response(&self, path: &str, response: ScriptedResponse) {
        self.state
            .responses
            .lock()
            .insert(path.to_string(), response);
    }

    /// Request count for a path, query excluded.
    pub fn hits(&self, path: &str) -> usize {
        self.state.hits.lock().get(path).copied().unwrap_or(0)
    }

    /// Every request target the origin has seen, in order, query included.
    pub fn seen_uris(&self) -> Vec<String> {
        self.state.uris.lock().clone()
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

async fn serve_connection(
    mut socket: tokio::net::TcpStream,
    state: Arc<MockState>,
) -> Result<()> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    if data.is_empty() {
        return Ok(());
    }

    let head = String::from_utf8_lossy(&data);
    let request_line = head.lines().next().unwrap_or_default();
    let uri = request_line.split_whitespace().nth(1).unwrap_or("/");
    let path = uri.split('?').next().unwrap_or("/").to_string();

    state.uris.lock().push(uri.to_string());
    *state.hits.lock().entry(path.clone()).or_insert(0) += 1;

    let response = state
        .responses
        .lock()
        .get(&path)
        .cloned()
        .unwrap_or_else(|| ScriptedResponse::new(404, "not found"));

    let reason = http::StatusCode::from_u16(response.status)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("Status");
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        reason,
        response.body.len()
    );
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");

    socket.write_all(head.as_bytes()).await?;
    socket.write_all(response.body.as_bytes()).await?;
    socket.shutdown().await.ok();
    Ok(())
}

/// A running wait0 service bound to an ephemeral port, with its cache tiers
/// reachable for assertions.
pub struct TestProxy {
    pub base: String,
    service: Option<Service>,
    server: JoinHandle<()>,
    _disk_dir: tempfile::TempDir,
}

impl TestProxy {
    /// `extra_yaml` is appended verbatim to the generated config (rules,
    /// discovery, logging sections).
    pub async fn spawn(origin_url: &str, extra_yaml: &str) -> Result<Self> {
        Self::spawn_with_sizes(origin_url, extra_yaml, "10m", "100m").await
    }

    pub async fn spawn_with_sizes(
        origin_url: &str,
        extra_yaml: &str,
        ram_max: &str,
        disk_max: &str,
    ) -> Result<Self> {
        let disk_dir = tempfile::TempDir::new()?;
        let yaml = format!(
            r#"
storage:
  ram: {{ max: "{ram_max}" }}
  disk: {{ max: "{disk_max}", path: "{}" }}
server:
  origin: "{origin_url}"
{extra_yaml}
"#,
            disk_dir.path().display()
        );
        let config = config::from_yaml(&yaml)?;
        let service = Service::new(config)?;
        let router = service.router();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(Self {
            base: format!("http://{addr}"),
            service: Some(service),
            server,
            _disk_dir: disk_dir,
        })
    }

    pub fn context(&self) -> Arc<AppContext> {
        self.service.as_ref().expect("service running").context()
    }

    pub async fn shutdown(mut self) {
        self.server.abort();
        if let Some(service) = self.service.take() {
            service.shutdown().await;
        }
    }
}

pub struct ClientResponse {
    pub status: u16,
    pub wait0: String,
    pub headers: http::HeaderMap,
    pub body: String,
}

pub async fn get(url: &str) -> Result<ClientResponse> {
    get_with_headers(url, &[]).await
}

pub async fn get_with_headers(url: &str, headers: &[(&str, &str)]) -> Result<ClientResponse> {
    let client = reqwest::Client::new();
    let mut request = client.get(url);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    into_client_response(request.send().await?).await
}

pub async fn post(url: &str) -> Result<ClientResponse> {
    let client = reqwest::Client::new();
    into_client_response(client.post(url).send().await?).await
}

async fn into_client_response(response: reqwest::Response) -> Result<ClientResponse> {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let wait0 = headers
        .get("x-wait0")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = response.text().await?;
    Ok(ClientResponse {
        status,
        wait0,
        headers,
        body,
    })
}

/// Polls until `check` passes; background work in the proxy is asynchronous,
/// so assertions on its effects need a settling loop.
pub async fn wait_for<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub async fn wait_for_async<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
