//! Local servers and mocks shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest_egress_pool::{
    Probe, ProxyCandidate, ProxyProtocol, ProxySource, SourceError, SourceKind, VendorSession,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Serve an axum router on an ephemeral port and return its base URL.
pub async fn serve(router: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// How a raw test server treats one connection.
#[derive(Clone, Copy)]
pub enum Behavior {
    /// Read the request, answer `200 OK` with the given body.
    Respond(&'static str),
    /// Read the request, then close without answering.
    Drop,
    /// Accept and never answer.
    Hang,
}

/// A raw HTTP server. `plan` decides the behavior per connection index;
/// the returned counter tracks accepted connections.
pub async fn raw_server<F>(plan: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(usize) -> Behavior + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((mut stream, _)) = listener.accept().await {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            match plan(n) {
                Behavior::Respond(body) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 4096];
                        let _ = stream.read(&mut buf).await;
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                        let _ = stream.shutdown().await;
                    });
                }
                Behavior::Drop => {
                    let mut buf = vec![0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    drop(stream);
                }
                Behavior::Hang => held.push(stream),
            }
        }
    });

    (addr, connections)
}

/// A source that serves a fixed list and counts registrations.
pub struct FixedSource {
    pub kind: SourceKind,
    pub endpoints: Vec<String>,
    pub registrations: AtomicUsize,
}

impl FixedSource {
    pub fn new(kind: SourceKind, endpoints: &[String]) -> Self {
        Self {
            kind,
            endpoints: endpoints.to_vec(),
            registrations: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProxySource for FixedSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn register(&self) -> Result<VendorSession, SourceError> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(VendorSession::new("fixed-token", None))
    }

    async fn list_candidates(
        &self,
        _session: &VendorSession,
    ) -> Result<Vec<ProxyCandidate>, SourceError> {
        Ok(self
            .endpoints
            .iter()
            .map(|e| ProxyCandidate::endpoint(e.clone(), ProxyProtocol::Http, self.kind))
            .collect())
    }

    async fn acquire_endpoint(
        &self,
        _session: &VendorSession,
        candidate: &ProxyCandidate,
    ) -> Result<Option<String>, SourceError> {
        Ok(candidate.endpoint.clone())
    }
}

/// A probe whose verdicts are set by the test.
#[derive(Default)]
pub struct ScriptedProbe {
    healthy: Mutex<HashSet<String>>,
    pub calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn healthy(endpoints: &[&str]) -> Self {
        let probe = Self::default();
        probe.set(endpoints);
        probe
    }

    pub fn set(&self, endpoints: &[&str]) {
        *self.healthy.lock() = endpoints.iter().map(|e| e.to_string()).collect();
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self, endpoint: &str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.healthy.lock().contains(endpoint)
    }
}
