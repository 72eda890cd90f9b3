//! Scripted transport for exercising jobs and the runtime without a network.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};

#[derive(Debug, Clone)]
pub enum Reply {
    Response(HttpResponse),
    Fail(TransportError),
    Hang,
}

impl Reply {
    pub fn json(status: u16, value: Value) -> Self {
        Self::Response(HttpResponse::json(status, &value))
    }

    pub fn raw(status: u16, body: &str) -> Self {
        Self::Response(HttpResponse::new(status, body))
    }
}

/// Replies are consumed in order from the first entry whose fragment occurs
/// in the request path. Unmatched requests never complete.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<(String, Reply)>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, fragment: &str, reply: Reply) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back((fragment.to_owned(), reply));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn requests_to(&self, fragment: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.url.path().contains(fragment))
            .collect()
    }

    /// Poll until at least `count` requests matching `fragment` were made.
    pub async fn wait_for_requests(&self, fragment: &str, count: usize) -> Vec<HttpRequest> {
        let poll = async {
            loop {
                let seen = self.requests_to(fragment);
                if seen.len() >= count {
                    return seen;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), poll)
            .await
            .unwrap_or_else(|_| panic!("expected {count} request(s) to '{fragment}'"))
    }

    fn next_reply(&self, path: &str) -> Reply {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        match script.iter().position(|(fragment, _)| path.contains(fragment.as_str())) {
            Some(index) => script
                .remove(index)
                .map(|(_, reply)| reply)
                .unwrap_or(Reply::Hang),
            None => Reply::Hang,
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let reply = self.next_reply(request.url.path());
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        match reply {
            Reply::Response(response) => Ok(response),
            Reply::Fail(err) => Err(err),
            Reply::Hang => std::future::pending().await,
        }
    }
}
