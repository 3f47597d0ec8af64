//! Scripted [`Network`] double for unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};

use crate::fetch::{FetchResponse, Network, ResourceRequest};
use offgrid_core::Error;

#[derive(Clone)]
enum Script {
    Respond { status: StatusCode, body: Bytes, content_type: Option<String>, etag: Option<String> },
    Fail(String),
    Hang,
    Redirect(String),
}

/// Answers requests from a per-URL script; unknown URLs fail like a dead host.
#[derive(Default)]
pub(crate) struct ScriptedNetwork {
    routes: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<(Method, String, HeaderMap)>>,
    offline: AtomicBool,
}

impl ScriptedNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn set(self, url: &str, script: Script) -> Self {
        self.routes.lock().unwrap().insert(url.to_string(), script);
        self
    }

    pub(crate) fn ok(self, url: &str, body: &'static str, content_type: &str) -> Self {
        self.respond(url, StatusCode::OK, body, content_type)
    }

    pub(crate) fn respond(self, url: &str, status: StatusCode, body: &'static str, content_type: &str) -> Self {
        self.set(
            url,
            Script::Respond {
                status,
                body: Bytes::from_static(body.as_bytes()),
                content_type: Some(content_type.to_string()),
                etag: None,
            },
        )
    }

    pub(crate) fn ok_with_etag(self, url: &str, body: &'static str, content_type: &str, etag: &str) -> Self {
        self.set(
            url,
            Script::Respond {
                status: StatusCode::OK,
                body: Bytes::from_static(body.as_bytes()),
                content_type: Some(content_type.to_string()),
                etag: Some(etag.to_string()),
            },
        )
    }

    pub(crate) fn fail(self, url: &str) -> Self {
        self.set(url, Script::Fail("connection refused".to_string()))
    }

    pub(crate) fn hang(self, url: &str) -> Self {
        self.set(url, Script::Hang)
    }

    /// Answer `url` with whatever `target` answers, reporting `target` as the final URL.
    pub(crate) fn redirect(self, url: &str, target: &str) -> Self {
        self.set(url, Script::Redirect(target.to_string()))
    }

    /// Replace the script for `url` on a shared network.
    pub(crate) fn replace(&self, url: &str, body: &'static str, content_type: &str) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Script::Respond {
                status: StatusCode::OK,
                body: Bytes::from_static(body.as_bytes()),
                content_type: Some(content_type.to_string()),
                etag: None,
            },
        );
    }

    /// Make every request fail until switched back.
    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<(Method, String)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(m, u, _)| (m.clone(), u.clone()))
            .collect()
    }

    pub(crate) fn last_headers(&self, url: &str) -> Option<HeaderMap> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, u, _)| u == url)
            .map(|(_, _, h)| h.clone())
    }
}

#[async_trait]
impl Network for ScriptedNetwork {
    async fn fetch(&self, request: &ResourceRequest) -> Result<FetchResponse, Error> {
        let url = request.url.to_string();
        self.calls
            .lock()
            .unwrap()
            .push((request.method.clone(), url.clone(), request.headers.clone()));

        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::NetworkFailure(format!("{url}: offline")));
        }

        let mut final_url = request.url.clone();
        let mut script = self.routes.lock().unwrap().get(&url).cloned();
        if let Some(Script::Redirect(target)) = &script {
            final_url = url::Url::parse(target).unwrap();
            script = self.routes.lock().unwrap().get(target).cloned();
        }
        match script {
            Some(Script::Respond { status, body, content_type, etag }) => {
                let mut headers = HeaderMap::new();
                if let Some(ct) = &content_type {
                    headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(ct).unwrap());
                }
                if let Some(tag) = &etag {
                    headers.insert(header::ETAG, HeaderValue::from_str(tag).unwrap());
                    let matches = request
                        .headers
                        .get(header::IF_NONE_MATCH)
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v == tag);
                    if matches {
                        return Ok(FetchResponse {
                            url: request.url.clone(),
                            final_url: final_url.clone(),
                            status: StatusCode::NOT_MODIFIED,
                            content_type,
                            bytes: Bytes::new(),
                            headers,
                            fetch_ms: 1,
                        });
                    }
                }
                Ok(FetchResponse {
                    url: request.url.clone(),
                    final_url: final_url.clone(),
                    status,
                    content_type,
                    bytes: body,
                    headers,
                    fetch_ms: 1,
                })
            }
            Some(Script::Fail(reason)) => Err(Error::NetworkFailure(format!("{url}: {reason}"))),
            Some(Script::Hang) => std::future::pending().await,
            Some(Script::Redirect(target)) => Err(Error::NetworkFailure(format!("{url}: redirect loop via {target}"))),
            None => Err(Error::NetworkFailure(format!("{url}: no route to host"))),
        }
    }
}
