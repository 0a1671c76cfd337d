//! In-process stand-in for the Civitai API and download endpoint.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the download endpoint serves one file.
#[derive(Debug, Clone)]
pub enum Serve {
    /// Honour `Range` requests.
    Normal,
    /// Always send the whole file with 200.
    IgnoreRange,
    /// Dribble `chunk` bytes every `every`.
    Throttled { chunk: usize, every: Duration },
    /// Reply with this status and no body.
    Status(u16),
    /// Refuse HEAD with 403 but serve GET like `Normal`.
    HeadForbidden,
    /// Honour `Range` but claim this total in `Content-Range`.
    RangeTotal(usize),
    /// Stream the body with no `Content-Length`.
    Unsized,
}

#[derive(Default)]
struct Inner {
    versions: HashMap<u64, Value>,
    models: HashMap<u64, Value>,
    by_hash: HashMap<String, Value>,
    hash_status: HashMap<String, u16>,
    files: HashMap<String, (Vec<u8>, Serve)>,
    range_log: Vec<Option<String>>,
    hash_log: Vec<String>,
    auth_log: Vec<Option<String>>,
}

#[derive(Clone, Default)]
pub struct FakeCivitai {
    inner: Arc<Mutex<Inner>>,
}

pub struct Running {
    pub addr: SocketAddr,
    pub fake: FakeCivitai,
}

impl Running {
    pub fn api_base(&self) -> String {
        format!("http://{}/api/v1", self.addr)
    }

    pub fn file_url(&self, name: &str) -> String {
        format!("http://{}/files/{}", self.addr, name)
    }
}

impl FakeCivitai {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self, id: u64, body: Value) -> &Self {
        self.inner.lock().unwrap().versions.insert(id, body);
        self
    }

    pub fn model(&self, id: u64, body: Value) -> &Self {
        self.inner.lock().unwrap().models.insert(id, body);
        self
    }

    pub fn hash(&self, sha256: &str, body: Value) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .by_hash
            .insert(sha256.to_string(), body);
        self
    }

    pub fn hash_status(&self, sha256: &str, status: u16) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .hash_status
            .insert(sha256.to_string(), status);
        self
    }

    pub fn file(&self, name: &str, content: Vec<u8>, serve: Serve) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .files
            .insert(name.to_string(), (content, serve));
        self
    }

    /// `Range` headers seen by GET requests to the download endpoint.
    pub fn range_log(&self) -> Vec<Option<String>> {
        self.inner.lock().unwrap().range_log.clone()
    }

    pub fn hash_log(&self) -> Vec<String> {
        self.inner.lock().unwrap().hash_log.clone()
    }

    pub fn auth_log(&self) -> Vec<Option<String>> {
        self.inner.lock().unwrap().auth_log.clone()
    }

    pub async fn start(self) -> Running {
        let app = Router::new()
            .route("/api/v1/models/:id", get(get_model))
            .route("/api/v1/model-versions/*rest", get(get_version))
            .route("/files/:name", get(get_file))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Running { addr, fake: self }
    }
}

fn auth(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn get_model(
    State(fake): State<FakeCivitai>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Response {
    let mut inner = fake.inner.lock().unwrap();
    inner.auth_log.push(auth(&headers));
    match inner.models.get(&id) {
        Some(body) => Json(body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_version(
    State(fake): State<FakeCivitai>,
    Path(rest): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mut inner = fake.inner.lock().unwrap();
    inner.auth_log.push(auth(&headers));

    if let Some(sha) = rest.strip_prefix("by-hash/") {
        inner.hash_log.push(sha.to_string());
        if let Some(status) = inner.hash_status.get(sha) {
            return StatusCode::from_u16(*status).unwrap().into_response();
        }
        return match inner.by_hash.get(sha) {
            Some(body) => Json(body.clone()).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }

    match rest.parse::<u64>().ok().and_then(|id| inner.versions.get(&id)) {
        Some(body) => Json(body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_file(
    State(fake): State<FakeCivitai>,
    Path(name): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (content, serve) = {
        let mut inner = fake.inner.lock().unwrap();
        inner.auth_log.push(auth(&headers));
        if method == Method::GET {
            inner.range_log.push(range.clone());
        }
        match inner.files.get(&name) {
            Some(entry) => entry.clone(),
            None => return StatusCode::NOT_FOUND.into_response(),
        }
    };
    let total = content.len();

    match serve {
        Serve::Status(status) => StatusCode::from_u16(status).unwrap().into_response(),
        Serve::HeadForbidden if method == Method::HEAD => StatusCode::FORBIDDEN.into_response(),
        Serve::Unsized => {
            let chunks: Vec<Result<Bytes, std::io::Error>> = content
                .chunks(256)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Response::new(Body::from_stream(stream::iter(chunks)))
        }
        Serve::Throttled { chunk, every } => {
            let chunks: Vec<Bytes> = content
                .chunks(chunk.max(1))
                .map(Bytes::copy_from_slice)
                .collect();
            let body = stream::unfold(chunks.into_iter(), move |mut rest| async move {
                let next = rest.next()?;
                tokio::time::sleep(every).await;
                Some((Ok::<_, std::io::Error>(next), rest))
            });
            let mut response = Response::new(Body::from_stream(body));
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(total));
            response
        }
        Serve::Normal | Serve::IgnoreRange | Serve::HeadForbidden | Serve::RangeTotal(_) => {
            let start = match (&serve, range.as_deref().and_then(parse_range_start)) {
                (Serve::IgnoreRange, _) => None,
                (_, Some(start)) if start < total => Some(start),
                _ => None,
            };
            let claimed = match serve {
                Serve::RangeTotal(claimed) => claimed,
                _ => total,
            };
            match start {
                Some(start) => {
                    let mut response = Response::new(Body::from(content[start..].to_vec()));
                    *response.status_mut() = StatusCode::PARTIAL_CONTENT;
                    let headers = response.headers_mut();
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(total - start));
                    headers.insert(
                        header::CONTENT_RANGE,
                        HeaderValue::from_str(&format!("bytes {}-{}/{}", start, total - 1, claimed))
                            .unwrap(),
                    );
                    response
                }
                None => {
                    let mut response = Response::new(Body::from(content));
                    response
                        .headers_mut()
                        .insert(header::CONTENT_LENGTH, HeaderValue::from(total));
                    response
                }
            }
        }
    }
}

fn parse_range_start(value: &str) -> Option<usize> {
    value
        .strip_prefix("bytes=")?
        .split('-')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
