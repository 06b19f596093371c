//! Scripted in-memory transport for exercising the fetcher and round loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::StatusCode;

use crate::error::{DownloadError, TransportError};
use crate::transport::{Transport, TransportFactory, TransportResponse};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Body {
        status: u16,
        data: Vec<u8>,
        sized: bool,
    },
    Status(u16),
    Fail(TransportError),
    BrokenBody(Vec<u8>, TransportError),
    /// Headers arrive, the body never does.
    HangBody,
    /// Part of the body arrives, then nothing more.
    Stall(Vec<u8>),
}

impl Reply {
    pub(crate) fn ok(data: &[u8]) -> Self {
        Reply::Body {
            status: 200,
            data: data.to_vec(),
            sized: true,
        }
    }

    pub(crate) fn ok_unsized(data: &[u8]) -> Self {
        Reply::Body {
            status: 200,
            data: data.to_vec(),
            sized: false,
        }
    }

    pub(crate) fn status_with_body(status: u16, data: &[u8]) -> Self {
        Reply::Body {
            status,
            data: data.to_vec(),
            sized: true,
        }
    }

    pub(crate) fn broken_body(data: &[u8], err: TransportError) -> Self {
        Reply::BrokenBody(data.to_vec(), err)
    }
}

/// Replies are consumed in order per URL; the last one repeats forever.
/// Unscripted URLs answer 404.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn script(&self, url: &str, replies: impl IntoIterator<Item = Reply>) {
        self.scripts
            .lock()
            .insert(url.to_string(), replies.into_iter().collect());
    }

    pub(crate) fn hits(&self, url: &str) -> usize {
        self.hits.lock().get(url).copied().unwrap_or(0)
    }

    fn next_reply(&self, url: &str) -> Reply {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Reply::Status(404)),
            Some(queue) => queue.front().cloned().unwrap_or(Reply::Status(404)),
            None => Reply::Status(404),
        }
    }
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
        *self.hits.lock().entry(url.to_string()).or_default() += 1;

        let response = match self.next_reply(url) {
            Reply::Body {
                status: code,
                data,
                sized,
            } => TransportResponse {
                status: status(code),
                content_length: sized.then_some(data.len() as u64),
                body: futures::stream::iter([Ok(Bytes::from(data))]).boxed(),
            },
            Reply::Status(code) => TransportResponse {
                status: status(code),
                content_length: Some(0),
                body: futures::stream::empty().boxed(),
            },
            Reply::Fail(err) => return Err(err),
            Reply::BrokenBody(data, err) => TransportResponse {
                status: StatusCode::OK,
                content_length: None,
                body: futures::stream::iter([Ok(Bytes::from(data)), Err(err)]).boxed(),
            },
            Reply::HangBody => TransportResponse {
                status: StatusCode::OK,
                content_length: None,
                body: futures::stream::pending().boxed(),
            },
            Reply::Stall(data) => TransportResponse {
                status: StatusCode::OK,
                content_length: None,
                body: futures::stream::iter([Ok(Bytes::from(data))])
                    .chain(futures::stream::pending())
                    .boxed(),
            },
        };
        Ok(response)
    }
}

/// Hands out the same scripted transport every round and counts the opens.
pub(crate) struct ScriptedFactory {
    pub(crate) transport: Arc<ScriptedTransport>,
    pub(crate) opened: AtomicUsize,
}

impl ScriptedFactory {
    pub(crate) fn new(transport: Arc<ScriptedTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            opened: AtomicUsize::new(0),
        })
    }

    pub(crate) fn rounds(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}

impl TransportFactory for ScriptedFactory {
    fn open(&self) -> Result<Arc<dyn Transport>, DownloadError> {
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(self.transport.clone())
    }
}
