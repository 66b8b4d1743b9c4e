use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use wreq::Client;

pub type Headers = Vec<(String, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Reset,
    Other,
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

/// Failure before any response byte arrived.
#[derive(Debug, Clone)]
pub enum SendError {
    /// No first byte within the upstream's TTFT deadline.
    TtftTimeout,
    Transport(TransportError),
}

/// Mid-stream fault surfaced through the body channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFault {
    /// Idle gap between chunks exceeded the upstream timeout.
    IdleTimeout,
    Transport,
}

#[derive(Debug)]
pub enum OutboundBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Result<Bytes, StreamFault>>),
}

#[derive(Debug)]
pub struct OutboundResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: OutboundBody,
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub want_stream: bool,
    /// TTFT deadline; also bounds the buffered body read.
    pub timeout: Duration,
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: OutboundRequest,
    ) -> Pin<Box<dyn Future<Output = Result<OutboundResponse, SendError>> + Send + 'a>>;
}

#[derive(Clone)]
pub struct WreqUpstreamClient {
    client: Client,
}

impl WreqUpstreamClient {
    pub fn new(connect_timeout: Duration) -> Result<Self, wreq::Error> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { client })
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: OutboundRequest,
    ) -> Pin<Box<dyn Future<Output = Result<OutboundResponse, SendError>> + Send + 'a>> {
        Box::pin(async move {
            let mut builder = self.client.request(to_wreq_method(&req.method), &req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = req.body.clone() {
                builder = builder.body(body);
            }

            // The deadline covers everything up to response headers; that is
            // the first byte for our purposes.
            let sent = tokio::time::timeout(req.timeout, builder.send()).await;
            let resp = match sent {
                Ok(Ok(resp)) => resp,
                Ok(Err(err)) => return Err(map_wreq_error(err)),
                Err(_) => return Err(SendError::TtftTimeout),
            };

            let status = resp.status().as_u16();
            let headers = headers_from_wreq(resp.headers());
            let stream_body = req.want_stream && (200..300).contains(&status);

            if !stream_body {
                let body = tokio::time::timeout(req.timeout, resp.bytes())
                    .await
                    .map_err(|_| SendError::TtftTimeout)?
                    .map_err(map_wreq_error)?;
                return Ok(OutboundResponse {
                    status,
                    headers,
                    body: OutboundBody::Bytes(body),
                });
            }

            // Streamed body: pump chunks, bounding the idle gap between
            // chunks by the upstream timeout. Faults travel in-band so the
            // tee can emit the stream-error frame.
            let idle_timeout = req.timeout;
            let (tx, rx) = mpsc::channel::<Result<Bytes, StreamFault>>(16);
            tokio::spawn(async move {
                let mut stream = resp.bytes_stream();
                loop {
                    let next = tokio::time::timeout(idle_timeout, stream.next()).await;
                    let item = match next {
                        Ok(item) => item,
                        Err(_) => {
                            let _ = tx.send(Err(StreamFault::IdleTimeout)).await;
                            break;
                        }
                    };
                    let Some(item) = item else {
                        break;
                    };
                    match item {
                        Ok(chunk) => {
                            if tx.send(Ok(chunk)).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => {
                            let _ = tx.send(Err(StreamFault::Transport)).await;
                            break;
                        }
                    }
                }
            });

            Ok(OutboundResponse {
                status,
                headers,
                body: OutboundBody::Stream(rx),
            })
        })
    }
}

fn to_wreq_method(method: &http::Method) -> wreq::Method {
    match *method {
        http::Method::GET => wreq::Method::GET,
        http::Method::POST => wreq::Method::POST,
        http::Method::PUT => wreq::Method::PUT,
        http::Method::PATCH => wreq::Method::PATCH,
        http::Method::DELETE => wreq::Method::DELETE,
        http::Method::HEAD => wreq::Method::HEAD,
        _ => wreq::Method::POST,
    }
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}

fn map_wreq_error(err: wreq::Error) -> SendError {
    if err.is_timeout() {
        return SendError::TtftTimeout;
    }
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    let kind = if err.is_connect() {
        if lowered.contains("dns") || lowered.contains("resolve") {
            TransportErrorKind::Dns
        } else if lowered.contains("tls") || lowered.contains("ssl") {
            TransportErrorKind::Tls
        } else {
            TransportErrorKind::Connect
        }
    } else if err.is_connection_reset() {
        TransportErrorKind::Reset
    } else if lowered.contains("tls") || lowered.contains("ssl") {
        TransportErrorKind::Tls
    } else {
        TransportErrorKind::Other
    };
    SendError::Transport(TransportError { kind, message })
}
