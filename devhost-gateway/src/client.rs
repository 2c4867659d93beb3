use bytes::Bytes;
use devhost_core::{DevhostError, Settings};
use futures_util::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Pool success rate below which the gateway reports itself degraded.
pub const HEALTHY_SUCCESS_RATE: f64 = 0.95;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// One shared outbound client for all upstream dispatch.
///
/// reqwest keeps the keepalive pool; the semaphore enforces the hard
/// connection cap. Retries apply to connect errors and 502/503/504
/// responses, and only while the request is still cloneable — a request
/// whose body has started streaming gets exactly one attempt.
pub struct UpstreamClient {
    http: reqwest::Client,
    limiter: Arc<Semaphore>,
    capacity: usize,
    max_retries: u32,
    retry_spacing: Duration,
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug)]
pub enum DispatchError {
    Timeout,
    Upstream(String),
}

impl From<DispatchError> for DevhostError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Timeout => DevhostError::Timeout,
            DispatchError::Upstream(msg) => DevhostError::Upstream(msg),
        }
    }
}

/// A dispatched upstream response plus the pool slot it occupies. The slot
/// is released when the body stream is dropped or fully consumed.
#[derive(Debug)]
pub struct Dispatched {
    pub response: reqwest::Response,
    permit: OwnedSemaphorePermit,
}

impl Dispatched {
    pub fn into_body_stream(self) -> BodyStream {
        BodyStream {
            inner: Box::pin(self.response.bytes_stream()),
            _permit: self.permit,
        }
    }
}

/// Response body stream that holds its pool permit until dropped.
pub struct BodyStream {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    _permit: OwnedSemaphorePermit,
}

impl Stream for BodyStream {
    type Item = reqwest::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[derive(Debug, Serialize)]
pub struct PoolStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub success_rate: f64,
    pub healthy: bool,
    pub in_use: usize,
    pub capacity: usize,
}

impl UpstreamClient {
    pub fn new(settings: &Settings) -> Result<Self, DevhostError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(settings.keepalive_connections)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(!settings.verify_certs)
            .build()
            .map_err(|e| DevhostError::Config(format!("upstream client: {e}")))?;

        let capacity = settings.max_connections.max(1);
        Ok(Self {
            http,
            limiter: Arc::new(Semaphore::new(capacity)),
            capacity,
            max_retries: settings.max_retries,
            retry_spacing: settings.retry_spacing(),
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        })
    }

    pub fn request(&self, method: http::Method, url: &str) -> reqwest::RequestBuilder {
        self.http.request(method, url)
    }

    /// Send `request` with retries inside the remaining deadline.
    pub async fn dispatch(
        &self,
        request: reqwest::Request,
        deadline: Instant,
    ) -> Result<Dispatched, DispatchError> {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
            return Err(DispatchError::Timeout);
        };
        let permit = match tokio::time::timeout(
            remaining,
            Arc::clone(&self.limiter).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DispatchError::Upstream("connection pool closed".into())),
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(DispatchError::Timeout);
            }
        };

        // `try_clone` fails exactly when the body is a stream, which is the
        // case where a retry could resend already-forwarded bytes.
        let template = request.try_clone();
        let mut attempt_req = request;
        let mut attempt: u32 = 0;

        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(DispatchError::Timeout);
            };
            *attempt_req.timeout_mut() = Some(remaining);
            self.requests.fetch_add(1, Ordering::Relaxed);

            match self.http.execute(attempt_req).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let retryable_status = matches!(status, 502 | 503 | 504);
                    if !retryable_status {
                        self.successes.fetch_add(1, Ordering::Relaxed);
                        return Ok(Dispatched { response, permit });
                    }

                    self.failures.fetch_add(1, Ordering::Relaxed);
                    let next = template.as_ref().and_then(|t| t.try_clone());
                    match next {
                        Some(clone) if attempt < self.max_retries => {
                            debug!(status, attempt, "Retrying upstream status");
                            self.retries.fetch_add(1, Ordering::Relaxed);
                            self.backoff(attempt, deadline).await;
                            attempt += 1;
                            attempt_req = clone;
                        }
                        // Out of retries (or unrepeatable body): the
                        // upstream's own response goes back to the client.
                        _ => return Ok(Dispatched { response, permit }),
                    }
                }
                Err(e) if e.is_timeout() => {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(DispatchError::Timeout);
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    let next = template.as_ref().and_then(|t| t.try_clone());
                    match next {
                        Some(clone) if attempt < self.max_retries => {
                            debug!(error = %e, attempt, "Retrying upstream error");
                            self.retries.fetch_add(1, Ordering::Relaxed);
                            self.backoff(attempt, deadline).await;
                            attempt += 1;
                            attempt_req = clone;
                        }
                        _ => {
                            warn!(error = %e, "Upstream dispatch failed");
                            return Err(DispatchError::Upstream(e.to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Exponential-ish spacing: `retry_delay * 2^attempt`, clamped to the
    /// remaining deadline.
    async fn backoff(&self, attempt: u32, deadline: Instant) {
        let delay = self.retry_spacing * 2u32.saturating_pow(attempt);
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or_default();
        tokio::time::sleep(delay.min(remaining)).await;
    }

    pub fn stats(&self) -> PoolStats {
        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let attempts = successes + failures;
        let success_rate = if attempts == 0 {
            1.0
        } else {
            successes as f64 / attempts as f64
        };
        PoolStats {
            requests: self.requests.load(Ordering::Relaxed),
            successes,
            failures,
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            success_rate,
            healthy: success_rate >= HEALTHY_SUCCESS_RATE,
            in_use: self.capacity - self.limiter.available_permits(),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_settings() -> Settings {
        let mut s = Settings::default();
        s.retry_delay = 0.01;
        s
    }

    /// Serve canned HTTP/1.1 responses, one connection per response.
    async fn canned_server(responses: Vec<&'static str>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for body in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                stream.write_all(body.as_bytes()).await.unwrap();
                let _ = stream.shutdown().await;
            }
        });
        addr
    }

    #[test]
    fn initial_stats_are_healthy() {
        let client = UpstreamClient::new(&test_settings()).unwrap();
        let stats = client.stats();
        assert_eq!(stats.requests, 0);
        assert_eq!(stats.success_rate, 1.0);
        assert!(stats.healthy);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.capacity, 100);
    }

    #[tokio::test]
    async fn retries_on_502_then_succeeds() {
        let addr = canned_server(vec![
            "HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
            "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
        ])
        .await;

        let client = UpstreamClient::new(&test_settings()).unwrap();
        let req = client
            .request(http::Method::GET, &format!("http://{addr}/"))
            .build()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        let dispatched = client.dispatch(req, deadline).await.unwrap();
        assert_eq!(dispatched.response.status(), 200);

        let stats = client.stats();
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_upstream_response() {
        let addr = canned_server(vec![
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
            4
        ])
        .await;

        let mut settings = test_settings();
        settings.max_retries = 3;
        let client = UpstreamClient::new(&settings).unwrap();
        let req = client
            .request(http::Method::GET, &format!("http://{addr}/"))
            .build()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        let dispatched = client.dispatch(req, deadline).await.unwrap();
        assert_eq!(dispatched.response.status(), 503);
        assert_eq!(client.stats().retries, 3);
    }

    #[tokio::test]
    async fn streaming_body_gets_a_single_attempt() {
        let addr = canned_server(vec![
            "HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        ])
        .await;

        let client = UpstreamClient::new(&test_settings()).unwrap();
        let stream = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(
            Bytes::from_static(b"chunk"),
        )]);
        let req = client
            .request(http::Method::POST, &format!("http://{addr}/"))
            .body(reqwest::Body::wrap_stream(stream))
            .build()
            .unwrap();
        assert!(req.try_clone().is_none(), "streaming body must not clone");

        let deadline = Instant::now() + Duration::from_secs(10);
        let dispatched = client.dispatch(req, deadline).await.unwrap();
        assert_eq!(dispatched.response.status(), 502);
        assert_eq!(client.stats().retries, 0, "no silent retry after streaming");
    }

    #[tokio::test]
    async fn expired_deadline_is_a_timeout() {
        let client = UpstreamClient::new(&test_settings()).unwrap();
        let req = client
            .request(http::Method::GET, "http://127.0.0.1:1/")
            .build()
            .unwrap();
        let deadline = Instant::now() - Duration::from_secs(1);
        match client.dispatch(req, deadline).await {
            Err(DispatchError::Timeout) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_error_counts_failures() {
        let mut settings = test_settings();
        settings.max_retries = 1;
        let client = UpstreamClient::new(&settings).unwrap();
        // Port 1 on loopback: immediate connection refused
        let req = client
            .request(http::Method::GET, "http://127.0.0.1:1/")
            .build()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        match client.dispatch(req, deadline).await {
            Err(DispatchError::Upstream(_)) => {}
            other => panic!("expected Upstream error, got {other:?}"),
        }
        let stats = client.stats();
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.retries, 1);
        assert!(!stats.healthy);
    }
}
