//! Blocking `reqwest` transport.
//!
//! Every exchange runs on its own thread so the slot's tick never blocks.
//! The thread streams the body in fixed-size reads, publishing progress
//! through an atomic counter and checking a cancel flag between reads; the
//! final result is handed back over a oneshot channel. Every blocking read
//! is bounded, so a cancelled exchange whose server went silent still
//! releases its thread and socket.

use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use reqwest::blocking::Client;
use tokio::sync::oneshot;

use super::{
    ExchangeState, HttpExchange, HttpRequest, HttpResponse, HttpTransport, TransportFailure,
    TIME_LEFT_HEADER,
};
use crate::error::{TransferError, TransferResult};

/// Connect timeout for storage servers.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Longest wait for any single read or write on an exchange.
///
/// Above the slot's 60 s stall watchdog, which reacts first.
const DEFAULT_IO_TIMEOUT_SECS: u64 = 90;

/// Body read granularity.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// [`HttpTransport`] backed by a shared blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> TransferResult<Self> {
        Self::with_timeouts(
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
        )
    }

    /// `io_timeout` bounds each blocking read or write, not the whole body.
    pub fn with_timeouts(connect_timeout: Duration, io_timeout: Duration) -> TransferResult<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(io_timeout)
            .build()
            .map_err(|e| TransferError::Setup(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn spawn_exchange(&self, request: HttpRequest) -> ReqwestExchange {
        let shared = Arc::new(Shared::default());
        let (tx, rx) = oneshot::channel();

        let client = self.client.clone();
        let thread_shared = Arc::clone(&shared);
        let spawned = std::thread::Builder::new()
            .name("cloudraid-http".to_string())
            .spawn(move || {
                let result = run_exchange(&client, request, &thread_shared);
                thread_shared.finished.store(true, Ordering::Release);
                if let Err(e) = &result {
                    tracing::trace!(failure = ?e, "HTTP exchange ended without a response");
                }
                let _ = tx.send(result);
            });

        let result = match spawned {
            Ok(_) => Some(rx),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to spawn HTTP thread");
                None
            }
        };

        ReqwestExchange {
            shared,
            result,
            cancelled: false,
        }
    }
}

impl HttpTransport for ReqwestTransport {
    fn post(&self, request: HttpRequest) -> Box<dyn HttpExchange> {
        Box::new(self.spawn_exchange(request))
    }
}

#[derive(Debug, Default)]
struct Shared {
    transferred: AtomicU64,
    headers: AtomicBool,
    cancel: AtomicBool,
    /// The exchange thread has returned.
    finished: AtomicBool,
}

type ExchangeResult = Result<HttpResponse, TransportFailure>;

fn run_exchange(client: &Client, request: HttpRequest, shared: &Shared) -> ExchangeResult {
    let upload_len = request.body.len() as u64;
    let response = client
        .post(&request.url)
        .body(reqwest::blocking::Body::from(request.body))
        .send()
        .map_err(|e| classify(&e, false))?;

    shared.headers.store(true, Ordering::Release);
    if shared.cancel.load(Ordering::Acquire) {
        return Err(TransportFailure::Connection("cancelled".to_string()));
    }
    if upload_len > 0 {
        shared.transferred.store(upload_len, Ordering::Release);
    }

    let status = response.status().as_u16();
    let headers = response.headers();
    let content_type = headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let time_left = headers
        .get(TIME_LEFT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let expected = response.content_length().unwrap_or(0) as usize;

    let mut body = BytesMut::with_capacity(expected);
    let mut reader = response;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        if shared.cancel.load(Ordering::Acquire) {
            return Err(TransportFailure::Connection("cancelled".to_string()));
        }
        let n = reader.read(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                TransportFailure::Timeout {
                    headers_received: true,
                }
            } else {
                TransportFailure::Connection(e.to_string())
            }
        })?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
        if upload_len == 0 {
            shared.transferred.fetch_add(n as u64, Ordering::AcqRel);
        }
    }

    Ok(HttpResponse {
        status,
        body: body.freeze(),
        content_type,
        time_left,
    })
}

fn classify(error: &reqwest::Error, headers_received: bool) -> TransportFailure {
    if error.is_timeout() {
        TransportFailure::Timeout { headers_received }
    } else {
        TransportFailure::Connection(error.to_string())
    }
}

/// Exchange handle polled by the slot.
struct ReqwestExchange {
    shared: Arc<Shared>,
    result: Option<oneshot::Receiver<ExchangeResult>>,
    cancelled: bool,
}

impl HttpExchange for ReqwestExchange {
    fn poll(&mut self) -> ExchangeState {
        if self.cancelled {
            return ExchangeState::Failed(TransportFailure::Connection("cancelled".to_string()));
        }
        let Some(rx) = self.result.as_mut() else {
            return ExchangeState::Failed(TransportFailure::Connection(
                "exchange not running".to_string(),
            ));
        };
        match rx.try_recv() {
            Ok(Ok(response)) => {
                self.result = None;
                ExchangeState::Complete(response)
            }
            Ok(Err(failure)) => {
                self.result = None;
                ExchangeState::Failed(failure)
            }
            Err(oneshot::error::TryRecvError::Empty) => ExchangeState::Pending,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.result = None;
                ExchangeState::Failed(TransportFailure::Connection(
                    "HTTP thread exited without a result".to_string(),
                ))
            }
        }
    }

    fn transferred(&self) -> u64 {
        self.shared.transferred.load(Ordering::Acquire)
    }

    fn headers_received(&self) -> bool {
        self.shared.headers.load(Ordering::Acquire)
    }

    fn cancel(&mut self) {
        self.shared.cancel.store(true, Ordering::Release);
        self.cancelled = true;
        self.result = None;
    }
}

impl Drop for ReqwestExchange {
    fn drop(&mut self) {
        self.shared.cancel.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Instant;

    /// A server that sends headers and three body bytes of a 100-byte
    /// response, then holds the connection open without sending more.
    fn stalling_server() -> (String, mpsc::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (release, hold) = mpsc::channel::<()>();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 4096];
            let _ = stream.read(&mut request);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nabc")
                .unwrap();
            stream.flush().unwrap();
            let _ = hold.recv_timeout(Duration::from_secs(20));
        });
        (format!("http://{}/0-99", addr), release)
    }

    fn wait_for(flag: &AtomicBool, limit: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if flag.load(Ordering::Acquire) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_transport_builds() {
        assert!(ReqwestTransport::new().is_ok());
    }

    #[test]
    fn test_cancelled_stalled_exchange_releases_thread() {
        let (url, _release) = stalling_server();
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_millis(300))
            .build()
            .unwrap();
        let transport = ReqwestTransport { client };

        let mut exchange = transport.spawn_exchange(HttpRequest::download(url));
        let shared = Arc::clone(&exchange.shared);
        assert!(wait_for(&shared.headers, Duration::from_secs(10)), "headers never arrived");
        assert_eq!(exchange.poll(), ExchangeState::Pending);

        exchange.cancel();
        assert!(
            wait_for(&shared.finished, Duration::from_secs(10)),
            "exchange thread still blocked after cancel"
        );
        assert!(matches!(exchange.poll(), ExchangeState::Failed(_)));
    }

    #[test]
    fn test_cancelled_exchange_reports_failure() {
        let mut exchange = ReqwestExchange {
            shared: Arc::new(Shared::default()),
            result: None,
            cancelled: false,
        };
        exchange.cancel();
        assert!(matches!(
            exchange.poll(),
            ExchangeState::Failed(TransportFailure::Connection(_))
        ));
    }

    #[test]
    fn test_poll_reports_result_once() {
        let (tx, rx) = oneshot::channel();
        let mut exchange = ReqwestExchange {
            shared: Arc::new(Shared::default()),
            result: Some(rx),
            cancelled: false,
        };
        assert_eq!(exchange.poll(), ExchangeState::Pending);

        tx.send(Ok(HttpResponse::ok(Bytes::from_static(b"abc")))).unwrap();
        assert!(matches!(exchange.poll(), ExchangeState::Complete(_)));
        assert!(matches!(exchange.poll(), ExchangeState::Failed(_)));
    }
}
