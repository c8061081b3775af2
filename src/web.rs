//! HTTP surface for the metrics exposition.
//!
//! One endpoint, `GET /metrics`, served straight off a `TcpListener`. The
//! handler holds no state beyond the shared [`ShaperMetrics`] registry and
//! tolerates whatever scrapers throw at it: anything that is not a GET for
//! `/metrics` gets a 404, malformed requests get a 400.

use std::sync::Arc;

use colored::Colorize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ShaperError;
use crate::shaper::exporter::{ShaperMetrics, OPENMETRICS_CONTENT_TYPE};

/// Upper bound on the request head we are willing to buffer.
const MAX_REQUEST_BYTES: usize = 8 * 1024;

/// Expand a bare `:port` bind into an all-interfaces address.
pub fn normalize_bind(bind: &str) -> String {
    if bind.starts_with(':') {
        format!("0.0.0.0{bind}")
    } else {
        bind.to_string()
    }
}

/// Running metrics endpoint: the bound address plus the accept-loop task.
pub struct MetricsServer {
    pub addr: std::net::SocketAddr,
    handle: JoinHandle<()>,
}

impl MetricsServer {
    /// Wait for the accept loop to finish after cancellation.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

/// Bind the listener and spawn the accept loop.
///
/// Binding happens before this returns so startup failures surface to the
/// orchestrator; the accept loop ends once the token is cancelled.
pub async fn serve(
    bind: &str,
    metrics: Arc<ShaperMetrics>,
    cancel: CancellationToken,
) -> Result<MetricsServer, ShaperError> {
    let addr = normalize_bind(bind);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ShaperError::Io(format!("bind {addr}: {e}")))?;
    let local = listener
        .local_addr()
        .map_err(|e| ShaperError::Io(e.to_string()))?;

    eprintln!(
        "{}",
        format!("  metrics exposition at http://{local}/metrics").bright_green()
    );

    let handle = tokio::spawn(async move {
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("metrics endpoint stopping");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let metrics = Arc::clone(&metrics);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, &metrics).await {
                    debug!(peer = %peer, error = %e, "scrape connection error");
                }
            });
        }
    });

    Ok(MetricsServer {
        addr: local,
        handle,
    })
}

async fn handle_connection(
    mut stream: TcpStream,
    metrics: &ShaperMetrics,
) -> Result<(), ShaperError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    // Read until the end of the request head. Scrape requests carry no body.
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ShaperError::Io(e.to_string()))?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);
    let (method, path) = match request.parse(&buf) {
        Ok(_) => (request.method.unwrap_or(""), request.path.unwrap_or("")),
        Err(_) => {
            write_response(&mut stream, 400, "text/plain; charset=utf-8", "bad request\n")
                .await?;
            return Ok(());
        }
    };

    let path = path.split('?').next().unwrap_or("");
    if method != "GET" || path != "/metrics" {
        write_response(&mut stream, 404, "text/plain; charset=utf-8", "not found\n").await?;
        return Ok(());
    }

    match metrics.render() {
        Ok(body) => {
            write_response(&mut stream, 200, OPENMETRICS_CONTENT_TYPE, &body).await?;
        }
        Err(e) => {
            warn!(error = %e, "metrics render failed");
            write_response(
                &mut stream,
                500,
                "text/plain; charset=utf-8",
                "metrics render failed\n",
            )
            .await?;
        }
    }
    Ok(())
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &str,
) -> Result<(), ShaperError> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream
        .write_all(head.as_bytes())
        .await
        .map_err(|e| ShaperError::Io(e.to_string()))?;
    stream
        .write_all(body.as_bytes())
        .await
        .map_err(|e| ShaperError::Io(e.to_string()))?;
    stream
        .shutdown()
        .await
        .map_err(|e| ShaperError::Io(e.to_string()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
