use crate::http::{self, HttpError};
use crate::race::{RaceError, Racer};
use crate::relay::relay;
use crate::sniff::{sniff, Sniffed};
use crate::socks::{self, TargetAddress, REP_SUCCESS};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Serve one accepted client: SOCKS5 handshake, sniff, then either
/// request-level HTTP racing or a single tunnel race followed by a relay.
pub async fn handle_connection(stream: TcpStream, racer: Arc<Racer>, cancel: CancellationToken) {
    let setup = tokio::select! {
        setup = accept_client(stream) => setup,
        _ = cancel.cancelled() => return,
    };
    let Some((target, sniffed, writer)) = setup else {
        return;
    };

    let upstreams = racer.upstreams().len();
    if sniffed.is_http {
        info!("HTTP mode for {} across {} upstreams", target, upstreams);
        serve_http(BufReader::new(sniffed.reader), writer, &target, &racer, &cancel).await;
    } else {
        info!("relay mode for {} across {} upstreams", target, upstreams);
        serve_tunnel(sniffed.reader, writer, &target, &racer, &cancel).await;
    }
}

async fn accept_client(
    mut stream: TcpStream,
) -> Option<(TargetAddress, Sniffed<OwnedReadHalf>, OwnedWriteHalf)> {
    if let Err(e) = socks::negotiate(&mut stream).await {
        debug!("negotiation failed: {}", e);
        return None;
    }

    let target = match socks::read_request(&mut stream).await {
        Ok(target) => target,
        Err(e) => {
            warn!("parse request failed: {}", e);
            let _ = socks::send_reply(&mut stream, e.reply_code(), None).await;
            return None;
        }
    };

    debug!(
        kind = ?target.kind(),
        host = target.host(),
        port = target.port(),
        "CONNECT request"
    );

    let bind = stream.local_addr().ok();
    if let Err(e) = socks::send_reply(&mut stream, REP_SUCCESS, bind).await {
        debug!("send reply failed: {}", e);
        return None;
    }

    let (reader, writer) = stream.into_split();
    match sniff(reader).await {
        Ok(sniffed) => Some((target, sniffed, writer)),
        Err(e) => {
            debug!("protocol detection failed: {}", e);
            None
        }
    }
}

async fn serve_http<R, W>(
    mut reader: R,
    mut writer: W,
    target: &TargetAddress,
    racer: &Racer,
    cancel: &CancellationToken,
) where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let request = tokio::select! {
            request = http::read_request(&mut reader) => request,
            _ = cancel.cancelled() => return,
        };
        let request = match request {
            Ok(request) => request,
            Err(HttpError::Closed) => return,
            Err(e) if e.is_malformed() => {
                warn!("parse request failed: {}", e);
                let _ = writer
                    .write_all(http::error_response(400, "Bad Request").as_bytes())
                    .await;
                return;
            }
            Err(e) => {
                debug!("client closed mid-request: {}", e);
                return;
            }
        };

        info!(
            "HTTP {} {} (host {})",
            request.method,
            request.uri,
            request.headers.get("Host").unwrap_or("-")
        );
        debug!(
            "request headers: {}; body {} bytes",
            request.headers.names().collect::<Vec<_>>().join(", "),
            request.body.as_ref().map_or(0, |b| b.len())
        );

        let outcome = match racer.race_request(target, &request, cancel).await {
            Ok(outcome) => outcome,
            Err(RaceError::Cancelled) => return,
            Err(e) => {
                warn!("race request failed: {}", e);
                log_reply_codes(&e);
                let reply = match e {
                    RaceError::Timeout(_) => http::error_response(504, "Gateway Timeout"),
                    _ => http::error_response(502, "Bad Gateway"),
                };
                let _ = writer.write_all(reply.as_bytes()).await;
                return;
            }
        };

        for report in &outcome.reports {
            debug!(
                "  {} {} in {}ms",
                report.upstream,
                if report.succeeded { "answered" } else { "failed" },
                report.elapsed.as_millis()
            );
        }

        let response = outcome.payload;
        info!(
            "{} {} -> {} ({}, body {} bytes)",
            request.method,
            request.uri,
            outcome.winner,
            response.status(),
            response.body.as_ref().map_or(0, |b| b.len())
        );

        if let Err(e) = writer.write_all(&response.raw).await {
            debug!("client write failed: {}", e);
            return;
        }

        if request.should_close() || response.should_close() {
            return;
        }
    }
}

async fn serve_tunnel<R, W>(
    reader: R,
    writer: W,
    target: &TargetAddress,
    racer: &Racer,
    cancel: &CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let outcome = match racer.race_tunnel(target, cancel).await {
        Ok(outcome) => outcome,
        Err(RaceError::Cancelled) => return,
        Err(e) => {
            warn!("{} upstream failed: {}", target, e);
            log_reply_codes(&e);
            return;
        }
    };

    let (upstream_rd, upstream_wr) = outcome.payload.into_split();
    let stats = relay(
        (reader, writer),
        (upstream_rd, upstream_wr),
        racer.tracker(),
        cancel,
    )
    .await;
    debug!(
        "relay for {} via {} finished: {}↑ {}↓ bytes",
        target, outcome.winner, stats.client_to_upstream, stats.upstream_to_client
    );
}

fn log_reply_codes(error: &RaceError) {
    for failure in error.failures() {
        if let Some(code) = failure.error.reply_code() {
            warn!(
                "{} upstream failed: SOCKS5 reply code {} ({})",
                failure.upstream,
                code,
                socks::reply_text(code)
            );
        }
    }
}
