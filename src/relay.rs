use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Full-duplex copy between a client and an upstream tunnel.
///
/// Each direction runs in its own task on `tracker`, so shutdown waits for
/// them. When either one ends (EOF or error) or `cancel` fires, both sides
/// are shut down and this returns only after both tasks have finished and
/// dropped their halves.
pub async fn relay<CR, CW, UR, UW>(
    client: (CR, CW),
    upstream: (UR, UW),
    tracker: &TaskTracker,
    cancel: &CancellationToken,
) -> RelayStats
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    UR: AsyncRead + Unpin + Send + 'static,
    UW: AsyncWrite + Unpin + Send + 'static,
{
    let (client_rd, client_wr) = client;
    let (upstream_rd, upstream_wr) = upstream;
    let teardown = cancel.child_token();

    let up = tracker.spawn(pipe(client_rd, upstream_wr, teardown.clone(), "client->upstream"));
    let down = tracker.spawn(pipe(upstream_rd, client_wr, teardown, "upstream->client"));

    let (up, down) = tokio::join!(up, down);
    RelayStats {
        client_to_upstream: up.unwrap_or_default(),
        upstream_to_client: down.unwrap_or_default(),
    }
}

async fn pipe<R, W>(mut src: R, mut dst: W, teardown: CancellationToken, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = tokio::select! {
            _ = teardown.cancelled() => break,
            res = src.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("{} read error: {}", direction, e);
                    break;
                }
            },
        };

        tokio::select! {
            _ = teardown.cancelled() => break,
            res = dst.write_all(&buf[..n]) => {
                if let Err(e) = res {
                    debug!("{} write error: {}", direction, e);
                    break;
                }
            }
        }
        copied += n as u64;
    }

    // Either direction ending tears down the whole relay
    teardown.cancel();
    let _ = dst.shutdown().await;
    copied
}
