use crate::connection::handle_connection;
use crate::race::Racer;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A SOCKS5 listener bound to one address, racing over its own upstreams
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    racer: Arc<Racer>,
}

impl Listener {
    pub async fn bind(listen: &str, racer: Racer) -> io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            racer: Arc::new(racer),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept clients until `shutdown` fires. Each client runs on `tracker`
    /// with a child token so shutdown reaches every open connection.
    pub async fn serve(self, tracker: TaskTracker, shutdown: CancellationToken) {
        let Listener {
            listener,
            local_addr,
            racer,
        } = self;

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.cancelled() => break,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
                    let span = info_span!("conn", id, peer = %peer_addr);
                    debug!(parent: &span, "accepted on {}", local_addr);

                    tracker.spawn(
                        handle_connection(stream, Arc::clone(&racer), shutdown.child_token())
                            .instrument(span),
                    );
                }
                Err(e) => {
                    warn!("Accept error: {} (continuing)", e);
                    continue;
                }
            }
        }

        info!("Listener {} stopped", local_addr);
    }
}
