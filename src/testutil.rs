//! Loopback SOCKS5 upstreams for tests

use crate::http;
use crate::socks::{self, REP_SUCCESS};
use crate::upstream::Upstream;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone, Copy)]
pub enum UpstreamBehavior {
    /// Accept every CONNECT and echo tunnel bytes back
    Echo,
    /// Answer every CONNECT with the given failure code
    Refuse(u8),
    /// Accept TCP but never answer the handshake
    Stall,
    /// Accept the CONNECT, then answer each HTTP request with `response`
    /// after `delay`
    Http {
        delay: Duration,
        response: &'static [u8],
    },
}

/// Start a fake upstream on an ephemeral loopback port
pub async fn spawn_upstream(behavior: UpstreamBehavior) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, behavior));
        }
    });

    Upstream::new(address)
}

async fn serve(mut stream: TcpStream, behavior: UpstreamBehavior) {
    if let UpstreamBehavior::Stall = behavior {
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
        return;
    }

    if socks::negotiate(&mut stream).await.is_err() {
        return;
    }
    if socks::read_request(&mut stream).await.is_err() {
        return;
    }

    let code = match behavior {
        UpstreamBehavior::Refuse(code) => code,
        _ => REP_SUCCESS,
    };
    let bind = stream.local_addr().ok();
    if socks::send_reply(&mut stream, code, bind).await.is_err() || code != REP_SUCCESS {
        return;
    }

    match behavior {
        UpstreamBehavior::Echo => {
            let (mut rd, mut wr) = stream.split();
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
        }
        UpstreamBehavior::Http { delay, response } => {
            let mut reader = BufReader::new(stream);
            while http::read_request(&mut reader).await.is_ok() {
                tokio::time::sleep(delay).await;
                if reader.get_mut().write_all(response).await.is_err() {
                    break;
                }
            }
        }
        UpstreamBehavior::Refuse(_) | UpstreamBehavior::Stall => {}
    }
}
