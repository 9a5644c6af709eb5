//! The TLS listener and the live-session accounting the bootstrap's
//! exit rule is built on.

use std::sync::Arc;

use tokio::{net::TcpListener, sync::watch};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::{
    commands::Bridge,
    session::{run_session, SessionIo},
    tls,
};

/// Counts live sessions through guards. The bootstrap watches the
/// receiver: when the count returns to zero with no listener active and
/// no pending input, the process is done.
#[derive(Clone)]
pub struct SessionTracker {
    tx: Arc<watch::Sender<usize>>,
}

pub struct SessionGuard {
    tx: Arc<watch::Sender<usize>>,
}

impl SessionTracker {
    pub fn new() -> (Self, watch::Receiver<usize>) {
        let (tx, rx) = watch::channel(0);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn begin(&self) -> SessionGuard {
        self.tx.send_modify(|count| *count += 1);
        SessionGuard {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.tx.send_modify(|count| *count -= 1);
    }
}

/// Accepts TCP connections, enables keepalive, performs the TLS
/// handshake and derives the session's capabilities from the client
/// certificate. Unknown certificates are dropped before the greeting.
pub async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    bridge: Arc<Bridge>,
    tracker: SessionTracker,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept: {err}");
                continue;
            }
        };
        info!("incoming TCP request from {addr}");

        let sock = socket2::SockRef::from(&stream);
        if let Err(err) = sock.set_keepalive(true) {
            warn!("cannot enable keepalive for {addr}: {err}");
        }

        let acceptor = acceptor.clone();
        let bridge = Arc::clone(&bridge);
        let guard = tracker.begin();
        tokio::spawn(async move {
            let _guard = guard;
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("TLS handshake with {addr} failed: {err}");
                    return;
                }
            };

            let capabilities = {
                let (_, connection) = stream.get_ref();
                connection
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .map(tls::fingerprint)
                    .and_then(|fp| bridge.config.access.for_fingerprint(&fp))
            };
            let capabilities = match capabilities {
                Some(capabilities) => capabilities,
                None => {
                    warn!("{addr}: client certificate has no access profile");
                    return;
                }
            };

            let (read_half, write_half) = tokio::io::split(stream);
            let io = SessionIo::new(read_half, write_half, addr.to_string());
            run_session(bridge, io, capabilities).await;
            info!("connection to {addr} closed");
        });
    }
}
