//! Accept loop serving the axum router over hyper, with optional TLS.
//!
//! Each connection gets its peer address as `ConnectInfo` so handlers can log
//! it.  The loop stops accepting once `stop` is cancelled; connections
//! already accepted run to completion on their own tasks.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ConnectInfo;
use axum::{Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Serve `app` on `listener` until `stop` is cancelled.
pub async fn serve(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    app: Router,
    stop: CancellationToken,
) -> Result<()> {
    let local = listener
        .local_addr()
        .context("failed to read listener address")?;
    info!(%local, tls = tls.is_some(), "listening");

    loop {
        let (stream, remote) = tokio::select! {
            () = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        let app = app.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => serve_connection(stream, remote, app).await,
                    Err(e) => debug!(%remote, error = %e, "TLS handshake failed"),
                },
                None => serve_connection(stream, remote, app).await,
            }
        });
    }

    info!(%local, "listener stopped");
    Ok(())
}

async fn serve_connection<S>(stream: S, remote: SocketAddr, app: Router)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(app.layer(Extension(ConnectInfo(remote))));
    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(%remote, error = %e, "connection closed with error");
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::get;

    use super::*;

    #[tokio::test]
    async fn serves_until_stopped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/peer",
            get(|ConnectInfo(peer): ConnectInfo<SocketAddr>| async move { peer.ip().to_string() }),
        );
        let stop = CancellationToken::new();
        let server = tokio::spawn(serve(listener, None, app, stop.clone()));

        let body = reqwest::get(format!("http://{addr}/peer"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "127.0.0.1");

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .expect("accept loop did not stop")
            .unwrap()
            .unwrap();
    }
}
