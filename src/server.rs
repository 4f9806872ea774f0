use std::{convert::Infallible, net::SocketAddr};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{net::TcpListener, sync::oneshot};

use crate::{config::Config, record, storage::Storage};

#[derive(Debug)]
pub struct ServerHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

/// Starts the capture listener. Every inbound request on any path and method
/// is encoded and persisted; each connection is served on its own task and
/// shares nothing but the storage handle.
pub async fn serve(config: &Config, storage: Storage) -> anyhow::Result<ServerHandle> {
    let listener = TcpListener::bind(config.server.listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", config.server.listen))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let storage = storage.clone();
                    tokio::spawn(async move {
                        let service =
                            service_fn(move |req| capture_handler(req, storage.clone()));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ServerHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

async fn capture_handler(
    req: Request<Incoming>,
    storage: Storage,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let uri = req.uri().to_string();

    let record = match record::capture(req).await {
        Ok(record) => record,
        Err(err) => {
            tracing::error!(%method, %uri, "encode request failed: {err:#}");
            return Ok(server_error_response("error encoding request"));
        }
    };

    tracing::info!(id = %record.id, %method, %uri, "recording request");

    if let Err(err) = storage.insert_request(&record).await {
        tracing::error!(id = %record.id, "store request failed: {err:#}");
        return Ok(server_error_response("error storing request"));
    }

    let body = match serde_json::to_vec(&record) {
        Ok(body) => body,
        Err(err) => {
            tracing::error!(id = %record.id, "encode response failed: {err}");
            return Ok(server_error_response("error encoding response"));
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

fn server_error_response(message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_owned())));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
