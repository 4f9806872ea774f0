use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::{Connect, HttpConnector}},
    rt::TokioExecutor,
};

use crate::{
    config::Config,
    record::Record,
    storage::{Storage, StreamedRequest},
};

type ReplayConnector = HttpsConnector<HttpConnector>;
type ReplayClient = Client<ReplayConnector, Full<Bytes>>;

/// Aggregate outcome of a replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub success: u64,
    pub failed: u64,
}

impl ReplaySummary {
    /// The process exit status for this run: the failure count, saturating.
    pub fn exit_code(&self) -> i32 {
        i32::try_from(self.failed).unwrap_or(i32::MAX)
    }
}

/// Replays every stored request against the configured target host, in
/// capture order, one at a time.
pub async fn replay(storage: &Storage, config: &Config) -> anyhow::Result<ReplaySummary> {
    let client = build_replay_client()?;
    replay_with_client(
        storage,
        &client,
        &config.replay.target_host,
        config.replay.request_timeout(),
    )
    .await
}

/// Replay driver over a caller-supplied client.
///
/// Per-record failures (reconstruction, transport, non-2xx status, corrupt
/// rows) are counted and logged, never propagated; only a store-level stream
/// failure aborts the run. Dispatch is strictly sequential with no retry and
/// no inter-request delay.
pub async fn replay_with_client<C>(
    storage: &Storage,
    client: &Client<C, Full<Bytes>>,
    target_host: &str,
    request_timeout: Duration,
) -> anyhow::Result<ReplaySummary>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    let mut summary = ReplaySummary::default();
    let mut stream = storage.stream_ordered();

    while let Some(item) = stream.next().await? {
        let record = match item {
            StreamedRequest::Decoded(record) => record,
            StreamedRequest::Corrupt { id, reason } => {
                tracing::error!(%id, "skipping corrupt stored request: {reason}");
                summary.failed += 1;
                continue;
            }
        };
        dispatch_one(client, &record, target_host, request_timeout, &mut summary).await;
    }

    tracing::info!(
        success = summary.success,
        failed = summary.failed,
        "replay completed"
    );
    Ok(summary)
}

async fn dispatch_one<C>(
    client: &Client<C, Full<Bytes>>,
    record: &Record,
    target_host: &str,
    request_timeout: Duration,
    summary: &mut ReplaySummary,
) where
    C: Connect + Clone + Send + Sync + 'static,
{
    let request = match record.to_http_request(target_host) {
        Ok(request) => request,
        Err(err) => {
            tracing::error!(id = %record.id, "reconstruct request failed: {err:#}");
            summary.failed += 1;
            return;
        }
    };

    tracing::info!(
        id = %record.id,
        method = %record.method,
        url = %request.uri(),
        "sending request"
    );

    let response = match tokio::time::timeout(request_timeout, client.request(request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            tracing::error!(id = %record.id, "send request failed: {err}");
            summary.failed += 1;
            return;
        }
        Err(_) => {
            tracing::error!(
                id = %record.id,
                "request timed out after {}ms",
                request_timeout.as_millis()
            );
            summary.failed += 1;
            return;
        }
    };

    let status = response.status();
    if let Err(err) = response.into_body().collect().await {
        tracing::debug!(id = %record.id, "drain response body failed: {err}");
    }

    if status.is_success() {
        summary.success += 1;
    } else {
        summary.failed += 1;
        tracing::error!(id = %record.id, status = %status, "request failed");
    }
}

fn build_replay_client() -> anyhow::Result<ReplayClient> {
    ensure_rustls_crypto_provider()?;
    let connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}
