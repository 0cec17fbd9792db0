//! The proxy server: endpoint multiplexing, handler task supervision, and
//! ownership of the KMS connector and the refreshers.
//!
//! Each inbound request spawns an independent handler task. Concurrent
//! handlers for the same key may each issue their own KMS fetch; the calls
//! are idempotent and the cache converges, so no per-key coalescing is
//! attempted.

pub mod handlers;
pub mod state;

pub use state::ProxyState;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{error, info};

use ekp_common::protocol::{
    BaseCipherId, BlobDomainId, DomainId, GetBlobMetadataReply, GetBlobMetadataRequest,
    GetByIdsReply, GetByIdsRequest, GetLatestReply, GetLatestRequest, HaltRequest, ProxyRequest,
};
use ekp_common::{EkpError, EkpResult};

use crate::config::Config;
use crate::kms::{activate_kms_connector, KmsConnector};
use crate::refresh;

/// Depth of the inbound request queue.
const REQUEST_QUEUE_DEPTH: usize = 128;

/// Cloneable client handle to a running proxy.
#[derive(Clone)]
pub struct EncryptKeyProxy {
    tx: mpsc::Sender<ProxyRequest>,
}

impl EncryptKeyProxy {
    async fn send(&self, req: ProxyRequest) -> EkpResult<()> {
        self.tx
            .send(req)
            .await
            .map_err(|_| EkpError::Internal("proxy is not running".into()))
    }

    /// Fetch specific base cipher key versions, consulting the cache first.
    ///
    /// # Errors
    ///
    /// Fails only if the proxy has stopped; KMS failures arrive inside the
    /// reply envelope.
    pub async fn get_cipher_keys_by_ids(
        &self,
        cipher_ids: Vec<(DomainId, BaseCipherId)>,
        debug_id: Option<u64>,
    ) -> EkpResult<GetByIdsReply> {
        let (tx, rx) = oneshot::channel();
        self.send(ProxyRequest::GetByIds(GetByIdsRequest {
            cipher_ids,
            debug_id,
            reply: tx,
        }))
        .await?;
        rx.await
            .map_err(|_| EkpError::Internal("handler dropped the reply".into()))
    }

    /// Fetch the latest base cipher key for each domain.
    ///
    /// # Errors
    ///
    /// Fails only if the proxy has stopped; KMS failures arrive inside the
    /// reply envelope.
    pub async fn get_latest_cipher_keys(
        &self,
        domain_ids: Vec<DomainId>,
        debug_id: Option<u64>,
    ) -> EkpResult<GetLatestReply> {
        let (tx, rx) = oneshot::channel();
        self.send(ProxyRequest::GetLatest(GetLatestRequest {
            domain_ids,
            debug_id,
            reply: tx,
        }))
        .await?;
        rx.await
            .map_err(|_| EkpError::Internal("handler dropped the reply".into()))
    }

    /// Fetch blob storage credentials metadata for each blob domain.
    ///
    /// # Errors
    ///
    /// Returns the KMS failure when the lookup could not be satisfied.
    pub async fn get_latest_blob_metadata(
        &self,
        domain_ids: Vec<BlobDomainId>,
        debug_id: Option<u64>,
    ) -> EkpResult<GetBlobMetadataReply> {
        let (tx, rx) = oneshot::channel();
        self.send(ProxyRequest::GetBlobMetadata(GetBlobMetadataRequest {
            domain_ids,
            debug_id,
            reply: tx,
        }))
        .await?;
        rx.await
            .map_err(|_| EkpError::Internal("handler dropped the reply".into()))?
    }

    /// Ask the proxy to acknowledge and stop.
    ///
    /// # Errors
    ///
    /// Fails if the proxy already stopped before acknowledging.
    pub async fn halt(&self, requester_id: u64) -> EkpResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ProxyRequest::Halt(HaltRequest {
            requester_id,
            reply: tx,
        }))
        .await?;
        rx.await
            .map_err(|_| EkpError::Internal("halt was not acknowledged".into()))
    }
}

/// Start a proxy using the connector named in the configuration.
///
/// # Errors
///
/// Fails if the configured connector cannot be activated.
pub fn spawn(cfg: Config) -> EkpResult<(EncryptKeyProxy, JoinHandle<EkpResult<()>>)> {
    let connector = activate_kms_connector(&cfg)?;
    Ok(spawn_with_connector(cfg, connector))
}

/// Start a proxy over an explicit connector instance.
pub fn spawn_with_connector(
    cfg: Config,
    connector: Arc<dyn KmsConnector>,
) -> (EncryptKeyProxy, JoinHandle<EkpResult<()>>) {
    let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let server = tokio::spawn(run(cfg, connector, rx));
    (EncryptKeyProxy { tx }, server)
}

/// The server loop. Multiplexes request intake over the endpoints, spawning
/// one handler task per request, and supervises the refreshers and the
/// connector core task.
async fn run(
    cfg: Config,
    connector: Arc<dyn KmsConnector>,
    mut rx: mpsc::Receiver<ProxyRequest>,
) -> EkpResult<()> {
    info!(
        connector_type = connector.connector_type(),
        "encrypt key proxy starting"
    );
    let state = Arc::new(ProxyState::new(&cfg));

    let mut connector_core = {
        let connector = Arc::clone(&connector);
        tokio::spawn(async move { connector.core_task().await })
    };
    let mut cipher_refresher = tokio::spawn(refresh::cipher_refresh_task(
        Arc::clone(&state),
        Arc::clone(&connector),
    ));
    let mut blob_refresher = tokio::spawn(refresh::blob_refresh_task(
        Arc::clone(&state),
        Arc::clone(&connector),
    ));
    let mut handler_tasks: JoinSet<()> = JoinSet::new();

    let result = loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(ProxyRequest::GetByIds(req)) => {
                    let state = Arc::clone(&state);
                    let connector = Arc::clone(&connector);
                    handler_tasks.spawn(async move {
                        if let Err(e) =
                            handlers::get_cipher_keys_by_ids(&state, &connector, req).await
                        {
                            error!(error = %e, "get-by-ids handler terminated");
                        }
                    });
                }
                Some(ProxyRequest::GetLatest(req)) => {
                    let state = Arc::clone(&state);
                    let connector = Arc::clone(&connector);
                    handler_tasks.spawn(async move {
                        if let Err(e) =
                            handlers::get_latest_cipher_keys(&state, &connector, req).await
                        {
                            error!(error = %e, "get-latest handler terminated");
                        }
                    });
                }
                Some(ProxyRequest::GetBlobMetadata(req)) => {
                    let state = Arc::clone(&state);
                    let connector = Arc::clone(&connector);
                    handler_tasks.spawn(async move {
                        if let Err(e) =
                            handlers::get_latest_blob_metadata(&state, &connector, req).await
                        {
                            error!(error = %e, "blob metadata handler terminated");
                        }
                    });
                }
                Some(ProxyRequest::Halt(req)) => {
                    info!(requester_id = req.requester_id, "halt requested");
                    let _ = req.reply.send(());
                    break Ok(());
                }
                // All client handles dropped; nothing further can arrive.
                None => break Ok(()),
            },
            Some(joined) = handler_tasks.join_next() => log_handler_exit(joined),
            joined = &mut cipher_refresher => {
                break Err(supervised_task_failure("cipher key refresher", joined));
            }
            joined = &mut blob_refresher => {
                break Err(supervised_task_failure("blob metadata refresher", joined));
            }
            joined = &mut connector_core => {
                break Err(supervised_task_failure("KMS connector core task", joined));
            }
        }
    };

    // In-flight handlers are abandoned on shutdown.
    handler_tasks.abort_all();
    cipher_refresher.abort();
    blob_refresher.abort();
    connector_core.abort();

    match &result {
        Ok(()) => info!("encrypt key proxy stopped"),
        Err(e) => error!(error = %e, "encrypt key proxy terminated"),
    }
    result
}

fn log_handler_exit(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if !e.is_cancelled() {
            error!(error = %e, "handler task panicked");
        }
    }
}

/// A supervised task must outlive the server loop; its loss is an internal
/// invariant violation.
fn supervised_task_failure(what: &str, joined: Result<EkpResult<()>, JoinError>) -> EkpError {
    match joined {
        Ok(Err(e)) => EkpError::Internal(format!("{what} failed: {e}")),
        Ok(Ok(())) => EkpError::Internal(format!("{what} stopped unexpectedly")),
        Err(e) => EkpError::Internal(format!("{what} panicked: {e}")),
    }
}
