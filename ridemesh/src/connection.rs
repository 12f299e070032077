//! Connection supervisor: owns dialing the broker and the reconnect loop.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::backoff::{self, sleep_or_cancel};
use crate::channel::{open_channel, spawn_channel_supervisor};
use crate::client::ClientInner;
use crate::error::{RideMeshError, Result};
use crate::transport::{CloseReason, CloseSignal};

/// Dial the broker, open a channel and declare the topology.
///
/// Client state changes only once all three succeed; otherwise the new
/// connection is closed and the stored one is left untouched. Returns the
/// installed generation.
pub(crate) async fn connect(inner: &ClientInner) -> Result<u64> {
    debug!(uri = %inner.config.redacted_uri(), "Connecting to broker");
    let connection = inner.connector.connect(&inner.config.uri).await?;

    let channel = match open_channel(connection.as_ref(), &inner.config.topology).await {
        Ok(channel) => channel,
        Err(e) => {
            if let Err(close_err) = connection.close().await {
                debug!(error = %close_err, "Error closing half-initialized connection");
            }
            return Err(e);
        }
    };

    match inner.shared.install_connection(connection, channel) {
        Ok((generation, replaced)) => {
            replaced.close().await;
            Ok(generation)
        }
        Err(rejected) => {
            rejected.close().await;
            Err(RideMeshError::Closed)
        }
    }
}

pub(crate) fn spawn_connection_supervisor(inner: Arc<ClientInner>) {
    let tasks = inner.tasks.clone();
    tasks.spawn(supervise_connection(inner));
}

enum Watched {
    Shutdown,
    Missing,
    Signal(CloseSignal),
}

fn watch_current_connection(inner: &ClientInner) -> Watched {
    let state = inner.shared.lock();
    if state.shutdown {
        return Watched::Shutdown;
    }
    match &state.connection {
        Some(connection) => Watched::Signal(connection.close_signal()),
        None => Watched::Missing,
    }
}

async fn supervise_connection(inner: Arc<ClientInner>) {
    debug!("Connection supervisor started");
    let inner_ref: &ClientInner = &inner;

    loop {
        let reason = match watch_current_connection(inner_ref) {
            Watched::Shutdown => break,
            Watched::Missing => CloseReason::Error("no connection installed".to_string()),
            Watched::Signal(mut signal) => {
                tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => break,
                    reason = signal.closed() => reason,
                }
            }
        };

        if reason.is_clean() || inner.is_shutdown() {
            break;
        }
        warn!(reason = %reason, "Broker connection lost, reconnecting");

        let outcome = backoff::retry(
            &inner.config.connection_retry,
            &inner.shutdown,
            "reconnect",
            |_| connect(inner_ref),
        )
        .await;

        match outcome {
            Ok(generation) => {
                info!(generation, "Reconnected to broker");
                spawn_channel_supervisor(inner.clone(), generation);
            }
            Err(RideMeshError::Closed) | Err(RideMeshError::Cancelled) => break,
            Err(e) => {
                let cooldown = inner.config.reconnect_cooldown;
                error!(
                    error = %e,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "Could not reconnect to broker, cooling down before trying again"
                );
                if !sleep_or_cancel(cooldown, &inner.shutdown).await {
                    break;
                }
            }
        }
    }

    debug!("Connection supervisor stopped");
}
