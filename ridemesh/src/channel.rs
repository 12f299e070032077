//! Channel supervisor: reopens the channel while its connection stays up.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::backoff;
use crate::client::ClientInner;
use crate::error::{RideMeshError, Result};
use crate::state::InstallRefused;
use crate::topology::Topology;
use crate::transport::{BrokerChannel, BrokerConnection, CloseSignal};

/// Open a channel on `connection` and declare `topology` on it.
///
/// The channel is closed again if declaration fails.
pub(crate) async fn open_channel(
    connection: &dyn BrokerConnection,
    topology: &Topology,
) -> Result<Arc<dyn BrokerChannel>> {
    let channel = connection.create_channel().await?;
    if let Err(e) = topology.declare(channel.as_ref()).await {
        if let Err(close_err) = channel.close().await {
            debug!(error = %close_err, "Error closing channel after failed declaration");
        }
        return Err(e);
    }
    Ok(channel)
}

/// Start the supervisor bound to connection `generation`
pub(crate) fn spawn_channel_supervisor(inner: Arc<ClientInner>, generation: u64) {
    let tasks = inner.tasks.clone();
    tasks.spawn(supervise_channel(inner, generation));
}

fn watch_current_channel(inner: &ClientInner, generation: u64) -> Option<CloseSignal> {
    let state = inner.shared.lock();
    if state.shutdown || state.generation != generation {
        return None;
    }
    state.channel.as_ref().map(|channel| channel.close_signal())
}

fn connection_alive(inner: &ClientInner, generation: u64) -> bool {
    let state = inner.shared.lock();
    state.generation == generation
        && state
            .connection
            .as_ref()
            .is_some_and(|connection| connection.is_open())
}

/// Open a replacement channel on the generation's connection and install it.
async fn reopen_channel(inner: &ClientInner, generation: u64) -> Result<u64> {
    let connection = {
        let state = inner.shared.lock();
        if state.shutdown {
            return Err(RideMeshError::Closed);
        }
        if state.generation != generation {
            return Err(RideMeshError::Superseded { generation });
        }
        state.connection.clone().ok_or(RideMeshError::NotConnected)?
    };
    if !connection.is_open() {
        return Err(RideMeshError::Superseded { generation });
    }

    let channel = open_channel(connection.as_ref(), &inner.config.topology).await?;

    match inner.shared.install_channel(generation, channel) {
        Ok((epoch, replaced)) => {
            replaced.close().await;
            Ok(epoch)
        }
        Err((channel, refused)) => {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Error closing unused channel");
            }
            Err(match refused {
                InstallRefused::Shutdown => RideMeshError::Closed,
                InstallRefused::Superseded => RideMeshError::Superseded { generation },
            })
        }
    }
}

async fn supervise_channel(inner: Arc<ClientInner>, generation: u64) {
    debug!(generation, "Channel supervisor started");
    let inner_ref: &ClientInner = &inner;

    loop {
        let Some(mut signal) = watch_current_channel(inner_ref, generation) else {
            break;
        };

        let reason = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            reason = signal.closed() => reason,
        };

        if reason.is_clean() || inner.is_shutdown() {
            break;
        }
        if !connection_alive(inner_ref, generation) {
            debug!(generation, "Channel went down with its connection");
            break;
        }
        warn!(generation, reason = %reason, "Channel closed unexpectedly, reopening");

        let outcome = backoff::retry(
            &inner.config.channel_retry,
            &inner.shutdown,
            "reopen channel",
            |_| reopen_channel(inner_ref, generation),
        )
        .await;

        match outcome {
            Ok(epoch) => info!(generation, epoch, "Channel reopened"),
            Err(RideMeshError::Closed)
            | Err(RideMeshError::Cancelled)
            | Err(RideMeshError::Superseded { .. }) => break,
            Err(e) => {
                error!(
                    generation,
                    error = %e,
                    "Fatal channel error, no usable channel until the connection is re-established"
                );
                break;
            }
        }
    }

    debug!(generation, "Channel supervisor stopped");
}
