//! Connection/channel handles shared by the supervisors and the facade.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::transport::{BrokerChannel, BrokerConnection};

/// Everything guarded by the client's single lock.
///
/// Never held across an `.await`.
pub(crate) struct ClientState {
    pub connection: Option<Arc<dyn BrokerConnection>>,
    pub channel: Option<Arc<dyn BrokerChannel>>,
    pub shutdown: bool,
    /// Bumped each time a connection is installed
    pub generation: u64,
    /// Bumped each time a channel is installed
    pub channel_epoch: u64,
    pub reconnects: u64,
    pub last_reconnect_at: Option<DateTime<Utc>>,
    /// Queues with a running consume loop
    pub consumers: HashSet<String>,
}

/// Consistent view of the current channel taken under the lock
#[derive(Clone)]
pub(crate) struct ChannelSnapshot {
    pub channel: Arc<dyn BrokerChannel>,
    pub epoch: u64,
}

/// Old handles handed back by an install; close them outside the lock
#[derive(Default)]
pub(crate) struct Replaced {
    pub connection: Option<Arc<dyn BrokerConnection>>,
    pub channel: Option<Arc<dyn BrokerChannel>>,
}

impl Replaced {
    pub async fn close(self) {
        if let Some(channel) = self.channel {
            if let Err(e) = channel.close().await {
                tracing::debug!(error = %e, "Error closing superseded channel");
            }
        }
        if let Some(connection) = self.connection {
            if let Err(e) = connection.close().await {
                tracing::debug!(error = %e, "Error closing superseded connection");
            }
        }
    }
}

pub(crate) struct SharedState {
    state: Mutex<ClientState>,
    epoch_tx: watch::Sender<u64>,
}

impl SharedState {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(ClientState {
                connection: None,
                channel: None,
                shutdown: false,
                generation: 0,
                channel_epoch: 0,
                reconnects: 0,
                last_reconnect_at: None,
                consumers: HashSet::new(),
            }),
            epoch_tx,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Watch that ticks with the channel epoch on every install and on shutdown
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    /// Install a freshly connected connection and its channel as one step.
    ///
    /// Returns the new generation and the handles it replaced, or gives the new
    /// handles back when shutdown has already begun.
    pub fn install_connection(
        &self,
        connection: Arc<dyn BrokerConnection>,
        channel: Arc<dyn BrokerChannel>,
    ) -> std::result::Result<(u64, Replaced), Replaced> {
        let mut state = self.lock();
        if state.shutdown {
            return Err(Replaced {
                connection: Some(connection),
                channel: Some(channel),
            });
        }

        let replaced = Replaced {
            connection: state.connection.replace(connection),
            channel: state.channel.replace(channel),
        };
        if replaced.connection.is_some() {
            state.reconnects += 1;
            state.last_reconnect_at = Some(Utc::now());
        }
        state.generation += 1;
        state.channel_epoch += 1;
        self.epoch_tx.send_replace(state.channel_epoch);
        Ok((state.generation, replaced))
    }

    /// Install a channel only if `generation` is still current; returns the new epoch.
    pub fn install_channel(
        &self,
        generation: u64,
        channel: Arc<dyn BrokerChannel>,
    ) -> std::result::Result<(u64, Replaced), (Arc<dyn BrokerChannel>, InstallRefused)> {
        let mut state = self.lock();
        if state.shutdown {
            return Err((channel, InstallRefused::Shutdown));
        }
        if state.generation != generation {
            return Err((channel, InstallRefused::Superseded));
        }

        let replaced = Replaced {
            connection: None,
            channel: state.channel.replace(channel),
        };
        state.channel_epoch += 1;
        self.epoch_tx.send_replace(state.channel_epoch);
        Ok((state.channel_epoch, replaced))
    }

    /// Flip the shutdown flag and take both handles. None if already shut down.
    pub fn begin_shutdown(&self) -> Option<Replaced> {
        let mut state = self.lock();
        if state.shutdown {
            return None;
        }
        state.shutdown = true;
        let taken = Replaced {
            connection: state.connection.take(),
            channel: state.channel.take(),
        };
        // Wake consume loops parked on the epoch watch.
        self.epoch_tx.send_modify(|_| {});
        Some(taken)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstallRefused {
    Shutdown,
    Superseded,
}
