//! Connection manager owning the single bus connection.
//!
//! One login attempt at a time: a login while connecting or connected is a
//! no-op, so the first caller decides the connection identity. Logout tears
//! the connection down best-effort with bounded waits and always returns the
//! manager to `Idle`. A logout that overtakes an in-flight login discards the
//! login's result and closes the late connection in the background.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use tilestion_bus::{BusConnection, BusConnector, BusError, ConnectOptions};

use crate::error::ConnectionError;
use crate::types::{
    ActiveConnection, ConnectionConfig, ConnectionEvent, ConnectionState, Credentials, Identity,
};

struct ManagerState {
    state: ConnectionState,
    identity: Option<Identity>,
    error: Option<String>,
    connection: Option<ActiveConnection>,
    /// Bumped by every login attempt and every logout. A connect result is
    /// only accepted if the epoch is unchanged when it lands.
    epoch: u64,
}

/// Owns at most one live bus connection.
pub struct ConnectionManager {
    connector: Arc<dyn BusConnector>,
    config: ConnectionConfig,
    inner: Mutex<ManagerState>,
    connection_tx: watch::Sender<Option<ActiveConnection>>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
}

impl ConnectionManager {
    /// Creates a manager with default settings.
    pub fn new(connector: Arc<dyn BusConnector>) -> Self {
        Self::with_config(connector, ConnectionConfig::default())
    }

    pub fn with_config(connector: Arc<dyn BusConnector>, config: ConnectionConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (connection_tx, _) = watch::channel(None);

        Self {
            connector,
            config,
            inner: Mutex::new(ManagerState {
                state: ConnectionState::Idle,
                identity: None,
                error: None,
                connection: None,
                epoch: 0,
            }),
            connection_tx,
            events_tx,
            events_rx: tokio::sync::Mutex::new(Some(events_rx)),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Identity of the current login, if connected.
    pub fn identity(&self) -> Option<Identity> {
        self.lock().identity.clone()
    }

    /// Message of the last failed login, cleared by the next attempt or logout.
    pub fn last_error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<ActiveConnection> {
        self.lock().connection.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observes every change of the live connection, including it going away.
    pub fn watch_connection(&self) -> watch::Receiver<Option<ActiveConnection>> {
        self.connection_tx.subscribe()
    }

    /// Client name presented to the bus for `username`.
    pub fn client_name(&self, username: &str) -> String {
        format!("{}-{username}", self.config.app_name)
    }

    /// Logs in with a single connect attempt.
    ///
    /// Returns `Ok(())` without doing anything if a connection exists or an
    /// attempt is already in flight.
    pub async fn login(
        &self,
        bus_url: &str,
        username: &str,
        password: &str,
    ) -> Result<(), ConnectionError> {
        self.login_with(&Credentials::new(bus_url, username, password))
            .await
    }

    /// Same as [`login`](Self::login), taking bundled credentials.
    pub async fn login_with(&self, credentials: &Credentials) -> Result<(), ConnectionError> {
        let epoch = {
            let mut inner = self.lock();
            if matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                debug!(state = %inner.state, "login ignored, connection already active");
                return Ok(());
            }
            inner.state = ConnectionState::Connecting;
            inner.error = None;
            inner.epoch += 1;
            inner.epoch
        };
        self.emit(ConnectionEvent::StateChanged(ConnectionState::Connecting));

        let options = ConnectOptions {
            url: credentials.bus_url.clone(),
            name: self.client_name(&credentials.username),
            user: credentials.username.clone(),
            pass: credentials.password.clone(),
        };
        info!(
            url = %credentials.bus_url,
            user = %credentials.username,
            "connecting to bus"
        );

        let result = self.connector.connect(&options).await;

        let late = {
            let inner = self.lock();
            if inner.epoch == epoch {
                return self.finish_login(inner, credentials, result);
            }
            result.ok()
        };

        debug!(user = %credentials.username, "login overtaken by logout, discarding result");
        if let Some(late) = late {
            tokio::spawn(teardown(
                ActiveConnection::new(late),
                self.config.teardown_timeout,
            ));
        }
        Err(ConnectionError::Cancelled)
    }

    /// Applies the outcome of a connect attempt that is still current.
    fn finish_login(
        &self,
        mut inner: MutexGuard<'_, ManagerState>,
        credentials: &Credentials,
        result: Result<Arc<dyn BusConnection>, BusError>,
    ) -> Result<(), ConnectionError> {
        match result {
            Ok(bus) => {
                let connection = ActiveConnection::new(bus);
                let identity = Identity {
                    bus_url: credentials.bus_url.clone(),
                    username: credentials.username.clone(),
                };
                inner.connection = Some(connection.clone());
                inner.identity = Some(identity.clone());
                inner.state = ConnectionState::Connected;
                inner.error = None;
                // Sent under the state lock, ordered with logout's `None`.
                self.connection_tx.send_replace(Some(connection.clone()));
                drop(inner);

                info!(
                    connection = connection.id(),
                    user = %identity.username,
                    "connected to bus"
                );
                self.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
                self.emit(ConnectionEvent::LoggedIn(identity));
                Ok(())
            }
            Err(e) => {
                let err = ConnectionError::from(e.clone());
                inner.state = ConnectionState::Error;
                inner.error = Some(err.to_string());
                drop(inner);

                warn!(user = %credentials.username, error = %e, "login failed");
                self.emit(ConnectionEvent::StateChanged(ConnectionState::Error));
                self.emit(ConnectionEvent::LoginFailed {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Logs out: drains and closes the connection (best-effort, bounded),
    /// clears identity and error, and resets the state to `Idle`.
    pub async fn logout(&self) {
        let connection = {
            let mut inner = self.lock();
            inner.epoch += 1;
            let connection = inner.connection.take();
            if let Some(conn) = &connection {
                conn.retire();
                self.connection_tx.send_replace(None);
            }
            connection
        };

        let had_connection = connection.is_some();
        if let Some(conn) = connection {
            info!(connection = conn.id(), "logging out");
            teardown(conn, self.config.teardown_timeout).await;
        }

        let previous = {
            let mut inner = self.lock();
            let previous = inner.state;
            inner.identity = None;
            inner.error = None;
            inner.state = ConnectionState::Idle;
            previous
        };

        if had_connection {
            self.emit(ConnectionEvent::LoggedOut);
        }
        if previous != ConnectionState::Idle {
            self.emit(ConnectionEvent::StateChanged(ConnectionState::Idle));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            trace!("connection event dropped: {e}");
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drains then closes `conn`, each step bounded by `limit`.
/// Failures are logged and otherwise ignored.
async fn teardown(conn: ActiveConnection, limit: Duration) {
    conn.retire();
    let bus = conn.bus();

    match tokio::time::timeout(limit, bus.drain()).await {
        Ok(Ok(())) => debug!(connection = conn.id(), "connection drained"),
        Ok(Err(e)) => warn!(connection = conn.id(), error = %e, "drain failed"),
        Err(_) => warn!(connection = conn.id(), ?limit, "drain timed out"),
    }
    match tokio::time::timeout(limit, bus.close()).await {
        Ok(Ok(())) => debug!(connection = conn.id(), "connection closed"),
        Ok(Err(e)) => warn!(connection = conn.id(), error = %e, "close failed"),
        Err(_) => warn!(connection = conn.id(), ?limit, "close timed out"),
    }
}
