//! Query facade for presentation code.

use std::sync::Arc;

use tracing::info;

use tilestion_connection::{ConnectionError, ConnectionManager, ConnectionState, Identity};
use tilestion_protocol::channels::DEFAULT_CHANNELS;
use tilestion_protocol::{TelemetryValue, parse_value};

use crate::aggregator::{
    AggregatorConfig, ChannelInterest, ChannelSpec, Observation, TelemetryAggregator,
};

/// A connection manager plus an aggregator tracking a fixed set of channels.
///
/// This is the whole surface a UI needs: log in and out, read the newest
/// value or the retained series of a channel, and observe coalesced updates.
pub struct TelemetrySession {
    manager: Arc<ConnectionManager>,
    aggregator: TelemetryAggregator<TelemetryValue>,
    _interests: Vec<ChannelInterest<TelemetryValue>>,
}

impl TelemetrySession {
    /// Session over the default `vector` and `value` channels.
    pub fn new(manager: Arc<ConnectionManager>, config: AggregatorConfig) -> Self {
        let channels: Vec<ChannelSpec> = DEFAULT_CHANNELS
            .iter()
            .map(|(id, subject)| ChannelSpec::with_subject(*id, *subject))
            .collect();
        Self::with_channels(manager, config, channels)
    }

    /// Session over an explicit channel list.
    ///
    /// # Panics
    ///
    /// Panics if `config.capacity` is zero or when called outside a tokio
    /// runtime.
    pub fn with_channels(
        manager: Arc<ConnectionManager>,
        config: AggregatorConfig,
        channels: impl IntoIterator<Item = ChannelSpec>,
    ) -> Self {
        let aggregator = TelemetryAggregator::new(config, parse_value);
        let mut interests = Vec::new();
        for spec in channels {
            let id = spec.id.clone();
            // Nothing is bound yet, so registering cannot subscribe or fail.
            let _ = aggregator.register(spec);
            interests.push(aggregator.track(&id));
        }
        aggregator.attach(&manager);
        Self {
            manager,
            aggregator,
            _interests: interests,
        }
    }

    pub async fn login(
        &self,
        bus_url: &str,
        username: &str,
        password: &str,
    ) -> Result<(), ConnectionError> {
        self.manager.login(bus_url, username, password).await?;
        self.aggregator.sync_connection(self.manager.connection());
        Ok(())
    }

    /// Log out and tear down every channel subscription. Retained values stay
    /// queryable.
    pub async fn logout(&self) {
        self.manager.logout().await;
        self.aggregator.sync_connection(self.manager.connection());
        info!("session logged out");
    }

    pub fn latest(&self, channel: &str) -> Option<TelemetryValue> {
        self.aggregator.latest(channel)
    }

    pub fn series(&self, channel: &str) -> Vec<TelemetryValue> {
        self.aggregator.series(channel)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Message of the last failed login, cleared by the next attempt.
    pub fn last_error(&self) -> Option<String> {
        self.manager.last_error()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.manager.identity()
    }

    pub fn observe<F>(&self, channel: &str, observer: F) -> Observation<TelemetryValue>
    where
        F: Fn(&str, &TelemetryValue) + Send + Sync + 'static,
    {
        self.aggregator.observe(channel, observer)
    }

    pub fn aggregator(&self) -> &TelemetryAggregator<TelemetryValue> {
        &self.aggregator
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use tilestion_bus::MemoryBus;
    use tilestion_connection::LOGIN_REJECTED_MESSAGE;
    use tilestion_protocol::Vector3;
    use tilestion_protocol::channels::{
        VALUE_CHANNEL, VALUE_SUBJECT, VECTOR_CHANNEL, VECTOR_SUBJECT,
    };

    const URL: &str = "nats://localhost:4222";

    fn session(bus: &MemoryBus) -> TelemetrySession {
        let manager = Arc::new(ConnectionManager::new(Arc::new(bus.clone())));
        TelemetrySession::new(manager, AggregatorConfig::default())
    }

    #[tokio::test]
    async fn end_to_end_value_channel() {
        let bus = MemoryBus::new().with_late_delivery().with_user("alice", "secret");
        let session = session(&bus);

        session.login(URL, "alice", "secret").await.unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Connected);

        for payload in [r#"{"value": 1}"#, r#"{"value": 2}"#, r#"{"value": 3}"#] {
            assert_eq!(bus.publish(VALUE_SUBJECT, payload), 1);
        }

        assert_eq!(session.latest(VALUE_CHANNEL), Some(TelemetryValue::Scalar(3.0)));
        assert_eq!(
            session.series(VALUE_CHANNEL),
            vec![
                TelemetryValue::Scalar(1.0),
                TelemetryValue::Scalar(2.0),
                TelemetryValue::Scalar(3.0),
            ]
        );

        session.logout().await;

        assert_eq!(session.connection_state(), ConnectionState::Idle);
        assert_eq!(session.latest(VALUE_CHANNEL), Some(TelemetryValue::Scalar(3.0)));
        assert!(bus.publish_to_retired(VALUE_SUBJECT, r#"{"value": 4}"#) >= 1);
        assert_eq!(bus.publish(VALUE_SUBJECT, r#"{"value": 5}"#), 0);
        assert_eq!(session.series(VALUE_CHANNEL).len(), 3);
        assert_eq!(session.latest(VALUE_CHANNEL), Some(TelemetryValue::Scalar(3.0)));
    }

    #[tokio::test]
    async fn vector_channel_uses_its_subject() {
        let bus = MemoryBus::new();
        let session = session(&bus);
        session.login(URL, "alice", "").await.unwrap();

        bus.publish(VECTOR_SUBJECT, r#"{"value": {"x": 1.0, "y": 2.0, "z": 3.0}}"#);

        assert_eq!(
            session.latest(VECTOR_CHANNEL),
            Some(TelemetryValue::Vector(Vector3::new(1.0, 2.0, 3.0)))
        );
        assert_eq!(session.latest(VALUE_CHANNEL), None);
    }

    #[tokio::test]
    async fn rejected_login_is_queryable() {
        let bus = MemoryBus::new().with_user("alice", "secret");
        let session = session(&bus);

        let err = session.login(URL, "alice", "wrong").await.unwrap_err();

        assert_eq!(err, ConnectionError::Rejected);
        assert_eq!(session.connection_state(), ConnectionState::Error);
        assert_eq!(session.last_error().as_deref(), Some(LOGIN_REJECTED_MESSAGE));
        assert!(!session.aggregator().is_subscribed(VALUE_CHANNEL));
    }

    #[tokio::test]
    async fn default_channels_are_known_before_login() {
        let bus = MemoryBus::new();
        let session = session(&bus);

        assert_eq!(
            session.aggregator().channel_ids(),
            vec![VALUE_CHANNEL.to_string(), VECTOR_CHANNEL.to_string()]
        );
        assert_eq!(session.latest(VALUE_CHANNEL), None);
        assert!(session.series(VECTOR_CHANNEL).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_coalesced_update() {
        let bus = MemoryBus::new();
        let session = session(&bus);
        session.login(URL, "alice", "").await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer_seen = Arc::clone(&seen);
        let _observation =
            session.observe(VALUE_CHANNEL, move |channel: &str, v: &TelemetryValue| {
                observer_seen.lock().unwrap().push((channel.to_owned(), *v));
            });

        for i in 1..=5 {
            bus.publish(VALUE_SUBJECT, format!(r#"{{"value": {i}}}"#));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(VALUE_CHANNEL.to_string(), TelemetryValue::Scalar(5.0))]
        );
        assert_eq!(session.series(VALUE_CHANNEL).len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn no_notification_after_logout() {
        let bus = MemoryBus::new();
        let session = session(&bus);
        session.login(URL, "alice", "").await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer_seen = Arc::clone(&seen);
        let _observation = session.observe(VALUE_CHANNEL, move |_: &str, v: &TelemetryValue| {
            observer_seen.lock().unwrap().push(*v);
        });

        assert_eq!(bus.publish(VALUE_SUBJECT, r#"{"value": 7}"#), 1);
        session.logout().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(session.latest(VALUE_CHANNEL), Some(TelemetryValue::Scalar(7.0)));
    }

    #[tokio::test]
    async fn relogin_resubscribes_every_channel() {
        let bus = MemoryBus::new();
        let session = session(&bus);

        session.login(URL, "alice", "").await.unwrap();
        session.logout().await;
        session.login(URL, "bob", "").await.unwrap();

        assert_eq!(bus.active_subscriptions(VALUE_SUBJECT), 1);
        assert_eq!(bus.active_subscriptions(VECTOR_SUBJECT), 1);
        assert_eq!(bus.connection_names(), vec!["nats-client-bob".to_string()]);
        assert_eq!(session.identity().map(|i| i.username).as_deref(), Some("bob"));
    }
}
