use crate::config::Config;
use crate::discovery;
use crate::models::{AlertEvent, Observation};
use crate::topic_tracker::TopicTracker;
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill,
    MqttOptions, Packet, QoS, SubscribeFilter,
};
use serde_json::json;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::{sleep, timeout, timeout_at, Duration, Instant};
use tokio_util::sync::CancellationToken;

const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
const INITIAL_LAB_VALUE: &str = "False";

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("could not connect to MQTT broker {broker} within {timeout:?}: {last_error}")]
    ConnectTimeout {
        broker: String,
        timeout: Duration,
        last_error: String,
    },
    #[error("MQTT broker {broker} rejected the credentials of user '{user}' ({code:?})")]
    CredentialsRejected {
        broker: String,
        user: String,
        code: ConnectReturnCode,
    },
    #[error("giving up after {0} consecutive failed reconnect attempts")]
    RetriesExhausted(i32),
}

/// Watches the lab topics on a single broker connection.
pub struct MqttService {
    config: Config,
    client_id: String,
    lab_topics: Vec<String>,
}

fn is_credential_rejection(code: ConnectReturnCode) -> bool {
    matches!(
        code,
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
    )
}

fn next_retry_interval(current: Duration) -> Duration {
    (current * 2).min(MAX_RETRY_INTERVAL)
}

fn status_payload(status: &str, details: &str) -> String {
    json!({ "status": status, "details": details }).to_string()
}

impl MqttService {
    pub fn new(config: Config, client_id: String) -> Self {
        let lab_topics = config.lab_topics();
        Self {
            config,
            client_id,
            lab_topics,
        }
    }

    fn broker(&self) -> String {
        format!("{}:{}", self.config.mqtt_host, self.config.mqtt_port)
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(
            self.client_id.clone(),
            self.config.mqtt_host.clone(),
            self.config.mqtt_port,
        );
        mqtt_options.set_keep_alive(Duration::from_secs(60));
        // Persistent session so the broker queues QoS 1 messages while we reconnect.
        mqtt_options.set_clean_session(false);
        mqtt_options.set_credentials(&self.config.mqtt_username, &self.config.mqtt_password);
        mqtt_options.set_last_will(LastWill::new(
            self.config.status_topic(),
            status_payload("offline", "Connection to lab watcher lost."),
            QoS::AtLeastOnce,
            true,
        ));
        mqtt_options
    }

    /// Room for everything queued from a single ConnAck: the subscription, the
    /// status, the lab seeds and the discovery configs.
    fn request_capacity(&self) -> usize {
        self.lab_topics.len() + 32
    }

    /// Connect, watch the lab topics until `shutdown` fires, then disconnect.
    pub async fn run(
        &self,
        tracker: &mut TopicTracker,
        shutdown: CancellationToken,
    ) -> Result<(), WatchError> {
        info!("Starting MQTT service for broker {}...", self.broker());

        let (client, mut eventloop) = AsyncClient::new(self.mqtt_options(), self.request_capacity());

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Shutdown requested before the broker connection was established.");
                return Ok(());
            }
            connected = self.await_connection(&client, &mut eventloop) => connected?,
        }

        let initial_retry_interval = self.config.retry_interval();
        let max_retries = self.config.mqtt_max_retries;
        let mut retry_interval = initial_retry_interval;
        let mut retries = 0;
        let mut connected = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.disconnect(&client, &mut eventloop).await;
                    return Ok(());
                }
                polled = eventloop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        info!("Reconnected to MQTT broker {}.", self.broker());
                        connected = true;
                        retries = 0;
                        retry_interval = initial_retry_interval;
                        self.on_connected(&client, &ack, false);
                    }
                    Ok(event) => self.handle_event(&client, tracker, event),
                    Err(ConnectionError::ConnectionRefused(code)) if is_credential_rejection(code) => {
                        return Err(self.credentials_rejected(code));
                    }
                    Err(e) => {
                        if connected {
                            warn!("Lost connection to MQTT broker {}: {}", self.broker(), e);
                        } else {
                            debug!("Reconnect attempt failed: {}", e);
                        }
                        connected = false;

                        if max_retries != -1 && retries >= max_retries {
                            error!("Maximum number of retries ({}) reached. Stopping the service.", max_retries);
                            return Err(WatchError::RetriesExhausted(retries));
                        }
                        retries += 1;

                        warn!("Retrying in {:?} (attempt {})...", retry_interval, retries);
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                info!("Shutdown requested while disconnected.");
                                return Ok(());
                            }
                            _ = sleep(retry_interval) => {}
                        }
                        retry_interval = next_retry_interval(retry_interval);
                    }
                }
            }
        }
    }

    /// Poll until the first successful ConnAck, retrying refused or dropped
    /// connections until the connect timeout runs out.
    async fn await_connection(
        &self,
        client: &AsyncClient,
        eventloop: &mut EventLoop,
    ) -> Result<(), WatchError> {
        let connect_timeout = self.config.connect_timeout();
        let deadline = Instant::now() + connect_timeout;
        let mut last_error = "no response from broker".to_string();
        let timed_out = |last_error: String| WatchError::ConnectTimeout {
            broker: self.broker(),
            timeout: connect_timeout,
            last_error,
        };

        debug!("Configuring MQTT broker at {}...", self.broker());

        loop {
            match timeout_at(deadline, eventloop.poll()).await {
                Err(_) => return Err(timed_out(last_error)),
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    info!("Connected to {}.", self.broker());
                    self.on_connected(client, &ack, true);
                    return Ok(());
                }
                Ok(Ok(event)) => debug!("Event before ConnAck: {:?}", event),
                Ok(Err(ConnectionError::ConnectionRefused(code))) if is_credential_rejection(code) => {
                    return Err(self.credentials_rejected(code));
                }
                Ok(Err(e)) => {
                    warn!("Failed to connect to {}: {}", self.broker(), e);
                    last_error = e.to_string();
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(timed_out(last_error));
                    }
                    sleep(self.config.retry_interval().min(remaining)).await;
                }
            }
        }
    }

    fn credentials_rejected(&self, code: ConnectReturnCode) -> WatchError {
        WatchError::CredentialsRejected {
            broker: self.broker(),
            user: self.config.mqtt_username.clone(),
            code,
        }
    }

    /// Queue the subscription and status for a fresh connection. Labs are
    /// seeded and discovery configs announced only on the first connection.
    fn on_connected(&self, client: &AsyncClient, ack: &ConnAck, first: bool) {
        debug!("ConnAck received (session present: {}).", ack.session_present);

        let filters = self
            .lab_topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtLeastOnce));
        match client.try_subscribe_many(filters) {
            Ok(_) => info!("Subscribed to {} lab topic(s).", self.lab_topics.len()),
            Err(e) => error!("Failed to subscribe to lab topics: {}", e),
        }

        self.try_publish(
            client,
            &self.config.status_topic(),
            status_payload("online", "Lab watcher is running."),
            true,
        );

        if !first {
            return;
        }

        if self.config.seed_labs {
            for topic in &self.lab_topics {
                self.try_publish(client, topic, INITIAL_LAB_VALUE.to_string(), false);
            }
        }

        if self.config.discovery {
            for (topic, payload) in discovery::demo_device_messages() {
                self.try_publish(client, &topic, payload, false);
            }
        }
    }

    fn try_publish(&self, client: &AsyncClient, topic: &str, payload: String, retain: bool) {
        match client.try_publish(topic, QoS::AtLeastOnce, retain, payload.clone()) {
            Ok(_) => debug!("Set topic '{}' to '{}'.", topic, payload),
            Err(e) => error!("Failed to publish to topic '{}': {}", topic, e),
        }
    }

    fn handle_event(&self, client: &AsyncClient, tracker: &mut TopicTracker, event: Event) {
        match event {
            Event::Incoming(Packet::Publish(publish)) => {
                self.handle_publish(client, tracker, &publish.topic, &publish.payload);
            }
            Event::Incoming(Packet::SubAck(suback)) => {
                debug!("Subscription acknowledged: {:?}", suback.return_codes);
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Broker sent DISCONNECT.");
            }
            Event::Outgoing(_) => {}
            _ => {
                debug!("Unhandled event: {:?}", event);
            }
        }
    }

    /// Feed one inbound message to the tracker and raise an alert on change.
    /// Returns the alert that was raised, if any.
    pub(crate) fn handle_publish(
        &self,
        client: &AsyncClient,
        tracker: &mut TopicTracker,
        topic: &str,
        payload: &[u8],
    ) -> Option<AlertEvent> {
        if !self.lab_topics.iter().any(|lab| lab == topic) {
            warn!("Unknown topic received: {}", topic);
            return None;
        }

        match tracker.observe(topic, payload, OffsetDateTime::now_utc()) {
            Err(e) => {
                warn!("Skipping malformed message: {}", e);
                None
            }
            Ok(Observation::Seeded) => {
                info!("Received initial value '{}' from '{}'.", String::from_utf8_lossy(payload), topic);
                None
            }
            Ok(Observation::Unchanged) => {
                if let Some(state) = tracker.get(topic) {
                    debug!(
                        "Topic '{}' unchanged at '{}' (seen {}).",
                        state.topic, state.value, state.updated_at
                    );
                }
                None
            }
            Ok(Observation::Changed(alert)) => {
                self.raise_alert(client, &alert);
                Some(alert)
            }
        }
    }

    fn raise_alert(&self, client: &AsyncClient, alert: &AlertEvent) {
        warn!(
            "ALERT: topic '{}' changed from '{}' to '{}' at {}.",
            alert.topic, alert.old_value, alert.new_value, alert.timestamp
        );

        let Some(alert_topic) = &self.config.alert_topic else {
            return;
        };
        match serde_json::to_string(alert) {
            Ok(payload) => {
                if let Err(e) = client.try_publish(alert_topic, QoS::AtLeastOnce, false, payload) {
                    error!("Failed to publish alert to '{}': {}", alert_topic, e);
                }
            }
            Err(e) => error!("Failed to serialise alert for '{}': {}", alert.topic, e),
        }
    }

    /// Mark the watcher offline and send DISCONNECT, driving the event loop
    /// until the broker closes the connection or the grace period ends.
    async fn disconnect(&self, client: &AsyncClient, eventloop: &mut EventLoop) {
        info!("Disconnecting from MQTT broker {}...", self.broker());

        self.try_publish(
            client,
            &self.config.status_topic(),
            status_payload("offline", "Lab watcher is shutting down."),
            true,
        );
        if let Err(e) = client.try_disconnect() {
            error!("Failed to queue DISCONNECT: {}", e);
            return;
        }

        let drained = timeout(DISCONNECT_GRACE, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        })
        .await;

        match drained {
            Ok(()) => info!("Disconnected from MQTT broker."),
            Err(_) => warn!("Broker did not acknowledge shutdown within {:?}.", DISCONNECT_GRACE),
        }
    }
}
