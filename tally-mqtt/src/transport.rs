//! MQTT v5 transport feeding the counter registry.
//!
//! Every counter's topic filter is subscribed with the counter's
//! subscription id. The broker echoes the ids of all matching subscriptions
//! in each publish, so routing an event is a lookup by id rather than a
//! second round of topic matching.
//!
//! The client keeps a broker-side session for [`SESSION_EXPIRY_SECS`], so a
//! short reconnect does not lose queued state. Subscriptions are still
//! renewed on every connection acknowledgement, in case the session expired
//! in between. Connection errors are retried with exponential backoff; after
//! [`MAX_CONSECUTIVE_FAILURES`] failures without a successful connect in
//! between the transport gives up.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::{ConnectProperties, ConnectReturnCode, Packet, Publish, SubscribeProperties};
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions};
use tally::registry::{CounterRegistry, SubscriptionId};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Port used when a plain broker URL does not name one.
pub const DEFAULT_PORT: u16 = 1883;

/// Port used when a TLS broker URL does not name one.
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// How long the broker keeps the session after the connection drops.
pub const SESSION_EXPIRY_SECS: u32 = 3600;

/// Failed connection attempts tolerated in a row.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Errors that end the transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The broker URL could not be understood.
    #[error("invalid broker url '{url}': {reason}")]
    InvalidUrl {
        /// The URL as configured.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The connection kept failing.
    #[error("giving up after {attempts} consecutive connection failures: {source}")]
    RetriesExhausted {
        /// Number of failures in a row.
        attempts: u32,
        /// The last connection error.
        #[source]
        source: ConnectionError,
    },
}

/// How to reach the broker.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Broker URL, e.g. `mqtt://broker.lan:1883`.
    pub url: String,
    /// User name; empty for anonymous access.
    pub user: String,
    /// Password.
    pub password: String,
    /// MQTT client identifier.
    pub client_id: String,
}

/// Where the broker listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Whether to connect over TLS.
    pub tls: bool,
}

/// Parses a broker URL.
///
/// Plain TCP: `mqtt://`, `tcp://`, or no scheme at all. TLS: `mqtts://`,
/// `ssl://`, `tls://`. The port defaults to [`DEFAULT_PORT`] or
/// [`DEFAULT_TLS_PORT`].
///
/// # Errors
///
/// Returns [`TransportError::InvalidUrl`] for unsupported schemes (websocket
/// brokers included), a missing host or an invalid port.
pub fn parse_broker_url(url: &str) -> Result<BrokerAddress, TransportError> {
    let invalid = |reason: &str| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let (rest, tls) = match url.split_once("://") {
        Some(("mqtt" | "tcp", rest)) => (rest, false),
        Some(("mqtts" | "ssl" | "tls", rest)) => (rest, true),
        Some((scheme, _)) => {
            return Err(invalid(&format!(
                "unsupported scheme '{scheme}', expected one of mqtt, tcp, mqtts, ssl, tls"
            )));
        }
        None => (url, false),
    };
    let authority = rest.split('/').next().unwrap_or_default();

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| invalid(&format!("bad port '{port}'")))?;
            (host, port)
        }
        None if tls => (authority, DEFAULT_TLS_PORT),
        None => (authority, DEFAULT_PORT),
    };
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        tls,
    })
}

fn mqtt_options(options: &BrokerOptions, address: &BrokerAddress) -> MqttOptions {
    let mut mqtt = MqttOptions::new(options.client_id.clone(), address.host.clone(), address.port);
    mqtt.set_keep_alive(KEEP_ALIVE);
    mqtt.set_clean_start(false);
    let mut props = ConnectProperties::new();
    props.session_expiry_interval = Some(SESSION_EXPIRY_SECS);
    mqtt.set_connect_properties(props);
    if address.tls {
        mqtt.set_transport(rumqttc::Transport::tls_with_default_config());
    }
    if !options.user.is_empty() {
        mqtt.set_credentials(options.user.clone(), options.password.clone());
    }
    mqtt
}

/// Exponential delay between reconnect attempts with a failure budget.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    max_failures: u32,
    failures: u32,
}

impl Backoff {
    fn new(initial: Duration, max: Duration, max_failures: u32) -> Self {
        Self {
            initial,
            max,
            max_failures,
            failures: 0,
        }
    }

    /// Records a failure; `None` once the budget is spent.
    fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures > self.max_failures {
            return None;
        }
        let factor = 2u32.saturating_pow(self.failures - 1);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }

    fn reset(&mut self) {
        self.failures = 0;
    }

    fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_secs(30),
            MAX_CONSECUTIVE_FAILURES,
        )
    }
}

/// The broker connection and its event loop.
pub struct Transport {
    client: AsyncClient,
    eventloop: EventLoop,
    registry: Arc<CounterRegistry>,
    backoff: Backoff,
}

impl Transport {
    /// Prepares a connection. Nothing is sent until [`run`](Self::run).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if the broker URL is invalid.
    pub fn new(
        options: &BrokerOptions,
        registry: Arc<CounterRegistry>,
    ) -> Result<Self, TransportError> {
        let address = parse_broker_url(&options.url)?;
        let mqtt = mqtt_options(options, &address);

        // Room for one subscribe per counter on top of the usual traffic.
        let capacity = registry.len() + 10;
        let (client, eventloop) = AsyncClient::new(mqtt, capacity);

        tracing::info!(
            host = %address.host,
            port = address.port,
            tls = address.tls,
            client_id = %options.client_id,
            "broker configured"
        );
        Ok(Self {
            client,
            eventloop,
            registry,
            backoff: Backoff::default(),
        })
    }

    /// Drives the connection until `cancel` fires or the retry budget is
    /// spent.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::RetriesExhausted`] if the broker stays
    /// unreachable.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), TransportError> {
        loop {
            let polled = tokio::select! {
                () = cancel.cancelled() => break,
                polled = self.eventloop.poll() => polled,
            };

            match polled {
                Ok(event) => self.handle_event(event),
                Err(e) => {
                    let Some(delay) = self.backoff.next_delay() else {
                        tracing::error!("connection failed {} times in a row", self.backoff.failures() - 1);
                        return Err(TransportError::RetriesExhausted {
                            attempts: self.backoff.failures() - 1,
                            source: e,
                        });
                    };
                    tracing::warn!(
                        attempt = self.backoff.failures(),
                        "connection error, retrying in {:.1}s: {e}",
                        delay.as_secs_f64()
                    );
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.disconnect().await;
        Ok(())
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    tracing::info!(session_present = ack.session_present, "connected to broker");
                    self.backoff.reset();
                    self.subscribe_all();
                } else {
                    tracing::warn!(code = ?ack.code, "broker refused connection");
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                route_publish(&self.registry, &publish);
            }
            Event::Incoming(Packet::Disconnect(disconnect)) => {
                tracing::warn!(reason = ?disconnect.reason_code, "disconnected by broker");
            }
            Event::Incoming(packet) => tracing::trace!(?packet, "incoming"),
            Event::Outgoing(outgoing) => tracing::trace!(?outgoing, "outgoing"),
        }
    }

    fn subscribe_all(&self) {
        for (id, counter) in self.registry.iter() {
            let properties = SubscribeProperties {
                id: Some(id as usize),
                user_properties: Vec::new(),
            };
            match self.client.try_subscribe_with_properties(
                counter.base_label(),
                QoS::AtMostOnce,
                properties,
            ) {
                Ok(()) => tracing::info!(id, topic = counter.base_label(), "subscribing"),
                Err(e) => {
                    tracing::error!(id, topic = counter.base_label(), "subscribe failed: {e}");
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::warn!("error sending disconnect: {e}");
            return;
        }

        // The disconnect is only sent while the event loop is polled.
        let drained = tokio::time::timeout(DISCONNECT_GRACE, async {
            while self.eventloop.poll().await.is_ok() {}
        })
        .await;
        if drained.is_err() {
            tracing::debug!("broker did not close the connection in time");
        }
        tracing::info!("disconnected from broker");
    }
}

/// Hands a publish to every counter whose subscription it matched.
///
/// Returns the number of counters the event was routed to.
fn route_publish(registry: &CounterRegistry, publish: &Publish) -> usize {
    let topic = String::from_utf8_lossy(&publish.topic);
    let ids = publish
        .properties
        .as_ref()
        .map(|p| p.subscription_identifiers.as_slice())
        .unwrap_or_default();
    route(registry, &topic, ids)
}

fn route(registry: &CounterRegistry, topic: &str, ids: &[usize]) -> usize {
    if ids.is_empty() {
        tracing::debug!(%topic, "publish without subscription identifier");
        return 0;
    }

    ids.iter()
        .filter(|raw| match SubscriptionId::try_from(**raw) {
            Ok(id) => registry.dispatch(id, topic).is_ok(),
            Err(_) => {
                tracing::warn!(%topic, id = **raw, "subscription identifier out of range");
                false
            }
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally::config::TopicConfig;
    use tally::counter::Outputs;

    fn address(host: &str, port: u16, tls: bool) -> BrokerAddress {
        BrokerAddress {
            host: host.to_string(),
            port,
            tls,
        }
    }

    fn broker(url: &str) -> BrokerOptions {
        BrokerOptions {
            url: url.to_string(),
            user: String::new(),
            password: String::new(),
            client_id: "test".to_string(),
        }
    }

    #[test]
    fn test_parse_broker_url() {
        assert_eq!(
            parse_broker_url("mqtt://broker.lan:1884").unwrap(),
            address("broker.lan", 1884, false)
        );
        assert_eq!(
            parse_broker_url("tcp://10.0.0.2").unwrap(),
            address("10.0.0.2", DEFAULT_PORT, false)
        );
        assert_eq!(
            parse_broker_url("localhost:1883").unwrap(),
            address("localhost", 1883, false)
        );
        assert_eq!(
            parse_broker_url("mqtt://broker/").unwrap(),
            address("broker", DEFAULT_PORT, false)
        );
    }

    #[test]
    fn test_parse_tls_broker_url() {
        assert_eq!(
            parse_broker_url("mqtts://broker.lan").unwrap(),
            address("broker.lan", DEFAULT_TLS_PORT, true)
        );
        assert_eq!(
            parse_broker_url("ssl://broker.lan:8884").unwrap(),
            address("broker.lan", 8884, true)
        );
        assert_eq!(
            parse_broker_url("tls://broker.lan").unwrap(),
            address("broker.lan", DEFAULT_TLS_PORT, true)
        );
    }

    #[test]
    fn test_parse_broker_url_rejects() {
        assert!(parse_broker_url("http://broker").is_err());
        assert!(parse_broker_url("mqtt://:1883").is_err());
        assert!(parse_broker_url("mqtt://broker:port").is_err());
        assert!(parse_broker_url("").is_err());

        let err = parse_broker_url("ws://broker").unwrap_err();
        assert!(err.to_string().contains("expected one of mqtt, tcp, mqtts, ssl, tls"));
    }

    #[test]
    fn test_options_keep_session() {
        let mqtt = mqtt_options(&broker("mqtt://broker"), &address("broker", 1883, false));
        assert!(!mqtt.clean_start());
        assert!(matches!(mqtt.transport(), rumqttc::Transport::Tcp));
    }

    #[test]
    fn test_options_use_tls_for_tls_urls() {
        let mqtt = mqtt_options(&broker("mqtts://broker"), &address("broker", 8883, true));
        assert!(matches!(mqtt.transport(), rumqttc::Transport::Tls(_)));
        assert_eq!(mqtt.broker_address(), ("broker".to_string(), 8883));
    }

    #[test]
    fn test_backoff_budget() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 4);

        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(5)));
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    fn registry() -> CounterRegistry {
        let topics = vec![TopicConfig::new("a/#"), TopicConfig::new("+/x")];
        CounterRegistry::from_topics(&topics, &Outputs::memory())
    }

    #[test]
    fn test_route_to_every_matching_subscription() {
        let registry = registry();

        assert_eq!(route(&registry, "a/x", &[1, 2]), 2);
        assert_eq!(route(&registry, "a/y", &[1]), 1);

        assert_eq!(registry.get(1).unwrap().window_count("a/x"), Some(1));
        assert_eq!(registry.get(1).unwrap().window_count("a/y"), Some(1));
        assert_eq!(registry.get(2).unwrap().window_count("a/x"), Some(1));
    }

    #[test]
    fn test_route_drops_unknown_ids() {
        let registry = registry();

        assert_eq!(route(&registry, "a/x", &[]), 0);
        assert_eq!(route(&registry, "a/x", &[7]), 0);
        assert_eq!(route(&registry, "a/x", &[usize::MAX]), 0);
        assert!(registry.get(1).unwrap().window_counts().is_empty());
    }

    #[test]
    fn test_invalid_url_fails_early() {
        let err = Transport::new(&broker("ws://broker"), Arc::new(registry()))
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::InvalidUrl { .. }));
    }
}
