//! Pure MQTT option and topic construction
//!
//! Everything here is side-effect free apart from reading credential
//! environment variables, so it can be unit tested without a broker.

use crate::config::TransportSection;
use crate::transport::{SessionIdentity, TransportError};
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;

/// Broker-side session lifetime once the client goes away
const SESSION_EXPIRY_SECS: u32 = 24 * 60 * 60;

/// Largest packet accepted from the broker
const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Shortest keep-alive rumqttc accepts; `set_keep_alive` panics below it
const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Build MQTT options for `identity` from the transport section
pub fn configure_mqtt_options(
    identity: &SessionIdentity,
    config: &TransportSection,
) -> Result<MqttOptions, TransportError> {
    let (host, port, tls) = parse_broker_url(&config.url)?;

    // The client id is stable across reconnects so the broker resumes the session
    let mut mqtt_options = MqttOptions::new(identity.client_id.clone(), host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some((username, password)) = config.credentials() {
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(keep_alive(config));
    mqtt_options.set_clean_start(false);
    mqtt_options.set_session_expiry_interval(Some(SESSION_EXPIRY_SECS));
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    Ok(mqtt_options)
}

/// Split a broker URL into host, port and whether TLS is required
pub fn parse_broker_url(raw: &str) -> Result<(String, u16, bool), TransportError> {
    let url = Url::parse(raw).map_err(|_| TransportError::InvalidUrl(raw.to_string()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(TransportError::InvalidUrl(raw.to_string())),
    };
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl(raw.to_string()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok((host.to_string(), port, tls))
}

/// Keep-alive window: the broker is declared gone after `max_ping_out`
/// missed probes spaced `ping_interval` apart
///
/// MQTT keep-alive has one second granularity and rumqttc enforces a five
/// second floor, so shorter windows are rounded up to that.
pub fn keep_alive(config: &TransportSection) -> Duration {
    let window = config
        .ping_interval()
        .saturating_mul(config.max_ping_out.max(1));
    let secs = u64::try_from(window.as_millis().div_ceil(1000)).unwrap_or(u64::MAX);
    Duration::from_secs(secs.max(MIN_KEEP_ALIVE_SECS))
}

/// Subscription filter for `topic`, using a shared subscription for queue groups
pub fn topic_filter(topic: &str, queue_group: Option<&str>) -> String {
    match queue_group {
        Some(group) => format!("$share/{group}/{topic}"),
        None => topic.to_string(),
    }
}

/// Whether an incoming `topic` matches subscription `filter` (`+` and `#` wildcards)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
