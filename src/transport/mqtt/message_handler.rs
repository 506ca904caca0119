//! Pure routing of MQTT v5 event loop output
//!
//! The pump task turns every polled event into an [`EventRoute`] and acts on
//! the route; keeping the classification pure lets it be tested without a
//! broker.

use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, PubAckReason, SubscribeReasonCode};
use rumqttc::v5::Event;
use rumqttc::Outgoing;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// The broker ended the session
    Disconnected(String),
    /// Subscription acknowledged; `rejected` counts refused filters
    SubscriptionConfirmed { packet_id: u16, rejected: usize },
    /// Our QoS 1 publish went on the wire under `packet_id`
    PublishSent { packet_id: u16 },
    /// Our publish is parked until the in-flight one using `packet_id` is acknowledged
    PublishDeferred { packet_id: u16 },
    /// The broker answered one of our publishes; `rejection` carries the refusal reason
    PublishAcknowledged {
        packet_id: u16,
        rejection: Option<String>,
    },
    /// Infrastructure event (PingResp, UnsubAck, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Classify one event loop event
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
            Packet::Publish(publish) => EventRoute::MessageReceived {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.clone(),
            },
            Packet::Disconnect(disconnect) => {
                EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
            }
            Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                packet_id: suback.pkid,
                rejected: count_rejected(&suback.return_codes),
            },
            Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                packet_id: puback.pkid,
                rejection: puback_rejection(puback.reason),
            },
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        },
        Event::Outgoing(Outgoing::Publish(packet_id)) => EventRoute::PublishSent {
            packet_id: *packet_id,
        },
        Event::Outgoing(Outgoing::AwaitAck(packet_id)) => EventRoute::PublishDeferred {
            packet_id: *packet_id,
        },
        Event::Outgoing(_) => EventRoute::OutgoingEvent,
    }
}

/// Refusal reason carried by a PubAck, if the broker did not accept the message
pub fn puback_rejection(reason: PubAckReason) -> Option<String> {
    match reason {
        PubAckReason::Success | PubAckReason::NoMatchingSubscribers => None,
        refused => Some(format!("{refused:?}")),
    }
}

/// Number of subscription filters the broker refused
pub fn count_rejected(codes: &[SubscribeReasonCode]) -> usize {
    codes
        .iter()
        .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
        .count()
}
