//! Pure session setup for the MQTT transport
//!
//! Option building and CONNACK interpretation, kept free of I/O so they can
//! be tested without a broker.

use crate::error::RefusalCode;
use crate::transport::SessionOptions;
use rumqttc::{ConnectReturnCode, MqttOptions, Transport as RumqttcTransport};

/// Device bridge message size limit
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Build rumqttc options for a single session attempt
///
/// `trust_anchors` is the PEM bundle for TLS brokers and is ignored for
/// plaintext ones.
pub fn configure_mqtt_options(
    options: &SessionOptions,
    trust_anchors: Option<Vec<u8>>,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(
        options.client_id.clone(),
        options.broker.host.clone(),
        options.broker.port,
    );

    mqtt_options.set_credentials(options.username.clone(), options.password.clone());
    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_session(true);
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    if options.broker.tls {
        if let Some(ca) = trust_anchors {
            mqtt_options.set_transport(RumqttcTransport::tls(ca, None, None));
        }
    }

    mqtt_options
}

/// Encoded size of a QoS 1 PUBLISH, as rumqttc measures it against
/// [`MAX_PACKET_SIZE`] before writing
pub fn publish_packet_size(topic: &str, payload_len: usize) -> usize {
    // topic length prefix + topic + packet id + payload
    let remaining = 2 + topic.len() + 2 + payload_len;
    let length_bytes = match remaining {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    };
    1 + length_bytes + remaining
}

/// Packets over the limit are dropped by the event loop, which then tears
/// the session down; they have to be refused up front
pub fn exceeds_packet_limit(topic: &str, payload_len: usize) -> bool {
    publish_packet_size(topic, payload_len) > MAX_PACKET_SIZE
}

/// Map a CONNACK return code; `None` means the session was accepted
pub fn refusal_from_return_code(code: ConnectReturnCode) -> Option<RefusalCode> {
    match code {
        ConnectReturnCode::Success => None,
        ConnectReturnCode::RefusedProtocolVersion => Some(RefusalCode::UnacceptableProtocolVersion),
        ConnectReturnCode::BadClientId => Some(RefusalCode::IdentifierRejected),
        ConnectReturnCode::ServiceUnavailable => Some(RefusalCode::ServerUnavailable),
        ConnectReturnCode::BadUserNamePassword => Some(RefusalCode::BadUserNameOrPassword),
        ConnectReturnCode::NotAuthorized => Some(RefusalCode::NotAuthorized),
    }
}
