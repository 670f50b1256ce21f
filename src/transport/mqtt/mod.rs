//! MQTT 3.1.1 transport for the device bridge
//!
//! Split the same way as the rest of the transport layer:
//!
//! - [`connection`] - pure option building and CONNACK interpretation
//! - [`client`] - rumqttc client, event loop task and delivery correlation
//!
//! # Usage
//!
//! ```rust,no_run
//! use iotcore_north::client::NorthClient;
//! use iotcore_north::config::NorthConfig;
//! use iotcore_north::transport::MqttTransport;
//!
//! # tokio_test::block_on(async {
//! let config = NorthConfig::load_from_file("north.toml".as_ref())?;
//! let (client, problems) = NorthClient::configure(&config, MqttTransport::new());
//! assert!(problems.is_empty());
//! client.connect().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;

pub use client::{load_trust_anchors, MqttTransport};
pub use connection::{configure_mqtt_options, refusal_from_return_code};
