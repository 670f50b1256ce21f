//! IoT Core north client
//!
//! Publishes batches of time-series readings to a cloud device registry over
//! MQTT, authenticating every session with a short-lived signed token derived
//! from the device private key.
//!
//! # Overview
//!
//! - [`auth`] - token signing and the credential lifecycle
//! - [`connection`] - session state machine with exponential backoff
//! - [`batch`] - grouping readings by normalized asset name
//! - [`publish`] - publish with bounded retry and delivery wait
//! - [`delivery`] - sent/delivered sequence markers
//! - [`transport`] - the broker seam and its rumqttc implementation
//! - [`client`] - the host-facing [`NorthClient`]
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use iotcore_north::{NorthClient, NorthConfig, Reading};
//! use chrono::Utc;
//!
//! # tokio_test::block_on(async {
//! let config = NorthConfig::load_from_file("north.toml".as_ref())?;
//! let (client, problems) = NorthClient::from_config(&config);
//! for problem in &problems {
//!     eprintln!("{problem}");
//! }
//!
//! let readings = vec![
//!     Reading::new("Room A", Utc::now()).with_datapoint("temperature", 21.5),
//!     Reading::new("Room B", Utc::now()).with_datapoint("temperature", 19.0),
//! ];
//! let sent = client.send(&readings).await;
//! println!("sent {sent} readings");
//! client.shutdown().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod auth;
pub mod batch;
pub mod client;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod publish;
pub mod testing;
pub mod transport;

pub use client::NorthClient;
pub use config::{ConfigError, DeviceIdentity, NorthConfig};
pub use connection::ConnectionState;
pub use delivery::DeliveryMarker;
pub use error::{NorthError, NorthResult};
pub use protocol::Reading;
pub use transport::MqttTransport;
