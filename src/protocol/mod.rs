//! Data handled by the client: readings in, topics and identifiers out

pub mod reading;
pub mod topics;

pub use reading::{format_timestamp, parse_timestamp, Reading};
pub use topics::TopicBuilder;
