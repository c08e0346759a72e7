pub mod client;
pub mod error;
pub mod fake;

pub use client::{Alteration, BrokerScramClient, RdKafkaScramClient};
pub use error::BrokerError;
