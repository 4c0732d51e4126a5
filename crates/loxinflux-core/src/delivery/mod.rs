//! Delivery of formatted lines to downstream collectors.
//!
//! Each configured target gets its own [`Transport`] driven by a dedicated
//! channel task with a bounded, ordered queue. [`DeliveryManager`] fans
//! batches out to every live channel without letting a backed-up one hold
//! the others.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DeliveryError;

pub mod channel;
pub mod manager;
pub mod mqtt;
pub mod tcp;
pub mod udp;
pub mod writer;

pub use channel::{ChannelHandle, ChannelState, Enqueue};
pub use manager::DeliveryManager;
pub use mqtt::MqttTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;
pub use writer::WriterTransport;

/// Lines formatted together, shared by every channel.
pub type Batch = Arc<[String]>;

/// One downstream protocol.
///
/// Implementations only move bytes; retry, backoff and ordering live in
/// the channel task.
#[async_trait]
pub trait Transport: Send {
    /// Failed sends of an unreliable transport are dropped, never retried.
    fn reliable(&self) -> bool {
        true
    }

    /// Establish (or re-establish) the connection.
    async fn connect(&mut self) -> Result<(), DeliveryError>;

    /// Write a batch of lines in order.
    async fn send(&mut self, lines: &[String]) -> Result<(), DeliveryError>;

    /// Release the connection. Errors are ignored.
    async fn close(&mut self);
}
