// ── Delivery manager ──
//
// Fans each batch out to every configured channel. A channel whose queue
// is full skips the batch as long as another channel took it; only when
// every live channel is backed up does `deliver` wait, which in turn backs
// up the record queue in front of the pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::{join_all, select_all};
use tokio_util::sync::CancellationToken;

use super::{
    Batch, ChannelHandle, ChannelState, Enqueue, MqttTransport, TcpTransport, Transport,
    UdpTransport, WriterTransport,
};
use crate::config::{OutputProtocol, OutputTarget};
use crate::error::{CoreError, DeliveryError};

pub struct DeliveryManager {
    channels: Vec<ChannelHandle>,
    /// Batches each channel skipped since it last accepted one.
    skipped: Vec<AtomicU64>,
}

impl DeliveryManager {
    /// Wrap already spawned channels.
    pub fn new(channels: Vec<ChannelHandle>) -> Self {
        let skipped = channels.iter().map(|_| AtomicU64::new(0)).collect();
        Self { channels, skipped }
    }

    /// Spawn one channel per target.
    pub fn spawn(
        targets: &[OutputTarget],
        capacity: usize,
        cancel: &CancellationToken,
    ) -> Result<Self, CoreError> {
        if targets.is_empty() {
            return Err(CoreError::Config {
                message: "no delivery targets configured".into(),
            });
        }

        let mut channels = Vec::with_capacity(targets.len());
        for target in targets {
            let transport = build_transport(target)?;
            tracing::info!(
                channel = %target.name,
                protocol = %target.protocol,
                max_retries = target.retry.max_attempts,
                "delivery channel started"
            );
            channels.push(ChannelHandle::spawn(
                target.name.clone(),
                transport,
                target.retry.clone(),
                capacity,
                cancel.child_token(),
            ));
        }
        Ok(Self::new(channels))
    }

    /// Queue a batch on every live channel.
    ///
    /// Waits only while no live channel has room. Fails only when no
    /// channel is left to take it.
    pub async fn deliver(&self, batch: Batch) -> Result<(), CoreError> {
        let mut pending: Vec<usize> = (0..self.channels.len()).collect();
        let mut accepted = 0usize;

        loop {
            let mut full = Vec::new();
            for i in pending {
                match self.channels[i].try_enqueue(Batch::clone(&batch)) {
                    Enqueue::Accepted => {
                        accepted += 1;
                        self.caught_up(i);
                    }
                    Enqueue::Full(_) => full.push(i),
                    Enqueue::Gone => {}
                }
            }
            pending = full;
            if accepted > 0 || pending.is_empty() {
                break;
            }
            // Every live channel is backed up.
            let waits = pending.iter().map(|&i| Box::pin(self.channels[i].ready()));
            select_all(waits).await;
        }

        for i in pending {
            self.skip(i);
        }
        if accepted == 0 {
            return Err(CoreError::DeliveryFailed { last: None });
        }
        Ok(())
    }

    fn skip(&self, i: usize) {
        if self.skipped[i].fetch_add(1, Ordering::Relaxed) == 0 {
            tracing::warn!(
                channel = %self.channels[i].name(),
                "delivery queue full, skipping batches until the channel catches up"
            );
        }
    }

    fn caught_up(&self, i: usize) {
        let skipped = self.skipped[i].swap(0, Ordering::Relaxed);
        if skipped > 0 {
            tracing::info!(channel = %self.channels[i].name(), skipped, "delivery channel caught up");
        }
    }

    pub fn states(&self) -> Vec<(String, ChannelState)> {
        self.channels
            .iter()
            .map(|c| (c.name().to_owned(), *c.state().borrow()))
            .collect()
    }

    /// Resolves once every channel has failed. Never resolves while at
    /// least one channel is still alive.
    pub async fn all_failed(&self) {
        let waits = self.channels.iter().map(|channel| {
            let mut state = channel.state();
            async move { state.wait_for(|s| s.is_failed()).await.is_ok() }
        });
        if join_all(waits).await.into_iter().all(|failed| failed) {
            return;
        }
        std::future::pending::<()>().await;
    }

    /// Close every channel, draining queued batches for up to `grace`.
    /// Returns the last channel error, if any.
    pub async fn shutdown(self, grace: Duration) -> Result<(), DeliveryError> {
        let results = join_all(self.channels.into_iter().map(|c| c.close(grace))).await;
        results.into_iter().filter_map(Result::err).last().map_or(Ok(()), Err)
    }
}

fn build_transport(target: &OutputTarget) -> Result<Box<dyn Transport>, CoreError> {
    let name = target.name.as_str();
    Ok(match target.protocol {
        OutputProtocol::Udp => Box::new(UdpTransport::new(name, target.address())),
        OutputProtocol::Tcp => Box::new(TcpTransport::new(name, target.address())),
        OutputProtocol::Mqtt => {
            let settings = target.mqtt.clone().ok_or_else(|| CoreError::Config {
                message: format!("{name}: mqtt output needs broker settings"),
            })?;
            Box::new(MqttTransport::new(name, settings))
        }
        OutputProtocol::Stdout => Box::new(WriterTransport::stdout(name)),
    })
}
