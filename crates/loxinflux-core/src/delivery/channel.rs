// ── Delivery channel ──
//
// One task per downstream target. The task drains its own bounded queue in
// order; a failed send reconnects and retries the same batch with backoff
// until it succeeds or the attempt budget runs out.

use std::fmt;
use std::time::Duration;

use loxinflux_api::{Backoff, ReconnectConfig};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Batch, Transport};
use crate::error::DeliveryError;

/// Upper bound on a single connect or send.
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle of a delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    Retrying { attempt: u32 },
    /// Terminal: attempt budget exhausted.
    Failed,
    Closed,
}

impl ChannelState {
    pub fn is_failed(self) -> bool {
        self == Self::Failed
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Retrying { attempt } => write!(f, "retrying (attempt {attempt})"),
            Self::Failed => f.write_str("failed"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// Outcome of [`ChannelHandle::try_enqueue`].
#[derive(Debug)]
pub enum Enqueue {
    Accepted,
    /// Queue at capacity; the batch is handed back.
    Full(Batch),
    /// Failed or stopped channel.
    Gone,
}

/// Handle to a running channel task.
pub struct ChannelHandle {
    name: String,
    queue: mpsc::Sender<Batch>,
    state: watch::Receiver<ChannelState>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), DeliveryError>>,
}

impl ChannelHandle {
    /// Spawn a channel task around `transport`.
    ///
    /// Cancelling `cancel` abandons queued batches; dropping the handle's
    /// queue (see [`close`](Self::close)) drains them first.
    pub fn spawn(
        name: impl Into<String>,
        transport: Box<dyn Transport>,
        retry: ReconnectConfig,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let name = name.into();
        let (queue_tx, queue_rx) = mpsc::channel(capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ChannelState::Idle);

        let worker = Worker {
            name: name.clone(),
            transport,
            backoff: Backoff::new(retry),
            connected: false,
            state: state_tx,
        };
        let task = tokio::spawn(worker.run(queue_rx, cancel.clone()));

        Self {
            name,
            queue: queue_tx,
            state: state_rx,
            cancel,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Queue a batch, waiting for capacity. Returns `false` once the
    /// channel has failed or its task has stopped.
    pub async fn enqueue(&self, batch: Batch) -> bool {
        if self.state.borrow().is_failed() {
            return false;
        }
        self.queue.send(batch).await.is_ok()
    }

    /// Queue a batch only if there is room right now.
    pub fn try_enqueue(&self, batch: Batch) -> Enqueue {
        if self.state.borrow().is_failed() {
            return Enqueue::Gone;
        }
        match self.queue.try_send(batch) {
            Ok(()) => Enqueue::Accepted,
            Err(mpsc::error::TrySendError::Full(batch)) => Enqueue::Full(batch),
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Gone,
        }
    }

    /// Wait until the queue has room for one more batch. Returns `false`
    /// once the task has stopped.
    pub async fn ready(&self) -> bool {
        self.queue.reserve().await.is_ok()
    }

    /// Stop accepting batches, let the task drain its queue, and wait for
    /// it. After `grace` the task is cancelled.
    pub async fn close(self, grace: Duration) -> Result<(), DeliveryError> {
        let Self {
            name,
            queue,
            cancel,
            mut task,
            ..
        } = self;
        drop(queue);

        let joined = match tokio::time::timeout(grace, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!(channel = %name, "channel did not drain in time, abandoning queue");
                cancel.cancel();
                task.await
            }
        };
        joined.map_err(|e| {
            tracing::error!(channel = %name, error = %e, "channel task panicked");
            DeliveryError::Closed { channel: name }
        })?
    }
}

/// Result of handing one batch to the transport.
enum Delivered {
    Sent,
    Dropped,
    Cancelled,
}

struct Worker {
    name: String,
    transport: Box<dyn Transport>,
    backoff: Backoff,
    connected: bool,
    state: watch::Sender<ChannelState>,
}

impl Worker {
    async fn run(
        mut self,
        mut queue: mpsc::Receiver<Batch>,
        cancel: CancellationToken,
    ) -> Result<(), DeliveryError> {
        loop {
            let batch = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                batch = queue.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            match self.deliver(&batch, &cancel).await {
                Ok(Delivered::Sent | Delivered::Dropped) => {}
                Ok(Delivered::Cancelled) => break,
                Err(e) => {
                    self.transport.close().await;
                    return Err(e);
                }
            }
        }

        queue.close();
        let mut abandoned = 0usize;
        while queue.try_recv().is_ok() {
            abandoned += 1;
        }
        if abandoned > 0 {
            tracing::warn!(channel = %self.name, batches = abandoned, "dropping undelivered batches");
        }
        self.transport.close().await;
        self.state.send_replace(ChannelState::Closed);
        tracing::debug!(channel = %self.name, "channel closed");
        Ok(())
    }

    /// Send one batch, reconnecting and retrying as the budget allows.
    async fn deliver(
        &mut self,
        batch: &[String],
        cancel: &CancellationToken,
    ) -> Result<Delivered, DeliveryError> {
        loop {
            let error = match self.attempt(batch).await {
                Ok(()) => {
                    if self.backoff.failures() > 0 {
                        tracing::info!(channel = %self.name, "delivery recovered");
                    }
                    self.backoff.reset();
                    return Ok(Delivered::Sent);
                }
                Err(e) => e,
            };
            self.connected = false;

            if !self.transport.reliable() {
                tracing::debug!(
                    channel = %self.name,
                    error = %error,
                    lines = batch.len(),
                    "dropping batch on unreliable transport"
                );
                return Ok(Delivered::Dropped);
            }

            tracing::warn!(
                channel = %self.name,
                error = %error,
                attempt = self.backoff.failures() + 1,
                "delivery failed"
            );
            let Some(delay) = self.backoff.record_failure() else {
                let attempts = self.backoff.failures();
                tracing::error!(channel = %self.name, attempts, "delivery retry budget exhausted");
                self.state.send_replace(ChannelState::Failed);
                return Err(DeliveryError::RetriesExhausted {
                    channel: self.name.clone(),
                    attempts,
                });
            };
            self.state.send_replace(ChannelState::Retrying {
                attempt: self.backoff.failures(),
            });

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(Delivered::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&mut self, batch: &[String]) -> Result<(), DeliveryError> {
        if !self.connected {
            self.state.send_replace(ChannelState::Connecting);
            timed(&self.name, self.transport.connect()).await?;
            self.connected = true;
            self.state.send_replace(ChannelState::Connected);
        }
        timed(&self.name, self.transport.send(batch)).await
    }
}

async fn timed(
    channel: &str,
    op: impl Future<Output = Result<(), DeliveryError>>,
) -> Result<(), DeliveryError> {
    tokio::time::timeout(IO_TIMEOUT, op).await.unwrap_or_else(|_| {
        Err(DeliveryError::io(
            channel,
            std::io::Error::new(std::io::ErrorKind::TimedOut, "transport timed out"),
        ))
    })
}
