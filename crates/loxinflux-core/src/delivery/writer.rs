// ── Standard-output transport ──
//
// For running under Telegraf's execd input: one line per record on the
// process's stdout. Any `AsyncWrite` works, which keeps it testable.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::Transport;
use crate::error::DeliveryError;

pub struct WriterTransport<W> {
    name: String,
    writer: W,
}

impl WriterTransport<tokio::io::Stdout> {
    pub fn stdout(name: impl Into<String>) -> Self {
        Self::new(name, tokio::io::stdout())
    }
}

impl<W> WriterTransport<W> {
    pub fn new(name: impl Into<String>, writer: W) -> Self {
        Self {
            name: name.into(),
            writer,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Transport for WriterTransport<W> {
    fn reliable(&self) -> bool {
        false
    }

    async fn connect(&mut self) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn send(&mut self, lines: &[String]) -> Result<(), DeliveryError> {
        let mut buf = Vec::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
        }
        self.writer
            .write_all(&buf)
            .await
            .map_err(|e| DeliveryError::io(&self.name, e))?;
        self.writer
            .flush()
            .await
            .map_err(|e| DeliveryError::io(&self.name, e))
    }

    async fn close(&mut self) {
        let _ = self.writer.flush().await;
    }
}
