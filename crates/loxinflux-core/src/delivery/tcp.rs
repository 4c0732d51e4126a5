// ── Stream transport ──
//
// Newline-delimited lines over a persistent TCP connection, as accepted by
// Telegraf's socket_listener.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

use super::Transport;
use crate::error::DeliveryError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TcpTransport {
    name: String,
    address: String,
    stream: Option<BufWriter<TcpStream>>,
}

impl TcpTransport {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            stream: None,
        }
    }

    fn connect_error(&self, reason: impl ToString) -> DeliveryError {
        DeliveryError::Connect {
            channel: self.name.clone(),
            target: self.address.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self) -> Result<(), DeliveryError> {
        self.stream = None;
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .map_err(|_| self.connect_error("timed out"))?
            .map_err(|e| self.connect_error(e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| DeliveryError::io(&self.name, e))?;

        tracing::debug!(channel = %self.name, address = %self.address, "stream connected");
        self.stream = Some(BufWriter::new(stream));
        Ok(())
    }

    async fn send(&mut self, lines: &[String]) -> Result<(), DeliveryError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(DeliveryError::Closed {
                channel: self.name.clone(),
            });
        };

        let result = async {
            for line in lines {
                stream.write_all(line.as_bytes()).await?;
                stream.write_all(b"\n").await?;
            }
            stream.flush().await
        }
        .await;

        result.map_err(|e| {
            self.stream = None;
            DeliveryError::io(&self.name, e)
        })
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn writes_newline_delimited_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let reader = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = String::new();
            socket.read_to_string(&mut received).await.unwrap();
            received
        });

        let mut transport = TcpTransport::new("test", address);
        transport.connect().await.unwrap();
        transport
            .send(&["a value=1".to_owned(), "b value=2".to_owned()])
            .await
            .unwrap();
        transport.close().await;

        assert_eq!(reader.await.unwrap(), "a value=1\nb value=2\n");
    }

    #[tokio::test]
    async fn send_without_connection_is_an_error() {
        let mut transport = TcpTransport::new("test", "127.0.0.1:9");
        let result = transport.send(&["x value=1".to_owned()]).await;
        assert!(matches!(result, Err(DeliveryError::Closed { .. })));
    }
}
