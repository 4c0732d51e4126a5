// ── Datagram transport ──
//
// Fire-and-forget. Lines are packed into datagrams that stay below a
// typical path MTU; a line longer than that travels alone.

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::Transport;
use crate::error::DeliveryError;

const MAX_DATAGRAM: usize = 1400;

pub struct UdpTransport {
    name: String,
    address: String,
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            socket: None,
        }
    }
}

/// Group lines into newline-joined payloads of at most `limit` bytes.
fn pack(lines: &[String], limit: usize) -> Vec<Vec<u8>> {
    let mut datagrams = Vec::new();
    let mut current: Vec<u8> = Vec::new();

    for line in lines {
        let needed = line.len() + 1;
        if !current.is_empty() && current.len() + needed > limit {
            datagrams.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(line.as_bytes());
        current.push(b'\n');
    }
    if !current.is_empty() {
        datagrams.push(current);
    }
    datagrams
}

#[async_trait]
impl Transport for UdpTransport {
    fn reliable(&self) -> bool {
        false
    }

    async fn connect(&mut self) -> Result<(), DeliveryError> {
        let connect_error = |reason: std::io::Error| DeliveryError::Connect {
            channel: self.name.clone(),
            target: self.address.clone(),
            reason: reason.to_string(),
        };
        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(connect_error)?;
        socket.connect(&self.address).await.map_err(connect_error)?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn send(&mut self, lines: &[String]) -> Result<(), DeliveryError> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(DeliveryError::Closed {
                channel: self.name.clone(),
            });
        };
        for datagram in pack(lines, MAX_DATAGRAM) {
            socket
                .send(&datagram)
                .await
                .map_err(|e| DeliveryError::io(&self.name, e))?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.socket = None;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn packs_lines_under_the_limit() {
        let lines: Vec<String> = ["aaaa", "bbbb", "cccc"].map(String::from).to_vec();
        let packed = pack(&lines, 10);
        assert_eq!(packed, vec![b"aaaa\nbbbb\n".to_vec(), b"cccc\n".to_vec()]);
    }

    #[test]
    fn oversized_line_travels_alone() {
        let lines = vec!["x".repeat(20), "y".to_owned()];
        let packed = pack(&lines, 10);
        assert_eq!(packed.len(), 2);
        assert_eq!(packed[0].len(), 21);
        assert_eq!(packed[1], b"y\n".to_vec());
    }

    #[tokio::test]
    async fn datagrams_reach_the_listener() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let mut transport = UdpTransport::new("test", address);
        assert!(!transport.reliable());
        transport.connect().await.unwrap();
        transport.send(&["m value=1".to_owned()]).await.unwrap();

        let mut buf = [0u8; 64];
        let n = listener.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"m value=1\n");
    }
}
