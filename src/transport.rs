//! # UDP Transport
//!
//! Thin wrapper over a tokio [`UdpSocket`] carrying UTF-8 text datagrams.
//!
//! - Sends never fail from the caller's point of view: errors are logged and
//!   the datagram is treated as lost.
//! - Receives are bounded by a time slice so the pump can check deadlines and
//!   completion conditions between datagrams.
//! - Datagrams that are not valid UTF-8 are discarded.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Receive buffer size. Large enough for any UDP payload over IPv4.
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

pub struct UdpTransport {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpTransport {
    pub async fn bind(ip: IpAddr, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(ip, port)).await?;
        Ok(Self {
            socket,
            buf: vec![0u8; RECV_BUFFER_SIZE],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send one datagram. Returns `false` if the send failed.
    pub async fn send_to(&self, text: &str, to: SocketAddr) -> bool {
        match self.socket.send_to(text.as_bytes(), to).await {
            Ok(_) => {
                trace!(to = %to, len = text.len(), "sent datagram");
                true
            }
            Err(e) => {
                debug!(to = %to, error = %e, "datagram send failed");
                false
            }
        }
    }

    /// Wait up to `slice` for one datagram.
    ///
    /// Returns `None` on timeout, on a receive error, or when the payload is
    /// not UTF-8.
    pub async fn recv_timeout(&mut self, slice: Duration) -> Option<(String, SocketAddr)> {
        let (len, from) = match timeout(slice, self.socket.recv_from(&mut self.buf)).await {
            Err(_) => return None,
            Ok(Err(e)) => {
                debug!(error = %e, "datagram receive failed");
                return None;
            }
            Ok(Ok(received)) => received,
        };

        match std::str::from_utf8(&self.buf[..len]) {
            Ok(text) => {
                trace!(from = %from, len, "received datagram");
                Some((text.to_string(), from))
            }
            Err(_) => {
                debug!(from = %from, len, "dropping non-UTF-8 datagram");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn text_round_trip_over_loopback() {
        let a = UdpTransport::bind(LOOPBACK, 0).await.unwrap();
        let mut b = UdpTransport::bind(LOOPBACK, 0).await.unwrap();

        assert!(a.send_to("AB G", b.local_addr().unwrap()).await);
        let (text, from) = b.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(text, "AB G");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn recv_times_out_without_traffic() {
        let mut a = UdpTransport::bind(LOOPBACK, 0).await.unwrap();
        assert!(a.recv_timeout(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn non_utf8_payload_is_discarded() {
        let raw = UdpSocket::bind((LOOPBACK, 0)).await.unwrap();
        let mut b = UdpTransport::bind(LOOPBACK, 0).await.unwrap();

        raw.send_to(&[0xff, 0xfe, 0x20, 0x47], b.local_addr().unwrap())
            .await
            .unwrap();
        assert!(b.recv_timeout(Duration::from_secs(2)).await.is_none());
    }
}
