//! BACnet/IP transport over UDP
//!
//! Frames handed to [`UdpTransport::send`] are NPDUs; this module adds the
//! BVLC header (Original-Unicast-NPDU / Original-Broadcast-NPDU) and strips it
//! again on receive. Forwarded-NPDUs from a BBMD are reported with the
//! original source address carried in the BVLC header.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{LinkTarget, ReceiveHandler, Transport};
use crate::error::TransportError;

const BVLC_TYPE: u8 = 0x81;
const BVLC_FORWARDED_NPDU: u8 = 0x04;
const BVLC_ORIGINAL_UNICAST: u8 = 0x0A;
const BVLC_ORIGINAL_BROADCAST: u8 = 0x0B;
const BVLC_HEADER_LEN: usize = 4;

/// Largest BACnet/IP datagram
const MAX_DATAGRAM: usize = 1497;

/// UDP socket speaking BACnet/IP
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    broadcast: SocketAddr,
    handler: Arc<RwLock<Option<ReceiveHandler>>>,
    shutdown: Arc<Notify>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind `bind` with broadcast enabled and start the receive task.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bind(bind: SocketAddr, broadcast: SocketAddr) -> Result<Self, TransportError> {
        let socket = std::net::UdpSocket::bind(bind)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(socket)?);
        let local = socket.local_addr()?;

        info!("BACnet/IP transport bound to {} (broadcast {})", local, broadcast);

        let handler: Arc<RwLock<Option<ReceiveHandler>>> = Arc::new(RwLock::new(None));
        let shutdown = Arc::new(Notify::new());
        let receiver = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            Arc::clone(&handler),
            Arc::clone(&shutdown),
        ));

        Ok(Self {
            socket,
            local,
            broadcast,
            handler,
            shutdown,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn broadcast_addr(&self) -> SocketAddr {
        self.broadcast
    }
}

impl Transport for UdpTransport {
    fn send(&self, target: LinkTarget, frame: Bytes) -> Result<(), TransportError> {
        if self.receiver.lock().is_none() {
            return Err(TransportError::Closed);
        }

        let (function, addr) = match target {
            LinkTarget::Unicast(addr) => (BVLC_ORIGINAL_UNICAST, addr),
            LinkTarget::Broadcast => (BVLC_ORIGINAL_BROADCAST, self.broadcast),
        };
        let datagram = wrap_bvlc(function, &frame)?;

        let sent = self.socket.try_send_to(&datagram, addr)?;
        trace!(%target, bytes = sent, "Sent datagram");
        Ok(())
    }

    fn register_receive_handler(&self, handler: ReceiveHandler) {
        *self.handler.write() = Some(handler);
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn close(&self) {
        if let Some(task) = self.receiver.lock().take() {
            self.shutdown.notify_one();
            task.abort();
            *self.handler.write() = None;
            debug!("BACnet/IP transport on {} closed", self.local);
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    handler: Arc<RwLock<Option<ReceiveHandler>>>,
    shutdown: Arc<Notify>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        // ICMP port-unreachable surfaces here on some platforms
                        warn!("UDP receive error: {}", e);
                        continue;
                    }
                };
                let Some((source, npdu)) = unwrap_bvlc(&buf[..len], from) else {
                    trace!(%from, "Discarding non-NPDU datagram");
                    continue;
                };
                let current = handler.read().clone();
                if let Some(handler) = current {
                    handler(source, Bytes::copy_from_slice(npdu));
                }
            }
        }
    }
}

fn wrap_bvlc(function: u8, npdu: &[u8]) -> Result<Bytes, TransportError> {
    let total = npdu.len() + BVLC_HEADER_LEN;
    if total > MAX_DATAGRAM {
        return Err(TransportError::FrameTooLarge(total));
    }
    let mut out = BytesMut::with_capacity(total);
    out.put_u8(BVLC_TYPE);
    out.put_u8(function);
    out.put_u16(total as u16);
    out.put_slice(npdu);
    Ok(out.freeze())
}

/// Strip the BVLC header. Returns the effective source and the NPDU, or
/// `None` for BVLC messages that carry no NPDU (results, BBMD management).
fn unwrap_bvlc(datagram: &[u8], from: SocketAddr) -> Option<(SocketAddr, &[u8])> {
    if datagram.len() < BVLC_HEADER_LEN || datagram[0] != BVLC_TYPE {
        return None;
    }
    let declared = u16::from_be_bytes([datagram[2], datagram[3]]) as usize;
    if declared != datagram.len() {
        return None;
    }
    match datagram[1] {
        BVLC_ORIGINAL_UNICAST | BVLC_ORIGINAL_BROADCAST => Some((from, &datagram[BVLC_HEADER_LEN..])),
        BVLC_FORWARDED_NPDU => {
            let body = &datagram[BVLC_HEADER_LEN..];
            if body.len() < 6 {
                return None;
            }
            let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let port = u16::from_be_bytes([body[4], body[5]]);
            Some((SocketAddr::new(IpAddr::V4(ip), port), &body[6..]))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_bvlc_wrap() {
        let frame = wrap_bvlc(BVLC_ORIGINAL_BROADCAST, &[0x01, 0x00, 0x10, 0x08]).unwrap();
        assert_eq!(&frame[..], &[0x81, 0x0B, 0x00, 0x08, 0x01, 0x00, 0x10, 0x08]);
    }

    #[test]
    fn test_bvlc_unwrap_forwarded() {
        let from: SocketAddr = "192.168.1.1:47808".parse().unwrap();
        let datagram = [
            0x81, 0x04, 0x00, 0x0E, 10, 0, 0, 7, 0xBA, 0xC0, 0x01, 0x00, 0x10, 0x08,
        ];
        let (source, npdu) = unwrap_bvlc(&datagram, from).unwrap();
        assert_eq!(source, "10.0.0.7:47808".parse::<SocketAddr>().unwrap());
        assert_eq!(npdu, &[0x01, 0x00, 0x10, 0x08]);
    }

    #[test]
    fn test_bvlc_unwrap_rejects_garbage() {
        let from: SocketAddr = "192.168.1.1:47808".parse().unwrap();
        assert!(unwrap_bvlc(&[0x82, 0x0A, 0x00, 0x04], from).is_none());
        assert!(unwrap_bvlc(&[0x81, 0x0A, 0x00, 0x09, 0x01], from).is_none());
        // BVLC-Result carries no NPDU
        assert!(unwrap_bvlc(&[0x81, 0x00, 0x00, 0x06, 0x00, 0x00], from).is_none());
    }

    #[test]
    fn test_oversized_frame() {
        let big = vec![0u8; MAX_DATAGRAM];
        assert!(matches!(
            wrap_bvlc(BVLC_ORIGINAL_UNICAST, &big),
            Err(TransportError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_loopback_exchange() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let a = UdpTransport::bind(any, any).await.unwrap();
        let b = UdpTransport::bind(any, any).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        b.register_receive_handler(Arc::new(move |from: SocketAddr, frame: Bytes| {
            let _ = tx.send((from, frame));
        }));

        a.send(LinkTarget::Unicast(b.local_addr()), Bytes::from_static(&[0x01, 0x00]))
            .unwrap();

        let (from, frame) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, a.local_addr());
        assert_eq!(&frame[..], &[0x01, 0x00]);

        a.close();
        assert_eq!(
            a.send(LinkTarget::Broadcast, Bytes::new()),
            Err(TransportError::Closed)
        );
    }
}
