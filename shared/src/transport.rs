//! UDP transport: socket lifecycle plus a background read loop
//!
//! The read loop runs as its own task and hands validated datagrams to a
//! bounded channel registered with [`NetcodeConn::set_recv_handler`]. The
//! protocol code drains that channel on its own tick, so nothing in the core
//! runs inside the network callback.

use crate::error::{NetcodeError, Result};
use crate::packet::PacketType;
use crate::{MAX_PACKET_BYTES, SOCKET_RCVBUF_SIZE, SOCKET_SNDBUF_SIZE};
use log::{debug, error, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A datagram that passed the structural checks, tagged with its sender
#[derive(Debug, Clone)]
pub struct NetcodeData {
    pub data: Vec<u8>,
    pub from: SocketAddr,
}

/// Creates the bounded channel a connection delivers datagrams into
pub fn recv_channel(capacity: usize) -> (mpsc::Sender<NetcodeData>, mpsc::Receiver<NetcodeData>) {
    mpsc::channel(capacity)
}

pub struct NetcodeConn {
    socket: Option<Arc<UdpSocket>>,
    handler: Option<mpsc::Sender<NetcodeData>>,
    shutdown: Option<watch::Sender<()>>,
    reader: Option<JoinHandle<()>>,
    closed: bool,

    recv_size: usize,
    send_size: usize,
    max_bytes: usize,
}

impl NetcodeConn {
    pub fn new() -> Self {
        Self {
            socket: None,
            handler: None,
            shutdown: None,
            reader: None,
            closed: true,
            recv_size: SOCKET_RCVBUF_SIZE,
            send_size: SOCKET_SNDBUF_SIZE,
            max_bytes: MAX_PACKET_BYTES,
        }
    }

    /// Registers where received datagrams go; must happen before listen/dial
    pub fn set_recv_handler(&mut self, handler: mpsc::Sender<NetcodeData>) {
        self.handler = Some(handler);
    }

    pub fn set_read_buffer(&mut self, bytes: usize) {
        self.recv_size = bytes;
    }

    pub fn set_write_buffer(&mut self, bytes: usize) {
        self.send_size = bytes;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Binds to `address` and starts the read loop
    ///
    /// Must be called from within a Tokio runtime.
    pub fn listen(&mut self, address: SocketAddr) -> Result<()> {
        let handler = self
            .handler
            .clone()
            .ok_or(NetcodeError::PacketHandlerBeforeListen)?;

        let socket = self.configure_socket(address)?;
        socket.bind(&address.into())?;
        self.create(socket, handler)
    }

    /// Binds an ephemeral local port, connects it to `address` and starts the read loop
    pub fn dial(&mut self, address: SocketAddr) -> Result<()> {
        let handler = self
            .handler
            .clone()
            .ok_or(NetcodeError::PacketHandlerBeforeListen)?;

        let local: SocketAddr = if address.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = self.configure_socket(local)?;
        socket.bind(&local.into())?;
        socket.connect(&address.into())?;
        self.create(socket, handler)
    }

    fn configure_socket(&self, address: SocketAddr) -> Result<Socket> {
        let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_recv_buffer_size(self.recv_size)?;
        socket.set_send_buffer_size(self.send_size)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    fn create(&mut self, socket: Socket, handler: mpsc::Sender<NetcodeData>) -> Result<()> {
        // Re-dialing replaces the previous socket and its read loop.
        self.close();

        let socket = Arc::new(UdpSocket::from_std(socket.into())?);
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        self.reader = Some(tokio::spawn(read_loop(
            Arc::clone(&socket),
            handler,
            shutdown_rx,
            self.max_bytes,
        )));
        self.socket = Some(socket);
        self.shutdown = Some(shutdown_tx);
        self.closed = false;
        Ok(())
    }

    /// Sends to the dialed peer
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        Ok(self.open_socket()?.try_send(data)?)
    }

    pub fn write_to(&self, data: &[u8], to: SocketAddr) -> Result<usize> {
        Ok(self.open_socket()?.try_send_to(data, to)?)
    }

    fn open_socket(&self) -> Result<&UdpSocket> {
        if self.closed {
            return Err(NetcodeError::WriteClosedSocket);
        }
        self.socket
            .as_deref()
            .ok_or(NetcodeError::WriteClosedSocket)
    }

    /// Stops the read loop and releases the socket
    ///
    /// The loop finishes dispatching any datagram it already pulled off the
    /// socket before it observes the shutdown.
    pub fn close(&mut self) {
        self.closed = true;
        self.shutdown.take();
        self.reader.take();
        self.socket.take();
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let socket = self.socket.as_ref().ok_or(NetcodeError::NotBound)?;
        Ok(socket.local_addr()?)
    }

    pub fn remote_addr(&self) -> Result<SocketAddr> {
        let socket = self.socket.as_ref().ok_or(NetcodeError::NotBound)?;
        Ok(socket.peer_addr()?)
    }
}

impl Default for NetcodeConn {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NetcodeConn {
    fn drop(&mut self) {
        self.close();
    }
}

/// Rejects datagrams that could never decode, before anything is queued
fn validate_datagram(data: &[u8], max_bytes: usize) -> Result<()> {
    if data.is_empty() {
        return Err(NetcodeError::SocketZeroRecv);
    }
    if data.len() > max_bytes {
        return Err(NetcodeError::PacketSizeMax { max: max_bytes });
    }
    PacketType::from_prefix(data).map_err(|_| NetcodeError::InvalidPacket)?;
    Ok(())
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    handler: mpsc::Sender<NetcodeData>,
    mut shutdown: watch::Receiver<()>,
    max_bytes: usize,
) {
    // One spare byte so oversized datagrams are detectable instead of truncated.
    let mut buffer = vec![0u8; max_bytes + 1];

    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = handler.closed() => break,
            result = socket.recv_from(&mut buffer) => result,
        };

        match received {
            Ok((len, from)) => {
                if let Err(e) = validate_datagram(&buffer[..len], max_bytes) {
                    debug!("Discarding datagram from {}: {}", from, e);
                    continue;
                }

                let data = NetcodeData {
                    data: buffer[..len].to_vec(),
                    from,
                };
                match handler.try_send(data) {
                    Ok(()) => {}
                    Err(TrySendError::Full(dropped)) => {
                        warn!("Receive queue full, dropping datagram from {}", dropped.from);
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Err(e) => {
                error!("Error reading data from socket: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    debug!("Read loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_key;
    use crate::packet::Packet;

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_validate_datagram() {
        assert!(matches!(
            validate_datagram(&[], MAX_PACKET_BYTES),
            Err(NetcodeError::SocketZeroRecv)
        ));
        assert!(matches!(
            validate_datagram(&[1, 2, 3], 2),
            Err(NetcodeError::PacketSizeMax { .. })
        ));
        assert!(matches!(
            validate_datagram(&[42], MAX_PACKET_BYTES),
            Err(NetcodeError::InvalidPacket)
        ));
        assert!(validate_datagram(&[1], MAX_PACKET_BYTES).is_ok());
    }

    #[tokio::test]
    async fn test_listen_requires_handler() {
        let mut conn = NetcodeConn::new();
        assert!(matches!(
            conn.listen(localhost()),
            Err(NetcodeError::PacketHandlerBeforeListen)
        ));
        assert!(matches!(
            conn.dial(localhost()),
            Err(NetcodeError::PacketHandlerBeforeListen)
        ));
    }

    #[test]
    fn test_write_before_open_and_after_close() {
        let mut conn = NetcodeConn::new();
        assert!(matches!(
            conn.write_to(&[1], localhost()),
            Err(NetcodeError::WriteClosedSocket)
        ));

        tokio_test::block_on(async {
            let (tx, _rx) = recv_channel(8);
            conn.set_recv_handler(tx);
            tokio_test::assert_ok!(conn.listen(localhost()));
            assert!(!conn.is_closed());
            assert!(conn.local_addr().is_ok());

            conn.close();
        });

        assert!(conn.is_closed());
        assert!(matches!(
            conn.write(&[1]),
            Err(NetcodeError::WriteClosedSocket)
        ));
        assert!(matches!(conn.local_addr(), Err(NetcodeError::NotBound)));
    }

    #[tokio::test]
    async fn test_dial_and_receive() {
        let (server_tx, mut server_rx) = recv_channel(8);
        let mut server = NetcodeConn::new();
        server.set_recv_handler(server_tx);
        server.listen(localhost()).unwrap();
        let server_addr = server.local_addr().unwrap();

        let (client_tx, _client_rx) = recv_channel(8);
        let mut client = NetcodeConn::new();
        client.set_recv_handler(client_tx);
        client.dial(server_addr).unwrap();
        assert_eq!(client.remote_addr().unwrap(), server_addr);

        // Garbage is filtered by the read loop, the valid frame comes through.
        client.write(&[0xFF, 0x00]).unwrap();
        let frame = Packet::Disconnect.write(1, 7, Some(&generate_key())).unwrap();
        client.write(&frame).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), server_rx.recv())
            .await
            .expect("timed out waiting for datagram")
            .expect("channel closed");
        assert_eq!(received.data, frame);
        assert_eq!(received.from.port(), client.local_addr().unwrap().port());
    }
}
