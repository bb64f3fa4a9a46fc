//! Low-level UDP socket handling
//!
//! The datagram socket is a collaborator of the secure transport: it is
//! created per session through a [`DatagramConnector`], delivers every
//! received datagram to a handler from its own receive thread, and is torn
//! down by dropping it.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::NetworkError;

/// Callback invoked for each received datagram
pub type DatagramHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Connected datagram endpoint owned by the transport
pub trait DatagramSocket: Send {
    fn send(&self, datagram: &[u8]) -> Result<usize, NetworkError>;
}

/// Factory for datagram endpoints
pub trait DatagramConnector: Send + Sync {
    fn connect(
        &self,
        server: &str,
        port: u16,
        handler: DatagramHandler,
    ) -> Result<Box<dyn DatagramSocket>, NetworkError>;
}

/// Create a UDP socket bound to an ephemeral port in the family of `peer`
pub fn create_socket(config: &NetworkConfig, peer: &SocketAddr) -> Result<StdUdpSocket, NetworkError> {
    let domain = if peer.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    configure_socket(&socket, config)?;

    let bind_addr: SocketAddr = if peer.is_ipv4() {
        format!("{}:0", config.bind_address)
            .parse()
            .map_err(|e: std::net::AddrParseError| NetworkError::BindFailed(e.to_string()))?
    } else {
        SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
    };

    socket.bind(&bind_addr.into())
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    let std_socket: StdUdpSocket = socket.into();
    std_socket
        .set_read_timeout(Some(Duration::from_millis(config.recv_timeout_ms.max(1))))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(std_socket)
}

fn configure_socket(socket: &Socket, config: &NetworkConfig) -> Result<(), NetworkError> {
    socket.set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set send buffer: {}", e)))?;

    socket.set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set recv buffer: {}", e)))?;

    Ok(())
}

/// Resolve `server:port`, preferring IPv4
fn resolve(server: &str, port: u16) -> Result<SocketAddr, NetworkError> {
    let addrs: Vec<SocketAddr> = (server, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::Resolve(format!("{}:{} ({})", server, port, e)))?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| NetworkError::Resolve(format!("{}:{}", server, port)))
}

/// Connector producing real UDP sockets
#[derive(Debug, Clone, Default)]
pub struct UdpConnector {
    config: NetworkConfig,
}

impl UdpConnector {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }
}

impl DatagramConnector for UdpConnector {
    fn connect(
        &self,
        server: &str,
        port: u16,
        handler: DatagramHandler,
    ) -> Result<Box<dyn DatagramSocket>, NetworkError> {
        let peer = resolve(server, port)?;
        let socket = create_socket(&self.config, &peer)?;
        socket
            .connect(peer)
            .map_err(|e| NetworkError::ConnectFailed(e.to_string()))?;

        let udp = UdpDatagramSocket::start(socket, peer, handler)?;
        tracing::info!("UDP channel connected to {}", peer);
        Ok(Box::new(udp))
    }
}

/// UDP socket with a dedicated receive thread
pub struct UdpDatagramSocket {
    socket: Arc<StdUdpSocket>,
    peer: SocketAddr,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl UdpDatagramSocket {
    fn start(
        socket: StdUdpSocket,
        peer: SocketAddr,
        handler: DatagramHandler,
    ) -> Result<Self, NetworkError> {
        let socket = Arc::new(socket);
        let running = Arc::new(AtomicBool::new(true));

        let rx_socket = socket.clone();
        let rx_running = running.clone();
        let handle = thread::Builder::new()
            .name("audio-udp-rx".to_string())
            .spawn(move || Self::receive_loop(rx_socket, rx_running, handler))
            .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;

        Ok(Self {
            socket,
            peer,
            running,
            thread_handle: Some(handle),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        })
    }

    fn receive_loop(socket: Arc<StdUdpSocket>, running: Arc<AtomicBool>, handler: DatagramHandler) {
        let mut recv_buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        while running.load(Ordering::Relaxed) {
            match socket.recv(&mut recv_buffer) {
                Ok(size) => {
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    handler(&recv_buffer[..size]);
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    // ICMP port unreachable surfaces here on connected sockets
                    if e.kind() != io::ErrorKind::Interrupted {
                        tracing::debug!("UDP receive error: {}", e);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

impl DatagramSocket for UdpDatagramSocket {
    fn send(&self, datagram: &[u8]) -> Result<usize, NetworkError> {
        let sent = self
            .socket
            .send(datagram)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
        Ok(sent)
    }
}

impl Drop for UdpDatagramSocket {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            // dropped from inside the handler: the loop exits on its own
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        tracing::debug!("UDP channel to {} closed", self.peer);
    }
}
