//! Сетевая подсистема защищённого аудиоканала
//!
//! Содержит модули для:
//! - Управляющего канала (pub/sub) и диспетчеризации сообщений
//! - Рукопожатия hello / goodbye
//! - Зашифрованного UDP транспорта аудиокадров

pub mod control;
pub mod dispatcher;
pub mod handshake;
pub mod sink;
pub mod transport;
pub mod udp;

#[cfg(feature = "loopback")]
pub mod loopback;

pub use control::{event_queue, ControlChannel, ControlEvent, ControlLink, Credentials, QoS};
pub use dispatcher::{Dispatcher, DispatcherHandle, GoodbyeHandler, JsonCallback};
pub use handshake::{parse_server_hello, HandshakeCoordinator, SessionParams};
pub use sink::{AudioSink, Liveness, TextSink};
pub use transport::{SecureTransport, TransportStats};
pub use udp::{create_socket, DatagramConnector, DatagramHandler, DatagramSocket, UdpConnector};
