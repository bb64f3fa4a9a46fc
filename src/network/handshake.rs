//! Протокол рукопожатия для открытия аудиосессии
//!
//! ## Протокол
//!
//! ```text
//! Device                                Server
//!   │                                     │
//!   │──── HELLO (audio params) ─────────>│   control channel
//!   │                                     │
//!   │<─── HELLO (session, udp key/nonce) ─│   control channel
//!   │                                     │
//!   │<═════ AES-CTR AUDIO FRAMES ════════>│   UDP
//!   │                                     │
//!   │──── GOODBYE (session_id) ─────────>│   control channel
//! ```
//!
//! Ожидание ответа сервера ограничено по времени; сигнал о получении ответа
//! взводится перед каждой попыткой и срабатывает не более одного раза.

use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::config::AudioConfig;
use crate::constants::*;
use crate::error::{HandshakeError, HelloError, NetworkError};
use crate::network::control::ControlLink;
use crate::protocol::ClientHello;

/// Параметры сессии из ответа сервера
#[derive(Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// ID сессии (пустая строка, если сервер его не назначил)
    pub session_id: String,
    /// Частота дискретизации сервера, если указана
    pub sample_rate: Option<u32>,
    /// UDP сервер
    pub server: String,
    /// UDP порт
    pub port: u16,
    /// Ключ AES-128
    pub key: [u8; SESSION_KEY_SIZE],
    /// Шаблон nonce
    pub nonce: [u8; FRAME_HEADER_SIZE],
}

impl std::fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionParams")
            .field("session_id", &self.session_id)
            .field("sample_rate", &self.sample_rate)
            .field("server", &self.server)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// Разобрать ответ сервера на hello
///
/// Любое отсутствующее или некорректное обязательное поле отклоняет
/// сообщение целиком.
pub fn parse_server_hello(message: &Value) -> Result<SessionParams, HelloError> {
    match message.get("transport") {
        None | Some(Value::Null) => {}
        Some(Value::String(transport)) if transport == TRANSPORT_UDP => {}
        Some(Value::String(transport)) => {
            return Err(HelloError::UnsupportedTransport(transport.clone()))
        }
        Some(_) => return Err(HelloError::WrongType("transport")),
    }

    let session_id = match message.get("session_id") {
        None | Some(Value::Null) => String::new(),
        Some(value) => value
            .as_str()
            .ok_or(HelloError::WrongType("session_id"))?
            .to_string(),
    };

    let sample_rate = message
        .get("audio_params")
        .and_then(|params| params.get("sample_rate"))
        .and_then(Value::as_u64)
        .and_then(|rate| u32::try_from(rate).ok());

    let udp = message.get("udp").ok_or(HelloError::MissingField("udp"))?;
    if !udp.is_object() {
        return Err(HelloError::WrongType("udp"));
    }

    let server = required(udp, "server")?
        .as_str()
        .ok_or(HelloError::WrongType("server"))?
        .to_string();

    let port = required(udp, "port")?
        .as_u64()
        .and_then(|port| u16::try_from(port).ok())
        .ok_or(HelloError::WrongType("port"))?;

    let key = decode_hex16("key", required(udp, "key")?)?;
    let nonce = decode_hex16("nonce", required(udp, "nonce")?)?;

    Ok(SessionParams {
        session_id,
        sample_rate,
        server,
        port,
        key,
        nonce,
    })
}

fn required<'a>(object: &'a Value, field: &'static str) -> Result<&'a Value, HelloError> {
    match object.get(field) {
        None | Some(Value::Null) => Err(HelloError::MissingField(field)),
        Some(value) => Ok(value),
    }
}

fn decode_hex16(field: &'static str, value: &Value) -> Result<[u8; 16], HelloError> {
    let text = value.as_str().ok_or(HelloError::WrongType(field))?;
    let mut out = [0u8; 16];
    hex::decode_to_slice(text, &mut out).map_err(|_| HelloError::BadHex {
        field,
        expected: 32,
    })?;
    Ok(out)
}

/// Состояние сигнала "hello получен"
#[derive(Default)]
struct SignalState {
    /// Номер текущей попытки
    attempt: u64,
    /// Попытка ожидает ответа
    armed: bool,
    outcome: Option<Result<SessionParams, HandshakeError>>,
}

/// Одноразовый сигнал на попытку рукопожатия
#[derive(Default)]
struct HelloSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl HelloSignal {
    /// Взвести новую попытку, сбросив результат предыдущей
    fn arm(&self) -> u64 {
        let mut state = self.state.lock();
        state.attempt = state.attempt.wrapping_add(1);
        state.armed = true;
        state.outcome = None;
        state.attempt
    }

    fn disarm(&self, attempt: u64) {
        let mut state = self.state.lock();
        if state.attempt == attempt {
            state.armed = false;
            state.outcome = None;
        }
    }

    /// Установить результат; возвращает false, если ответ никто не ждёт
    fn deliver(&self, outcome: Result<SessionParams, HandshakeError>) -> bool {
        let mut state = self.state.lock();
        if !state.armed || state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(outcome);
        self.cond.notify_all();
        true
    }

    fn is_cancelled(&self, attempt: u64) -> bool {
        let state = self.state.lock();
        state.attempt != attempt || matches!(state.outcome, Some(Err(HandshakeError::Cancelled)))
    }

    fn wait(&self, attempt: u64, timeout: Duration) -> Result<SessionParams, HandshakeError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            if state.attempt != attempt {
                return Err(HandshakeError::Cancelled);
            }
            if let Some(outcome) = state.outcome.take() {
                state.armed = false;
                return outcome;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                state.armed = false;
                return match state.outcome.take() {
                    Some(outcome) => outcome,
                    None => Err(HandshakeError::Timeout(timeout)),
                };
            }
        }
    }
}

/// Координатор рукопожатия
pub struct HandshakeCoordinator {
    audio: AudioConfig,
    timeout: Duration,
    signal: HelloSignal,
}

impl HandshakeCoordinator {
    pub fn new(audio: AudioConfig, timeout: Duration) -> Self {
        Self {
            audio,
            timeout,
            signal: HelloSignal::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Отправить hello и дождаться ответа сервера
    ///
    /// Блокирует вызывающий поток не дольше таймаута.
    pub fn request_session(&self, link: &ControlLink) -> Result<SessionParams, HandshakeError> {
        let attempt = self.begin();
        self.complete(attempt, link)
    }

    /// Взвести ожидание ответа до отправки hello
    ///
    /// `cancel` после этого вызова прерывает попытку, даже если hello ещё
    /// не отправлен.
    pub fn begin(&self) -> u64 {
        self.signal.arm()
    }

    /// Отправить hello для взведённой попытки и дождаться ответа
    pub fn complete(&self, attempt: u64, link: &ControlLink) -> Result<SessionParams, HandshakeError> {
        if self.signal.is_cancelled(attempt) {
            self.signal.disarm(attempt);
            return Err(HandshakeError::Cancelled);
        }

        let hello = ClientHello::new(&self.audio)
            .to_json()
            .map_err(|e| HandshakeError::Publish(NetworkError::SendFailed(e.to_string())))?;

        if let Err(e) = link.publish_text(&hello) {
            tracing::error!("Failed to publish hello: {}", e);
            self.signal.disarm(attempt);
            return Err(HandshakeError::Publish(e));
        }

        tracing::debug!("Hello sent (attempt {}), waiting up to {:?}", attempt, self.timeout);

        match self.signal.wait(attempt, self.timeout) {
            Ok(params) => {
                tracing::info!(
                    "Session {} negotiated, udp {}:{}",
                    params.session_id,
                    params.server,
                    params.port
                );
                Ok(params)
            }
            Err(HandshakeError::Timeout(timeout)) => {
                tracing::error!("Failed to receive server hello within {:?}", timeout);
                Err(HandshakeError::Timeout(timeout))
            }
            Err(e) => Err(e),
        }
    }

    /// Обработать hello от сервера (вызывается диспетчером)
    pub fn on_server_hello(&self, message: &Value) {
        let outcome = parse_server_hello(message).map_err(|e| {
            tracing::error!("Rejecting server hello: {}", e);
            HandshakeError::Invalid(e)
        });

        if !self.signal.deliver(outcome) {
            tracing::warn!("Server hello received with no handshake pending, ignoring");
        }
    }

    /// Прервать ожидающую попытку
    pub fn cancel(&self) {
        if self.signal.deliver(Err(HandshakeError::Cancelled)) {
            tracing::info!("Pending handshake cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn full_ack() -> Value {
        json!({
            "type": "hello",
            "session_id": "abc123",
            "transport": "udp",
            "audio_params": {"sample_rate": 24000},
            "udp": {
                "server": "10.0.0.5",
                "port": 8884,
                "key": "00112233445566778899AABBCCDDEEFF",
                "nonce": "0102030405060708090A0B0C0D0E0F10"
            }
        })
    }

    #[test]
    fn test_parse_full_ack() {
        let params = parse_server_hello(&full_ack()).unwrap();
        assert_eq!(params.session_id, "abc123");
        assert_eq!(params.sample_rate, Some(24000));
        assert_eq!(params.server, "10.0.0.5");
        assert_eq!(params.port, 8884);
        assert_eq!(
            params.key,
            [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]
        );
        assert_eq!(params.nonce[0], 0x01);
        assert_eq!(params.nonce[15], 0x10);
    }

    #[test]
    fn test_parse_minimal_ack() {
        let ack = json!({
            "type": "hello",
            "session_id": "abc123",
            "udp": {
                "server": "10.0.0.5",
                "port": 8884,
                "key": "00112233445566778899AABBCCDDEEFF",
                "nonce": "0102030405060708090A0B0C0D0E0F10"
            }
        });
        let params = parse_server_hello(&ack).unwrap();
        assert_eq!(params.sample_rate, None);
        assert_eq!(params.port, 8884);
    }

    #[test]
    fn test_missing_session_id_is_unscoped() {
        let mut ack = full_ack();
        ack.as_object_mut().unwrap().remove("session_id");
        assert_eq!(parse_server_hello(&ack).unwrap().session_id, "");
    }

    #[test]
    fn test_each_missing_udp_field_rejects_whole_message() {
        for field in ["server", "port", "key", "nonce"] {
            let mut ack = full_ack();
            ack["udp"].as_object_mut().unwrap().remove(field);
            assert_eq!(
                parse_server_hello(&ack),
                Err(HelloError::MissingField(field)),
                "field {}",
                field
            );
        }

        let mut ack = full_ack();
        ack.as_object_mut().unwrap().remove("udp");
        assert_eq!(parse_server_hello(&ack), Err(HelloError::MissingField("udp")));
    }

    #[test]
    fn test_wrong_types_and_bad_hex() {
        let mut ack = full_ack();
        ack["udp"]["port"] = json!("8884");
        assert_eq!(parse_server_hello(&ack), Err(HelloError::WrongType("port")));

        let mut ack = full_ack();
        ack["udp"]["port"] = json!(70000);
        assert_eq!(parse_server_hello(&ack), Err(HelloError::WrongType("port")));

        let mut ack = full_ack();
        ack["udp"]["key"] = json!("0011");
        assert!(matches!(
            parse_server_hello(&ack),
            Err(HelloError::BadHex { field: "key", .. })
        ));

        let mut ack = full_ack();
        ack["udp"]["nonce"] = json!("zz02030405060708090A0B0C0D0E0F10");
        assert!(matches!(
            parse_server_hello(&ack),
            Err(HelloError::BadHex { field: "nonce", .. })
        ));
    }

    #[test]
    fn test_other_transport_is_rejected() {
        let mut ack = full_ack();
        ack["transport"] = json!("websocket");
        assert_eq!(
            parse_server_hello(&ack),
            Err(HelloError::UnsupportedTransport("websocket".into()))
        );
    }

    #[test]
    fn test_signal_times_out() {
        let signal = HelloSignal::default();
        let attempt = signal.arm();
        let started = Instant::now();

        let result = signal.wait(attempt, Duration::from_millis(50));
        assert!(matches!(result, Err(HandshakeError::Timeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(50));

        // late answer is not carried into the next attempt
        assert!(!signal.deliver(Ok(parse_server_hello(&full_ack()).unwrap())));
    }

    #[test]
    fn test_signal_fires_once_per_attempt() {
        let signal = Arc::new(HelloSignal::default());
        let attempt = signal.arm();

        let waiter = {
            let signal = signal.clone();
            std::thread::spawn(move || signal.wait(attempt, Duration::from_secs(5)))
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(signal.deliver(Ok(parse_server_hello(&full_ack()).unwrap())));
        assert!(!signal.deliver(Err(HandshakeError::Cancelled)));

        let params = waiter.join().unwrap().unwrap();
        assert_eq!(params.session_id, "abc123");
    }

    #[test]
    fn test_answer_before_wait_is_kept() {
        let signal = HelloSignal::default();
        let attempt = signal.arm();
        assert!(signal.deliver(Ok(parse_server_hello(&full_ack()).unwrap())));
        assert!(signal.wait(attempt, Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_rearm_clears_previous_outcome() {
        let signal = HelloSignal::default();
        signal.arm();
        assert!(signal.deliver(Ok(parse_server_hello(&full_ack()).unwrap())));

        let attempt = signal.arm();
        let result = signal.wait(attempt, Duration::from_millis(20));
        assert!(matches!(result, Err(HandshakeError::Timeout(_))));
    }

    #[test]
    fn test_coordinator_invalid_hello() {
        let coordinator = HandshakeCoordinator::new(AudioConfig::default(), Duration::from_secs(1));
        let attempt = coordinator.signal.arm();

        let mut ack = full_ack();
        ack["udp"].as_object_mut().unwrap().remove("key");
        coordinator.on_server_hello(&ack);

        let result = coordinator.signal.wait(attempt, Duration::from_millis(100));
        assert!(matches!(
            result,
            Err(HandshakeError::Invalid(HelloError::MissingField("key")))
        ));
    }

    #[test]
    fn test_coordinator_cancel_wakes_waiter() {
        let coordinator = Arc::new(HandshakeCoordinator::new(
            AudioConfig::default(),
            Duration::from_secs(5),
        ));
        let attempt = coordinator.signal.arm();

        let waiter = {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || coordinator.signal.wait(attempt, Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        coordinator.cancel();

        assert!(matches!(waiter.join().unwrap(), Err(HandshakeError::Cancelled)));
    }

    #[test]
    fn test_cancel_before_hello_is_not_lost() {
        use crate::config::ControlConfig;
        use crate::network::control::{ControlChannel, Credentials, QoS};
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Default)]
        struct CountingClient {
            published: AtomicUsize,
        }

        impl ControlChannel for CountingClient {
            fn connect(&self, _: &str, _: u16, _: &str, _: &Credentials) -> Result<(), NetworkError> {
                Ok(())
            }

            fn is_connected(&self) -> bool {
                true
            }

            fn publish(&self, _: &str, _: &[u8]) -> Result<(), NetworkError> {
                self.published.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }

            fn subscribe(&self, _: &str, _: QoS) -> Result<(), NetworkError> {
                Ok(())
            }

            fn disconnect(&self) {}
        }

        let client = Arc::new(CountingClient::default());
        let link = ControlLink::new(ControlConfig::default(), client.clone());
        let coordinator = HandshakeCoordinator::new(AudioConfig::default(), Duration::from_secs(5));

        let attempt = coordinator.begin();
        coordinator.cancel();

        let started = Instant::now();
        let result = coordinator.complete(attempt, &link);
        assert!(matches!(result, Err(HandshakeError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(client.published.load(Ordering::SeqCst), 0);

        // the next attempt starts clean
        let attempt = coordinator.begin();
        assert!(!coordinator.signal.is_cancelled(attempt));
    }
}
