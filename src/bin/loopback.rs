//! Демонстрация защищённого аудиоканала через loopback
//!
//! Поднимает в одном процессе брокер управляющего канала и тестовый
//! медиасервер, открывает сессию через hello, отправляет синтетические
//! аудиокадры по UDP, получает их эхо и закрывает сессию через goodbye.
//!
//! ```text
//! AudioChannel ──hello/goodbye──> InProcessBroker <──> LoopbackServer
//!      │                                                    │
//!      └────────── AES-CTR кадры (127.0.0.1/UDP) ──────────┘
//! ```

use anyhow::Result;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use secure_voice_link::{
    channel::ChannelSinks,
    network::{
        event_queue,
        loopback::{InProcessBroker, LoopbackOptions, LoopbackServer},
        UdpConnector,
    },
    AppConfig, AudioChannel, AudioSink,
};

/// Параметры запуска
struct DemoArgs {
    config_path: Option<PathBuf>,
    frames: u32,
    frame_size: usize,
}

impl Default for DemoArgs {
    fn default() -> Self {
        Self {
            config_path: None,
            frames: 50,
            frame_size: 120,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Инициализация логирования
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("═══════════════════════════════════════════════════════════════");
    tracing::info!("        Secure Voice Link - loopback session demo              ");
    tracing::info!("═══════════════════════════════════════════════════════════════");

    let args = parse_args();
    let config = match &args.config_path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    let broker = InProcessBroker::new();
    let server = LoopbackServer::start(&broker, LoopbackOptions::for_device(&config.control))?;
    tracing::info!("Медиасервер: {}", server.media_addr());

    // Счётчик эха от сервера
    let echoed = Arc::new(AtomicU64::new(0));
    let echo_counter = echoed.clone();
    let incoming: Arc<dyn AudioSink> = Arc::new(move |payload: Bytes| {
        echo_counter.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Эхо кадра: {} байт", payload.len());
    });

    let (events_tx, events_rx) = event_queue();
    let channel = Arc::new(AudioChannel::new(
        config.clone(),
        Arc::new(broker.client(events_tx)),
        events_rx,
        Arc::new(UdpConnector::new(config.network.clone())),
        ChannelSinks::new(incoming),
    ));
    channel.start()?;
    tracing::info!("Client id: {}", channel.client_id());

    // Подписываемся на события канала
    let mut event_rx = channel.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => tracing::info!("Событие канала: {:?}", event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Пропущено {} событий", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());

    // Рукопожатие блокирует поток до таймаута hello
    let opener = channel.clone();
    tokio::task::spawn_blocking(move || opener.open_audio_channel()).await??;
    tracing::info!(
        "Сессия {} открыта, частота сервера {} Гц",
        channel.session_id(),
        channel.server_sample_rate()
    );

    let mut interval = tokio::time::interval(Duration::from_millis(
        u64::from(config.audio.frame_duration_ms.max(1)),
    ));
    for index in 0..args.frames {
        if !running.load(Ordering::SeqCst) {
            tracing::info!("Прервано пользователем");
            break;
        }
        interval.tick().await;

        let frame = synthetic_frame(index, args.frame_size);
        if let Err(e) = channel.send_audio(&frame) {
            tracing::warn!("Кадр {} не отправлен: {}", index, e);
        }
    }

    // Ждём последние ответы
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = channel.transport_stats();
    tracing::info!(
        "Отправлено: {}, получено эхо: {}, отброшено: {}",
        stats.frames_sent,
        echoed.load(Ordering::Relaxed),
        stats.dropped_malformed + stats.dropped_replay + stats.dropped_decrypt + stats.dropped_stale
    );
    tracing::info!("Канал открыт: {}", channel.is_open());

    channel.close_audio_channel();
    tokio::time::sleep(Duration::from_millis(100)).await;
    tracing::info!(
        "Сервер: hello {}, goodbye {}, эхо {}",
        server.hello_count(),
        server.goodbye_count(),
        server.frames_echoed()
    );

    Ok(())
}

/// Псевдо-кадр кодека: номер кадра и детерминированный шум
fn synthetic_frame(index: u32, size: usize) -> Vec<u8> {
    let mut frame = Vec::with_capacity(size.max(4));
    frame.extend_from_slice(&index.to_be_bytes());
    let mut state = index.wrapping_mul(2_654_435_761).wrapping_add(1);
    while frame.len() < size {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        frame.push(state as u8);
    }
    frame
}

/// Разбор аргументов командной строки
fn parse_args() -> DemoArgs {
    let mut args = DemoArgs::default();
    let argv: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < argv.len() {
        match argv[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < argv.len() {
                    args.config_path = Some(PathBuf::from(&argv[i + 1]));
                    i += 1;
                }
            }
            "--frames" | "-f" => {
                if i + 1 < argv.len() {
                    if let Ok(frames) = argv[i + 1].parse() {
                        args.frames = frames;
                    }
                    i += 1;
                }
            }
            "--size" | "-s" => {
                if i + 1 < argv.len() {
                    if let Ok(size) = argv[i + 1].parse() {
                        args.frame_size = size;
                    }
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Secure Voice Link - loopback session demo");
                println!();
                println!("Использование: loopback [ОПЦИИ]");
                println!();
                println!("Опции:");
                println!("  -c, --config <ФАЙЛ>   Файл конфигурации TOML");
                println!("  -f, --frames <N>      Число кадров (по умолчанию: 50)");
                println!("  -s, --size <БАЙТ>     Размер кадра (по умолчанию: 120)");
                println!("  -h, --help            Показать справку");
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    args
}

/// Обработчик Ctrl+C
fn ctrlc_handler(running: Arc<AtomicBool>) {
    if let Err(e) = ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    }) {
        tracing::warn!("Не удалось установить обработчик Ctrl+C: {}", e);
    }
}
