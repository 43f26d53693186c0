//! Core application runner (business logic) for `bthome-gateway`.
//!
//! This module is intentionally decoupled from CLI parsing, logging setup and
//! process exit codes so it can be tested deterministically.

use crate::config::{self, ConfigError, DEFAULT_CONFIG_FILE};
use crate::device::DeviceRegistry;
use crate::duration::{parse_positive_duration, parse_scan_time};
use crate::pipeline::Pipeline;
use crate::publish::mqtt::MqttConnector;
use crate::publish::{PublishReport, Publisher};
use crate::scanner::{Backend, ScanError, ScanHandle, ScanMode, ScanOptions};
use clap::{Parser, ValueEnum};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, level_filters::LevelFilter};

/// Log severity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// `CRITICAL` maps onto `ERROR`, the most severe tracing level.
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
        }
    }
}

/// Monitor BTHome v2 devices and publish their measurements to MQTT brokers.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// File describing the BTHome devices to monitor and where to publish
    /// their measurements.
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_FILE)]
    pub config_file: PathBuf,

    /// Bluetooth adapter to use (hci0, hci1, ...). Defaults to the system default.
    #[arg(short = 'a', long)]
    pub adapter: Option<String>,

    /// BLE scan time. Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    /// Without suffix, value is interpreted as seconds.
    /// Zero or a negative value scans without pauses.
    #[arg(short = 's', long, default_value = "0", value_parser = parse_scan_time, allow_hyphen_values = true)]
    pub scan_time: Duration,

    /// Pause between scans. Ignored when scanning without pauses.
    #[arg(short = 'p', long, default_value = "1", value_parser = parse_positive_duration)]
    pub scan_pause: Duration,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Use active instead of passive scanning
    #[arg(long)]
    pub active: bool,

    /// File where to write log messages. Defaults to standard error.
    #[arg(short = 'l', long)]
    pub log_file: Option<PathBuf>,

    /// Log level
    #[arg(long, value_enum, default_value_t, ignore_case = true)]
    pub log_level: LogLevel,

    /// Log measurements as INFO, instead of as DEBUG
    #[arg(short = 'm', long)]
    pub measurements_as_info: bool,

    /// Include timestamps into log messages
    #[arg(short = 't', long)]
    pub timestamp: bool,

    /// Include the date into timestamps
    #[arg(short = 'd', long)]
    pub date: bool,
}

impl Options {
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            mode: if self.active {
                ScanMode::Active
            } else {
                ScanMode::Passive
            },
            adapter: self.adapter.clone(),
        }
    }

    /// Scan time and pause, or `None` when scanning without pauses.
    fn schedule(&self) -> Option<(Duration, Duration)> {
        (!self.scan_time.is_zero()).then_some((self.scan_time, self.scan_pause))
    }
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("BLE scanner stopped unexpectedly")]
    ScannerStopped,
}

/// Scanner abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait Scanner: Send + Sync {
    fn start_scan<'a>(
        &'a self,
        options: &'a ScanOptions,
    ) -> Pin<Box<dyn Future<Output = Result<ScanHandle, ScanError>> + Send + 'a>>;
}

/// Real scanner implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner {
    backend: Backend,
}

impl RealScanner {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }
}

impl Scanner for RealScanner {
    fn start_scan<'a>(
        &'a self,
        options: &'a ScanOptions,
    ) -> Pin<Box<dyn Future<Output = Result<ScanHandle, ScanError>> + Send + 'a>> {
        Box::pin(async move { crate::scanner::start_scan(self.backend, options).await })
    }
}

/// How a scan period ended.
enum ScanEnd {
    Elapsed,
    Stopped,
    ScannerGone,
}

/// Load the configuration and run with the real scanner and MQTT until `stop`.
pub async fn run(options: Options, stop: impl Future<Output = ()>) -> Result<(), RunError> {
    let registry = config::load(&options.config_file)?;
    let scanner = RealScanner::new(options.backend);
    let publisher = Publisher::new(Arc::new(MqttConnector::new()));
    run_with_scanner(&options, registry, &scanner, publisher, stop).await
}

/// Run the scan/pause cycle until `stop` completes.
///
/// Advertisements are processed one at a time; their deliveries are published
/// in the background. On stop, scanning ends and in-flight publishes are
/// awaited (each is bounded by the publisher timeout).
pub async fn run_with_scanner(
    options: &Options,
    registry: DeviceRegistry,
    scanner: &dyn Scanner,
    publisher: Publisher,
    stop: impl Future<Output = ()>,
) -> Result<(), RunError> {
    let scan_options = options.scan_options();
    let schedule = options.schedule();
    let mut pipeline =
        Pipeline::new(registry).with_measurements_as_info(options.measurements_as_info);
    let mut publishes = JoinSet::new();
    let mut stop = std::pin::pin!(stop);

    debug!(
        "BLE scanner parameters: backend = {}, mode = {:?}, adapter = {:?}.",
        options.backend, scan_options.mode, scan_options.adapter
    );
    info!("Starting BLE scanner.");
    let mut handle = scanner.start_scan(&scan_options).await?;
    match schedule {
        Some((scan, pause)) => info!(
            "BLE scanner started ({} s on / {} s off).",
            scan.as_secs_f64(),
            pause.as_secs_f64()
        ),
        None => info!("BLE scanner started (continuous scanning)."),
    }

    let result = loop {
        let deadline = schedule.map(|(scan, _)| Instant::now() + scan);
        let end = scan_until(
            &mut handle,
            &mut pipeline,
            &publisher,
            &mut publishes,
            deadline,
            stop.as_mut(),
        )
        .await;
        handle.stop().await;

        match end {
            ScanEnd::Stopped => break Ok(()),
            ScanEnd::ScannerGone => break Err(RunError::ScannerStopped),
            ScanEnd::Elapsed => debug!("BLE scanner stopped."),
        }

        // Only scheduled scans elapse.
        let pause = schedule.map(|(_, pause)| pause).unwrap_or_default();
        tokio::select! {
            _ = stop.as_mut() => break Ok(()),
            _ = sleep(pause) => {}
        }

        handle = match scanner.start_scan(&scan_options).await {
            Ok(handle) => handle,
            Err(e) => break Err(e.into()),
        };
        debug!("BLE scanner restarted.");
    };

    if !publishes.is_empty() {
        debug!("Waiting for {} in-flight publishes.", publishes.len());
    }
    while publishes.join_next().await.is_some() {}
    if result.is_ok() {
        info!("BLE scanner stopped.");
    }
    result
}

/// Process advertisements until the deadline, the stop signal, or the end
/// of the scanner's stream.
async fn scan_until(
    handle: &mut ScanHandle,
    pipeline: &mut Pipeline,
    publisher: &Publisher,
    publishes: &mut JoinSet<PublishReport>,
    deadline: Option<Instant>,
    mut stop: Pin<&mut impl Future<Output = ()>>,
) -> ScanEnd {
    let elapsed = async {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    let mut elapsed = std::pin::pin!(elapsed);

    loop {
        tokio::select! {
            _ = stop.as_mut() => return ScanEnd::Stopped,
            _ = elapsed.as_mut() => return ScanEnd::Elapsed,
            Some(_) = publishes.join_next(), if !publishes.is_empty() => {}
            advertisement = handle.recv() => {
                let Some(advertisement) = advertisement else {
                    return ScanEnd::ScannerGone;
                };
                for delivery in pipeline.process(&advertisement) {
                    let publisher = publisher.clone();
                    publishes.spawn(async move { publisher.publish(&delivery).await });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BrokerTarget, DeviceState};
    use crate::mac_address::MacAddress;
    use crate::pipeline::{Advertisement, BTHOME_UUID};
    use crate::publish::{BrokerSession, Connector, TransportError};
    use crate::scanner::ADVERTISEMENT_CHANNEL_BUFFER_SIZE;
    use crate::test_utils::{TEST_MAC, test_broker};
    use futures::future::BoxFuture;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct FakeScanner {
        advertisements: Mutex<Vec<Advertisement>>,
        /// Close the channel after sending instead of scanning on.
        finish: bool,
        fail: bool,
        starts: AtomicUsize,
    }

    impl FakeScanner {
        fn new(advertisements: Vec<Advertisement>) -> Self {
            Self {
                advertisements: Mutex::new(advertisements),
                finish: false,
                fail: false,
                starts: AtomicUsize::new(0),
            }
        }
    }

    impl Scanner for FakeScanner {
        fn start_scan<'a>(
            &'a self,
            _options: &'a ScanOptions,
        ) -> Pin<Box<dyn Future<Output = Result<ScanHandle, ScanError>> + Send + 'a>> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            // Every advertisement is delivered once, on the first scan.
            let advertisements = std::mem::take(&mut *self.advertisements.lock().unwrap());
            let finish = self.finish;
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    return Err(ScanError::Bluetooth("adapter not ready".to_string()));
                }
                let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);
                let task = tokio::spawn(async move {
                    for advertisement in advertisements {
                        let _ = tx.send(advertisement).await;
                    }
                    if !finish {
                        let _tx = tx;
                        std::future::pending::<()>().await;
                    }
                });
                Ok(ScanHandle::new(rx, task))
            })
        }
    }

    #[derive(Default)]
    struct RecordingConnector {
        connect_delay: Duration,
        published: Arc<Mutex<Vec<(String, String)>>>,
    }

    struct RecordingSession {
        published: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl BrokerSession for RecordingSession {
        fn publish<'a>(
            &'a self,
            topic: &'a str,
            payload: &'a [u8],
        ) -> BoxFuture<'a, Result<(), TransportError>> {
            Box::pin(async move {
                self.published.lock().unwrap().push((
                    topic.to_string(),
                    String::from_utf8_lossy(payload).into_owned(),
                ));
                Ok(())
            })
        }

        fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
            Box::pin(async { Ok(()) })
        }
    }

    impl Connector for RecordingConnector {
        fn connect<'a>(
            &'a self,
            _client_id: &'a str,
            _target: &'a BrokerTarget,
        ) -> BoxFuture<'a, Result<Box<dyn BrokerSession>, TransportError>> {
            Box::pin(async move {
                sleep(self.connect_delay).await;
                Ok(Box::new(RecordingSession {
                    published: Arc::clone(&self.published),
                }) as Box<dyn BrokerSession>)
            })
        }
    }

    fn options(args: &[&str]) -> Options {
        Options::parse_from(std::iter::once("bthome-gateway").chain(args.iter().copied()))
    }

    fn registry() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        registry.insert(DeviceState::new(TEST_MAC, vec![test_broker("localhost")]));
        registry
    }

    fn battery(address: MacAddress, level: u8) -> Advertisement {
        Advertisement {
            address,
            service_data: vec![(BTHOME_UUID, vec![0x40, 0x01, level])],
            rssi: -70,
        }
    }

    #[test]
    fn options_defaults() {
        let options = options(&[]);
        assert_eq!(options.config_file, PathBuf::from("bthome_devices.toml"));
        assert_eq!(options.scan_time, Duration::ZERO);
        assert_eq!(options.scan_pause, Duration::from_secs(1));
        assert_eq!(options.log_level, LogLevel::Info);
        assert_eq!(options.scan_options(), ScanOptions::default());
        assert!(options.schedule().is_none());
    }

    #[test]
    fn options_parse_all_flags() {
        let options = options(&[
            "-c",
            "devices.toml",
            "-a",
            "hci1",
            "-s",
            "1.5",
            "-p",
            "500ms",
            "--active",
            "--log-level",
            "warning",
            "-m",
            "-t",
        ]);
        assert_eq!(options.config_file, PathBuf::from("devices.toml"));
        assert_eq!(
            options.scan_options(),
            ScanOptions {
                mode: ScanMode::Active,
                adapter: Some("hci1".to_string()),
            }
        );
        assert_eq!(
            options.schedule(),
            Some((Duration::from_millis(1500), Duration::from_millis(500)))
        );
        assert_eq!(options.log_level, LogLevel::Warning);
        assert_eq!(options.log_level.to_level_filter(), LevelFilter::WARN);
        assert!(options.measurements_as_info);
        assert!(options.timestamp);
    }

    #[test]
    fn options_reject_zero_pause_and_accept_negative_scan_time() {
        assert!(Options::try_parse_from(["bthome-gateway", "-p", "0"]).is_err());
        assert_eq!(options(&["-s", "-1"]).scan_time, Duration::ZERO);
    }

    #[test]
    fn critical_maps_to_error() {
        assert_eq!(LogLevel::Critical.to_level_filter(), LevelFilter::ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_scan_publishes_until_stopped() {
        let scanner = FakeScanner::new(vec![
            battery(TEST_MAC, 100),
            battery(MacAddress([1, 2, 3, 4, 5, 6]), 50),
            battery(TEST_MAC, 99),
        ]);
        let connector = Arc::new(RecordingConnector::default());
        let publisher = Publisher::new(connector.clone());

        run_with_scanner(
            &options(&[]),
            registry(),
            &scanner,
            publisher,
            sleep(Duration::from_secs(5)),
        )
        .await
        .unwrap();

        assert_eq!(scanner.starts.load(Ordering::SeqCst), 1);
        let mut published = connector.published.lock().unwrap().clone();
        published.sort();
        assert_eq!(
            published,
            vec![
                (
                    "bthome/test".to_string(),
                    r#"{"battery":[100.0,"%"],"RSSI":[-70.0,"dBm"]}"#.to_string()
                ),
                (
                    "bthome/test".to_string(),
                    r#"{"battery":[99.0,"%"],"RSSI":[-70.0,"dBm"]}"#.to_string()
                ),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scan_and_pause_alternate() {
        let scanner = FakeScanner::new(vec![]);
        let publisher = Publisher::new(Arc::new(RecordingConnector::default()));

        // Scans start at 0 s, 15 s and 30 s.
        run_with_scanner(
            &options(&["-s", "10", "-p", "5"]),
            registry(),
            &scanner,
            publisher,
            sleep(Duration::from_secs(32)),
        )
        .await
        .unwrap();

        assert_eq!(scanner.starts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_pause_ends_promptly() {
        let scanner = FakeScanner::new(vec![]);
        let publisher = Publisher::new(Arc::new(RecordingConnector::default()));
        let started = Instant::now();

        run_with_scanner(
            &options(&["-s", "1", "-p", "1h"]),
            registry(),
            &scanner,
            publisher,
            sleep(Duration::from_secs(2)),
        )
        .await
        .unwrap();

        assert_eq!(scanner.starts.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_publishes() {
        let scanner = FakeScanner::new(vec![battery(TEST_MAC, 100)]);
        let connector = Arc::new(RecordingConnector {
            connect_delay: Duration::from_secs(3),
            ..Default::default()
        });
        let publisher = Publisher::new(connector.clone());

        run_with_scanner(
            &options(&[]),
            registry(),
            &scanner,
            publisher,
            sleep(Duration::from_secs(1)),
        )
        .await
        .unwrap();

        assert_eq!(connector.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scanner_start_failure_is_an_error() {
        let mut scanner = FakeScanner::new(vec![]);
        scanner.fail = true;
        let publisher = Publisher::new(Arc::new(RecordingConnector::default()));

        let result = run_with_scanner(
            &options(&[]),
            registry(),
            &scanner,
            publisher,
            std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(RunError::Scan(ScanError::Bluetooth(_)))));
    }

    #[tokio::test]
    async fn scanner_ending_is_an_error() {
        let mut scanner = FakeScanner::new(vec![battery(TEST_MAC, 100)]);
        scanner.finish = true;
        let connector = Arc::new(RecordingConnector::default());
        let publisher = Publisher::new(connector.clone());

        let result = run_with_scanner(
            &options(&[]),
            registry(),
            &scanner,
            publisher,
            std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(RunError::ScannerStopped)));
        // The advertisement received before the end is still published.
        assert_eq!(connector.published.lock().unwrap().len(), 1);
    }
}
