//! BLE scanner abstraction for BTHome devices.
//!
//! This module provides a trait-based abstraction over different Bluetooth
//! scanning backends. Every backend delivers [`Advertisement`]s carrying the
//! service data of the BTHome UUID through a [`ScanHandle`].

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::pipeline::Advertisement;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Adapter name not understood by the backend
    #[error("Invalid adapter '{0}'")]
    InvalidAdapter(String),
}

/// Channel buffer size for received advertisements.
pub const ADVERTISEMENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Bluetooth "Service Data - 16-bit UUID" AD type.
pub const SERVICE_DATA_16_BIT_UUID: u8 = 0x16;

/// Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// The 16-bit form of a 128-bit UUID built on the Bluetooth base UUID.
pub fn short_uuid(uuid: u128) -> Option<u16> {
    let short = (uuid >> 96) as u32;
    let base = uuid & !(u128::from(u32::MAX) << 96);
    (base == BLUETOOTH_BASE_UUID && short <= u32::from(u16::MAX)).then_some(short as u16)
}

/// Scanning mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanMode {
    /// Only listen to advertisements.
    #[default]
    Passive,
    /// Send scan requests and also receive scan responses.
    Active,
}

/// What to scan with and how.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOptions {
    pub mode: ScanMode,
    /// Adapter name such as `hci0`; the system default when `None`.
    pub adapter: Option<String>,
}

/// A running scan. Scanning stops when the handle is stopped or dropped.
#[derive(Debug)]
pub struct ScanHandle {
    advertisements: mpsc::Receiver<Advertisement>,
    task: Option<JoinHandle<()>>,
}

impl ScanHandle {
    /// Wrap a backend task feeding `advertisements`. The task is aborted when
    /// the handle goes away, so it must release the radio on drop.
    pub fn new(advertisements: mpsc::Receiver<Advertisement>, task: JoinHandle<()>) -> Self {
        Self {
            advertisements,
            task: Some(task),
        }
    }

    /// Next advertisement, or `None` once the backend has stopped.
    pub async fn recv(&mut self) -> Option<Advertisement> {
        self.advertisements.recv().await
    }

    /// Stop scanning and wait for the backend to release the adapter.
    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

/// Start scanning for BTHome devices using the specified backend.
///
/// This is the main entry point for creating a scanner. It dispatches to the
/// appropriate backend implementation based on the `backend` parameter.
pub async fn start_scan(backend: Backend, options: &ScanOptions) -> Result<ScanHandle, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::start_scan(options).await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::start_scan(options).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TEST_MAC;

    #[test]
    fn test_short_uuid() {
        assert_eq!(
            short_uuid(0x0000_FCD2_0000_1000_8000_0080_5F9B_34FB),
            Some(0xFCD2)
        );
        assert_eq!(
            short_uuid(0x0000_181A_0000_1000_8000_0080_5F9B_34FB),
            Some(0x181A)
        );
        // 32-bit UUIDs are not 16-bit UUIDs.
        assert_eq!(short_uuid(0x0001_FCD2_0000_1000_8000_0080_5F9B_34FB), None);
        assert_eq!(short_uuid(0x1234_5678_9ABC_DEF0_1234_5678_9ABC_DEF0), None);
    }

    #[test]
    fn test_scan_error_display() {
        let err = ScanError::Bluetooth("adapter is off".to_string());
        assert_eq!(format!("{}", err), "Bluetooth error: adapter is off");
        let err = ScanError::InvalidAdapter("usb0".to_string());
        assert_eq!(format!("{}", err), "Invalid adapter 'usb0'");
    }

    #[tokio::test]
    async fn test_scan_handle_delivers_until_backend_stops() {
        let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);
        let task = tokio::spawn(async move {
            let _ = tx
                .send(Advertisement {
                    address: TEST_MAC,
                    service_data: vec![],
                    rssi: -40,
                })
                .await;
        });
        let mut handle = ScanHandle::new(rx, task);

        assert_eq!(handle.recv().await.unwrap().rssi, -40);
        assert!(handle.recv().await.is_none());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_scan_handle_recv_waits_for_backend() {
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(std::future::pending::<()>());
        let mut handle = ScanHandle::new(rx, task);

        {
            let mut recv = tokio_test::task::spawn(handle.recv());
            tokio_test::assert_pending!(recv.poll());
            tx.try_send(Advertisement {
                address: TEST_MAC,
                service_data: vec![],
                rssi: -55,
            })
            .unwrap();
            assert!(recv.is_woken());
            let advertisement = tokio_test::assert_ready!(recv.poll());
            assert_eq!(advertisement.unwrap().rssi, -55);
        }
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_scan_handle_stop_aborts_backend() {
        let (tx, rx) = mpsc::channel::<Advertisement>(1);
        let task = tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        let handle = ScanHandle::new(rx, task);
        tokio::time::timeout(std::time::Duration::from_secs(1), handle.stop())
            .await
            .unwrap();
    }

    #[test]
    #[cfg(feature = "bluer")]
    fn test_bluer_backend_display() {
        assert_eq!(format!("{}", Backend::Bluer), "bluer");
    }

    #[test]
    #[cfg(feature = "hci")]
    fn test_hci_backend_display() {
        assert_eq!(format!("{}", Backend::Hci), "hci");
    }
}
