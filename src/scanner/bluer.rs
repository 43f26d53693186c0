//! BlueZ D-Bus backend for BTHome scanning.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.
//!
//! Passive scanning registers an advertisement monitor matching BTHome
//! service data; active scanning runs LE discovery filtered on the BTHome
//! UUID. In both modes every matching device is then watched for service
//! data changes, as BlueZ reports each advertisement as a property update.

use super::{
    ADVERTISEMENT_CHANNEL_BUFFER_SIZE, SERVICE_DATA_16_BIT_UUID, ScanError, ScanHandle, ScanMode,
    ScanOptions, short_uuid,
};
use crate::crypto::BTHOME_UUID_BYTES;
use crate::mac_address::MacAddress;
use crate::pipeline::{Advertisement, BTHOME_UUID};
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{
    Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport, Session, Uuid,
};
use futures::{Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::debug;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Full 128-bit form of the BTHome service UUID.
fn bthome_uuid() -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5F9B_34FB | (u128::from(BTHOME_UUID) << 96))
}

/// Start scanning for BTHome devices using the BlueZ D-Bus backend.
///
/// This function powers on the adapter and starts a passive or active scan.
/// Received advertisements are sent through the returned handle until it is
/// stopped.
pub async fn start_scan(options: &ScanOptions) -> Result<ScanHandle, ScanError> {
    let session = Session::new().await?;
    let adapter = match &options.adapter {
        Some(name) => session.adapter(name)?,
        None => session.default_adapter().await?,
    };
    adapter.set_powered(true).await?;

    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

    let task = match options.mode {
        ScanMode::Passive => {
            let pattern = Pattern {
                data_type: SERVICE_DATA_16_BIT_UUID,
                start_position: 0,
                content: BTHOME_UUID_BYTES.to_vec(),
            };
            let monitor_manager = adapter.monitor().await?;
            let monitor_handle = monitor_manager
                .register(Monitor {
                    patterns: Some(vec![pattern]),
                    ..Default::default()
                })
                .await?;

            let found = monitor_handle.filter_map(|event| async move {
                match event {
                    MonitorEvent::DeviceFound(device_id) => Some(device_id.device),
                    _ => None,
                }
            });
            tokio::spawn(async move {
                // Keep all Bluetooth state alive by moving it into this task
                let _session = session;
                let _monitor_manager = monitor_manager;
                watch_devices(adapter, Box::pin(found), tx).await;
            })
        }
        ScanMode::Active => {
            adapter
                .set_discovery_filter(DiscoveryFilter {
                    uuids: HashSet::from([bthome_uuid()]),
                    transport: DiscoveryTransport::Le,
                    duplicate_data: true,
                    ..Default::default()
                })
                .await?;
            let discovery = adapter.discover_devices().await?;

            let found = discovery.filter_map(|event| async move {
                match event {
                    AdapterEvent::DeviceAdded(address) => Some(address),
                    _ => None,
                }
            });
            tokio::spawn(async move {
                let _session = session;
                watch_devices(adapter, Box::pin(found), tx).await;
            })
        }
    };

    Ok(ScanHandle::new(rx, task))
}

/// Forward service data of every found device until the stream ends.
///
/// Per-device watchers live in a [`JoinSet`] so they stop with this task.
async fn watch_devices(
    adapter: Adapter,
    mut found: Pin<Box<dyn Stream<Item = Address> + Send>>,
    tx: mpsc::Sender<Advertisement>,
) {
    let mut watchers = JoinSet::new();
    let mut watched = HashSet::new();

    while let Some(address) = found.next().await {
        if let Err(e) = send_current(&adapter, address, &tx).await {
            debug!("Cannot read service data of {address}: {e}.");
        }
        if watched.insert(address) {
            let adapter = adapter.clone();
            let tx = tx.clone();
            watchers.spawn(async move {
                if let Err(e) = watch_device(&adapter, address, &tx).await {
                    debug!("Stopped watching {address}: {e}.");
                }
                address
            });
        }
        // Devices whose watcher ended are watched again when found again.
        while let Some(finished) = watchers.try_join_next() {
            if let Ok(address) = finished {
                watched.remove(&address);
            }
        }
    }
}

async fn send_current(
    adapter: &Adapter,
    address: Address,
    tx: &mpsc::Sender<Advertisement>,
) -> Result<(), ScanError> {
    let device = adapter.device(address)?;
    let Some(service_data) = device.service_data().await? else {
        return Ok(());
    };
    let rssi = device.rssi().await?.unwrap_or_default();
    if let Some(advertisement) = advertisement(address, &service_data, rssi) {
        let _ = tx.send(advertisement).await;
    }
    Ok(())
}

async fn watch_device(
    adapter: &Adapter,
    address: Address,
    tx: &mpsc::Sender<Advertisement>,
) -> Result<(), ScanError> {
    let device = adapter.device(address)?;
    let mut rssi = device.rssi().await?.unwrap_or_default();
    let mut events = device.events().await?;

    while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
        match property {
            DeviceProperty::Rssi(value) => rssi = value,
            DeviceProperty::ServiceData(service_data) => {
                if let Some(advertisement) = advertisement(address, &service_data, rssi)
                    && tx.send(advertisement).await.is_err()
                {
                    break;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Build an advertisement from the BTHome entries of BlueZ service data.
fn advertisement(
    address: Address,
    service_data: &HashMap<Uuid, Vec<u8>>,
    rssi: i16,
) -> Option<Advertisement> {
    let service_data: Vec<(u16, Vec<u8>)> = service_data
        .iter()
        .filter_map(|(uuid, data)| short_uuid(uuid.as_u128()).map(|short| (short, data.clone())))
        .filter(|(uuid, _)| *uuid == BTHOME_UUID)
        .collect();
    (!service_data.is_empty()).then(|| Advertisement {
        address: MacAddress::from(address),
        service_data,
        rssi,
    })
}
