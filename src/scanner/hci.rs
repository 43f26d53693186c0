//! Raw HCI socket backend for BTHome scanning.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.

use super::{
    ADVERTISEMENT_CHANNEL_BUFFER_SIZE, SERVICE_DATA_16_BIT_UUID, ScanError, ScanHandle, ScanMode,
    ScanOptions,
};
use crate::mac_address::MacAddress;
use crate::pipeline::{Advertisement, BTHOME_UUID};
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;

// HCI packet types
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Scan types
const LE_SCAN_PASSIVE: u8 = 0x00;
const LE_SCAN_ACTIVE: u8 = 0x01;

// Own address type
const LE_PUBLIC_ADDRESS: u8 = 0x00;

// Filter policy
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

// Scan interval and window, in 0.625 ms units
const LE_SCAN_INTERVAL: u16 = 0x0010;
const LE_SCAN_WINDOW: u16 = 0x0010;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// LE Set Scan Parameters command
#[repr(C, packed)]
struct LeSetScanParametersCmd {
    scan_type: u8,
    interval: u16,
    window: u16,
    own_address_type: u8,
    filter_policy: u8,
}

/// LE Set Scan Enable command
#[repr(C, packed)]
struct LeSetScanEnableCmd {
    enable: u8,
    filter_dup: u8,
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(0x01); // HCI command packet type
    packet.push((opcode & 0xFF) as u8);
    packet.push((opcode >> 8) as u8);
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Open a raw HCI socket
fn open_hci_socket() -> Result<OwnedFd, ScanError> {
    // Create a raw Bluetooth HCI socket using libc directly
    // since nix doesn't support BTPROTO_HCI
    // SOCK_NONBLOCK is required for AsyncFd to work properly
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };

    if fd < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to create HCI socket: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind HCI socket to a device
fn bind_hci_socket(fd: &OwnedFd, dev_id: u16) -> Result<(), ScanError> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: 0, // HCI_CHANNEL_RAW
    };

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to bind HCI socket: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Set HCI socket filter
fn set_hci_filter(fd: &OwnedFd) -> Result<(), ScanError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            0, // SOL_HCI
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to set HCI filter: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Send an HCI command
fn send_hci_command(fd: &OwnedFd, packet: &[u8]) -> Result<(), ScanError> {
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };

    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to send HCI command: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Parameter block of an HCI command, sent as its in-memory bytes.
///
/// Only implemented for `#[repr(C, packed)]` structs of integer fields, which
/// have no padding, so every byte of the value is initialised.
trait CommandParameters: Sized {
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: implementors are packed integer structs (see above), and the
        // slice borrows `self` for its whole length.
        unsafe {
            std::slice::from_raw_parts(self as *const Self as *const u8, mem::size_of::<Self>())
        }
    }
}

impl CommandParameters for LeSetScanParametersCmd {}
impl CommandParameters for LeSetScanEnableCmd {}

/// Configure LE scanning parameters and start scanning
fn configure_le_scan(fd: &OwnedFd, mode: ScanMode) -> Result<(), ScanError> {
    let params = LeSetScanParametersCmd {
        scan_type: match mode {
            ScanMode::Passive => LE_SCAN_PASSIVE,
            ScanMode::Active => LE_SCAN_ACTIVE,
        },
        interval: LE_SCAN_INTERVAL.to_le(),
        window: LE_SCAN_WINDOW.to_le(),
        own_address_type: LE_PUBLIC_ADDRESS,
        filter_policy: FILTER_POLICY_ACCEPT_ALL,
    };
    let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, params.as_bytes());
    send_hci_command(fd, &packet)?;

    set_scan_enable(fd, true)
}

fn set_scan_enable(fd: &OwnedFd, enable: bool) -> Result<(), ScanError> {
    let enable = LeSetScanEnableCmd {
        enable: u8::from(enable),
        filter_dup: 0x00, // Don't filter duplicates
    };
    let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, enable.as_bytes());
    send_hci_command(fd, &packet)
}

/// Command socket that disables scanning when dropped.
struct ScanEnableGuard(OwnedFd);

impl Drop for ScanEnableGuard {
    fn drop(&mut self) {
        match set_scan_enable(&self.0, false) {
            Ok(()) => debug!("HCI LE scan disabled."),
            Err(e) => warn!("Cannot disable HCI LE scan: {e}."),
        }
    }
}

/// Parse an adapter name (`hci0`, `hci1`, or a bare index) into a device id.
fn adapter_index(adapter: Option<&str>) -> Result<u16, ScanError> {
    let Some(name) = adapter else {
        return Ok(0);
    };
    name.strip_prefix("hci")
        .unwrap_or(name)
        .parse()
        .map_err(|_| ScanError::InvalidAdapter(name.to_string()))
}

/// Extract BTHome service data from the AD structures of a report.
fn bthome_service_data(ad_data: &[u8]) -> Vec<(u16, Vec<u8>)> {
    let mut service_data = Vec::new();
    let mut offset = 0;
    while offset + 2 <= ad_data.len() {
        let len = ad_data[offset] as usize;
        if len == 0 || offset + 1 + len > ad_data.len() {
            break;
        }

        let ad_type = ad_data[offset + 1];
        if ad_type == SERVICE_DATA_16_BIT_UUID && len >= 3 {
            let uuid = u16::from_le_bytes([ad_data[offset + 2], ad_data[offset + 3]]);
            if uuid == BTHOME_UUID {
                service_data.push((uuid, ad_data[offset + 4..offset + 1 + len].to_vec()));
            }
        }

        offset += 1 + len;
    }
    service_data
}

/// Parse LE advertising report and extract BTHome service data
fn parse_advertising_report(data: &[u8]) -> Option<Advertisement> {
    // Skip HCI header (1 byte packet type + 1 byte event code + 1 byte param len + 1 byte subevent)
    let report = data.get(4..)?;

    // Number of reports; only the first one is processed
    if *report.first()? == 0 {
        return None;
    }

    // Skip: num_reports(1) + event_type(1) + addr_type(1)
    let mut addr = [0u8; 6];
    addr.copy_from_slice(report.get(3..9)?);
    addr.reverse(); // HCI uses little-endian address

    let data_len = *report.get(9)? as usize;
    let ad_data = report.get(10..10 + data_len)?;
    // RSSI follows the AD data as a signed byte
    let rssi = i16::from(*report.get(10 + data_len)? as i8);

    let service_data = bthome_service_data(ad_data);
    if service_data.is_empty() {
        return None;
    }
    Some(Advertisement {
        address: MacAddress(addr),
        service_data,
        rssi,
    })
}

/// Start scanning for BTHome devices using raw HCI sockets.
///
/// This function opens a raw HCI socket, configures LE scanning, and
/// processes advertising reports until the returned handle is stopped, at
/// which point scanning is disabled again.
///
/// # Requirements
/// - CAP_NET_RAW and CAP_NET_ADMIN capabilities or root privileges
/// - An available HCI device (typically hci0)
pub async fn start_scan(options: &ScanOptions) -> Result<ScanHandle, ScanError> {
    let dev_id = adapter_index(options.adapter.as_deref())?;

    // Open and configure HCI socket for receiving events
    let fd = open_hci_socket()?;
    bind_hci_socket(&fd, dev_id)?;
    set_hci_filter(&fd)?;

    // We need a separate socket for sending commands (bound to specific device)
    let cmd_fd = open_hci_socket()?;
    bind_hci_socket(&cmd_fd, dev_id)?;
    configure_le_scan(&cmd_fd, options.mode)?;
    let scan_guard = ScanEnableGuard(cmd_fd);

    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

    // Wrap in AsyncFd for async I/O
    let async_fd = AsyncFd::new(fd)
        .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {}", e)))?;

    // Spawn a task to read and process HCI events
    let task = tokio::spawn(async move {
        let _scan_guard = scan_guard; // Disables scanning when the task ends
        let mut buf = [0u8; 258]; // Max HCI event size

        loop {
            // Wait for the socket to be readable
            let mut guard = match async_fd.readable().await {
                Ok(guard) => guard,
                Err(_) => break,
            };

            // Drain all available packets before waiting again
            loop {
                let n = match guard.try_io(|inner| {
                    let ret = unsafe {
                        libc::read(
                            inner.as_raw_fd(),
                            buf.as_mut_ptr() as *mut c_void,
                            buf.len(),
                        )
                    };
                    if ret < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(ret as usize)
                    }
                }) {
                    Ok(Ok(n)) if n > 0 => n,
                    Ok(Ok(_)) => break,  // EOF or empty read
                    Ok(Err(_)) => break, // Read error
                    Err(_) => break,     // WouldBlock - no more data
                };

                // Check if this is an LE advertising report
                if n >= 4
                    && buf[0] == HCI_EVENT_PKT
                    && buf[1] == EVT_LE_META_EVENT
                    && buf[3] == EVT_LE_ADVERTISING_REPORT
                    && let Some(advertisement) = parse_advertising_report(&buf[..n])
                    && tx.send(advertisement).await.is_err()
                {
                    return;
                }
            }
        }
    });

    Ok(ScanHandle::new(rx, task))
}
