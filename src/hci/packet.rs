//! HCI Packet Decoding and Encoding
//!
//! Converts raw HCI event packets into [`HciEvent`]s and the LE radio
//! [`Command`]s into HCI command packets, for transports that exchange H4
//! frames with the controller. GATT and security traffic is handled by the
//! host stack underneath the transport and never passes through here.
//!
//! Only the events the driver acts on are decoded; anything else yields
//! [`PacketError::Unsupported`] and should be dropped by the transport.

use bt_hci::cmd::le::{
    LeCreateConn, LeCreateConnCancel, LeSetAdvData, LeSetAdvEnable, LeSetAdvParams,
    LeSetScanEnable, LeSetScanParams, LeSetScanResponseData,
};
use bt_hci::cmd::link_control::Disconnect;
use bt_hci::event::Event;
use bt_hci::event::le::LeEvent;
use bt_hci::param::{
    AddrKind, AdvChannelMap, AdvFilterPolicy, AdvKind, BdAddr, ConnHandle, Duration, LeConnRole,
    LeScanKind, ScanningFilterPolicy,
};
use bt_hci::{ControllerToHostPacket, FromHciBytes, FromHciBytesError, WriteHci};
use heapless::Vec;

use super::{AdvertisingKind, AdvertisingReport, Command, HciEvent, Role};
use crate::constants::{SCAN_INTERVAL, SCAN_WINDOW};
use crate::{AddressType, BluetoothAddress, BluetoothError};

/// Largest command packet produced by [`encode_command`]
pub const MAX_COMMAND_SIZE: usize = 64;

/// Shortest connection interval in 1.25 ms units (30 ms)
const CONN_INTERVAL_MIN: u16 = 0x0018;

/// Longest connection interval in 1.25 ms units (50 ms)
const CONN_INTERVAL_MAX: u16 = 0x0028;

/// Supervision timeout in 10 ms units
const SUPERVISION_TIMEOUT: u16 = 0x01F4;

/// HCI packet decoding errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketError {
    /// Fewer bytes than the header or parameters require
    TooShort,
    /// Event or command not handled by this codec
    Unsupported,
    /// Field value out of range or inconsistent lengths
    Malformed,
}

impl core::fmt::Display for PacketError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TooShort => write!(f, "HCI packet too short"),
            Self::Unsupported => write!(f, "HCI packet not supported"),
            Self::Malformed => write!(f, "Malformed HCI packet"),
        }
    }
}

impl From<FromHciBytesError> for PacketError {
    fn from(err: FromHciBytesError) -> Self {
        match err {
            FromHciBytesError::InvalidSize => Self::TooShort,
            FromHciBytesError::InvalidValue => Self::Malformed,
        }
    }
}

impl From<BluetoothError> for PacketError {
    fn from(_: BluetoothError) -> Self {
        Self::Malformed
    }
}

impl From<PacketError> for BluetoothError {
    fn from(_: PacketError) -> Self {
        BluetoothError::Failed
    }
}

/// Decode an H4 frame starting with the packet indicator
///
/// # Errors
/// Returns `PacketError::Unsupported` for anything but an event packet, and
/// the errors of [`decode_event`] otherwise.
pub fn decode_h4(frame: &[u8]) -> Result<HciEvent, PacketError> {
    match ControllerToHostPacket::from_hci_bytes_complete(frame)? {
        ControllerToHostPacket::Event(event) => convert_event(event),
        _ => Err(PacketError::Unsupported),
    }
}

/// Decode an HCI event packet (`event code`, `length`, `parameters`)
///
/// # Errors
/// Returns `PacketError::TooShort` if the packet is truncated,
/// `PacketError::Malformed` if a field is out of range and
/// `PacketError::Unsupported` for events the driver does not use.
pub fn decode_event(packet: &[u8]) -> Result<HciEvent, PacketError> {
    convert_event(Event::from_hci_bytes_complete(packet)?)
}

fn convert_event(event: Event<'_>) -> Result<HciEvent, PacketError> {
    match event {
        Event::DisconnectionComplete(e) => {
            // A failed disconnect leaves the link up.
            if e.status.to_result().is_err() {
                return Err(PacketError::Unsupported);
            }
            Ok(HciEvent::Disconnected {
                handle: e.handle.raw(),
                reason: e.reason.into_inner(),
            })
        }
        Event::CommandComplete(e) => Ok(HciEvent::CommandComplete {
            opcode: e.cmd_opcode,
            status: e.status.into_inner(),
        }),
        Event::CommandStatus(e) => Ok(HciEvent::CommandStatus {
            opcode: e.cmd_opcode,
            status: e.status.into_inner(),
        }),
        Event::Le(LeEvent::LeConnectionComplete(e)) => Ok(HciEvent::Connected {
            status: e.status.into_inner(),
            handle: e.handle.raw(),
            role: match e.role {
                LeConnRole::Central => Role::Central,
                LeConnRole::Peripheral => Role::Peripheral,
            },
            address: BluetoothAddress::try_from(e.peer_addr)?,
            address_type: AddressType::try_from(e.peer_addr_kind)?,
        }),
        Event::Le(LeEvent::LeAdvertisingReport(e)) => {
            // Only the first report of a batch is used.
            let report = e.reports.iter().next().ok_or(PacketError::Malformed)??;
            Ok(HciEvent::AdvertisingReport(AdvertisingReport {
                kind: AdvertisingKind::from(report.event_kind),
                address_type: AddressType::try_from(report.addr_kind)?,
                address: BluetoothAddress::try_from(report.addr)?,
                rssi: report.rssi,
                data: Vec::from_slice(report.data).map_err(|()| PacketError::Malformed)?,
            }))
        }
        _ => Err(PacketError::Unsupported),
    }
}

fn write_packet<T: WriteHci>(cmd: &T) -> Result<Vec<u8, MAX_COMMAND_SIZE>, PacketError> {
    let mut buf = [0u8; MAX_COMMAND_SIZE];
    let size = cmd.size();
    let dst = buf.get_mut(..size).ok_or(PacketError::Malformed)?;
    cmd.write_hci(dst).map_err(|_| PacketError::Malformed)?;
    Vec::from_slice(&buf[..size]).map_err(|()| PacketError::Malformed)
}

fn padded(data: &[u8]) -> (u8, [u8; 31]) {
    let mut buf = [0u8; 31];
    let len = data.len().min(buf.len());
    buf[..len].copy_from_slice(&data[..len]);
    (len as u8, buf)
}

/// Encode an LE radio command as an HCI command packet (`opcode`, `length`,
/// `parameters`), without the H4 indicator
///
/// # Errors
/// Returns `PacketError::Unsupported` for commands that are not HCI commands
/// (GATT, security and notification requests).
pub fn encode_command(command: &Command) -> Result<Vec<u8, MAX_COMMAND_SIZE>, PacketError> {
    match command {
        Command::SetAdvertisingParameters {
            interval_min,
            interval_max,
            kind,
        } => write_packet(&LeSetAdvParams::new(
            Duration::from_u16(*interval_min),
            Duration::from_u16(*interval_max),
            AdvKind::try_from(*kind)?,
            AddrKind::PUBLIC,
            AddrKind::PUBLIC,
            BdAddr::default(),
            AdvChannelMap::ALL,
            AdvFilterPolicy::Unfiltered,
        )),
        Command::SetAdvertisingData(data) => {
            let (len, buf) = padded(data);
            write_packet(&LeSetAdvData::new(len, buf))
        }
        Command::SetScanResponseData(data) => {
            let (len, buf) = padded(data);
            write_packet(&LeSetScanResponseData::new(len, buf))
        }
        Command::SetAdvertisingEnable(enable) => write_packet(&LeSetAdvEnable::new(*enable)),
        Command::SetScanParameters {
            active,
            interval,
            window,
        } => write_packet(&LeSetScanParams::new(
            if *active {
                LeScanKind::Active
            } else {
                LeScanKind::Passive
            },
            Duration::from_u16(*interval),
            Duration::from_u16(*window),
            AddrKind::PUBLIC,
            ScanningFilterPolicy::BasicUnfiltered,
        )),
        Command::SetScanEnable {
            enable,
            filter_duplicates,
        } => write_packet(&LeSetScanEnable::new(*enable, *filter_duplicates)),
        Command::Connect {
            address,
            address_type,
        } => write_packet(&LeCreateConn::new(
            Duration::from_u16(SCAN_INTERVAL),
            Duration::from_u16(SCAN_WINDOW),
            false,
            AddrKind::from(*address_type),
            BdAddr::from(*address),
            AddrKind::PUBLIC,
            Duration::from_u16(CONN_INTERVAL_MIN),
            Duration::from_u16(CONN_INTERVAL_MAX),
            0,
            Duration::from_u16(SUPERVISION_TIMEOUT),
            Duration::from_u16(0),
            Duration::from_u16(0),
        )),
        Command::CancelConnect => write_packet(&LeCreateConnCancel::new()),
        Command::Disconnect { handle, reason } => {
            write_packet(&Disconnect::new(ConnHandle::new(*handle), *reason))
        }
        _ => Err(PacketError::Unsupported),
    }
}
