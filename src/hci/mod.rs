//! Transport contract
//!
//! The driver never touches the radio directly. It issues [`Command`]s through
//! a [`Controller`] and is told about everything that happens through
//! [`HciEvent`]s handed to [`Bluetooth::propagate`](crate::Bluetooth::propagate),
//! one event per call. Commands are fire-and-forget; where a command has a
//! completion, the transport reports it as an event (`CommandComplete`,
//! `CommandStatus`, `QueryComplete`, ...).
//!
//! [`packet`] converts between these types and raw HCI bytes for transports
//! that talk H4 to the controller.

pub mod packet;

use bt_hci::cmd::Opcode;
use bt_hci::param::{AdvKind, DisconnectReason, LeAdvEventKind};
use heapless::Vec;

use crate::constants::{MAX_ADV_SIZE, MAX_CHAR_SIZE};
use crate::protocol::AdStructures;
use crate::{AddressType, BluetoothAddress, BluetoothError};

/// HCI command opcodes used by the driver
pub mod opcode {
    use bt_hci::cmd::le::{
        LeCreateConn, LeCreateConnCancel, LeSetAdvData, LeSetAdvEnable, LeSetAdvParams,
        LeSetScanEnable, LeSetScanParams, LeSetScanResponseData,
    };
    use bt_hci::cmd::link_control::Disconnect;
    use bt_hci::cmd::{Cmd, Opcode};

    /// Disconnect
    pub const DISCONNECT: Opcode = Disconnect::OPCODE;
    /// LE Set Advertising Parameters
    pub const LE_SET_ADVERTISING_PARAMETERS: Opcode = LeSetAdvParams::OPCODE;
    /// LE Set Advertising Data
    pub const LE_SET_ADVERTISING_DATA: Opcode = LeSetAdvData::OPCODE;
    /// LE Set Scan Response Data
    pub const LE_SET_SCAN_RESPONSE_DATA: Opcode = LeSetScanResponseData::OPCODE;
    /// LE Set Advertising Enable
    pub const LE_SET_ADVERTISING_ENABLE: Opcode = LeSetAdvEnable::OPCODE;
    /// LE Set Scan Parameters
    pub const LE_SET_SCAN_PARAMETERS: Opcode = LeSetScanParams::OPCODE;
    /// LE Set Scan Enable
    pub const LE_SET_SCAN_ENABLE: Opcode = LeSetScanEnable::OPCODE;
    /// LE Create Connection
    pub const LE_CREATE_CONNECTION: Opcode = LeCreateConn::OPCODE;
    /// LE Create Connection Cancel
    pub const LE_CREATE_CONNECTION_CANCEL: Opcode = LeCreateConnCancel::OPCODE;
}

/// Power state of the controller and the stack running on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackState {
    /// Powered down
    #[default]
    Off,
    /// Power-up sequence in progress
    Initializing,
    /// Ready for commands
    Working,
    /// Power-down sequence in progress
    Halting,
}

/// Local role on an LE link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    /// We initiated the link (to a peripheral)
    Central,
    /// A host connected to us
    Peripheral,
}

/// GATT server service a host can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Service {
    /// Pybricks command/event characteristic
    Pybricks,
    /// Legacy UART-like TX characteristic
    Uart,
}

/// Legacy advertising PDU type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvertisingKind {
    /// Connectable undirected (`ADV_IND`)
    ConnectableUndirected,
    /// Connectable directed (`ADV_DIRECT_IND`)
    ConnectableDirected,
    /// Scannable undirected (`ADV_SCAN_IND`)
    ScannableUndirected,
    /// Non-connectable undirected (`ADV_NONCONN_IND`)
    NonConnectable,
    /// Scan response (`SCAN_RSP`)
    ScanResponse,
}

impl From<LeAdvEventKind> for AdvertisingKind {
    fn from(kind: LeAdvEventKind) -> Self {
        match kind {
            LeAdvEventKind::AdvInd => Self::ConnectableUndirected,
            LeAdvEventKind::AdvDirectInd => Self::ConnectableDirected,
            LeAdvEventKind::AdvScanInd => Self::ScannableUndirected,
            LeAdvEventKind::AdvNonconnInd => Self::NonConnectable,
            LeAdvEventKind::ScanRsp => Self::ScanResponse,
        }
    }
}

impl TryFrom<AdvertisingKind> for AdvKind {
    type Error = BluetoothError;

    fn try_from(kind: AdvertisingKind) -> Result<Self, Self::Error> {
        match kind {
            AdvertisingKind::ConnectableUndirected => Ok(AdvKind::AdvInd),
            AdvertisingKind::ConnectableDirected => Ok(AdvKind::AdvDirectIndHigh),
            AdvertisingKind::ScannableUndirected => Ok(AdvKind::AdvScanInd),
            AdvertisingKind::NonConnectable => Ok(AdvKind::AdvNonconnInd),
            AdvertisingKind::ScanResponse => Err(BluetoothError::InvalidArgument),
        }
    }
}

/// 16-bit or 128-bit attribute UUID. 128-bit values are stored in the order
/// they are written (most significant byte first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Uuid {
    /// SIG assigned 16-bit UUID
    Uuid16(u16),
    /// Vendor 128-bit UUID
    Uuid128([u8; 16]),
}

impl Uuid {
    /// Parse a UUID from its little-endian over-the-air form
    #[must_use]
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            2 => Some(Self::Uuid16(u16::from_le_bytes([bytes[0], bytes[1]]))),
            16 => {
                let mut uuid = [0u8; 16];
                for (dst, src) in uuid.iter_mut().zip(bytes.iter().rev()) {
                    *dst = *src;
                }
                Some(Self::Uuid128(uuid))
            }
            _ => None,
        }
    }
}

/// One advertising report or scan response received while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingReport {
    /// PDU type
    pub kind: AdvertisingKind,
    /// Advertiser address type
    pub address_type: AddressType,
    /// Advertiser address
    pub address: BluetoothAddress,
    /// Signal strength in dBm
    pub rssi: i8,
    /// Advertising data (AD structures)
    pub data: Vec<u8, MAX_ADV_SIZE>,
}

impl AdvertisingReport {
    /// Whether this report is a scan response rather than an advertisement
    #[must_use]
    pub fn is_scan_response(&self) -> bool {
        self.kind == AdvertisingKind::ScanResponse
    }

    /// Iterate over the `(type, value)` AD structures in the payload
    #[must_use]
    pub fn ad_structures(&self) -> AdStructures<'_> {
        AdStructures::new(&self.data)
    }

    /// Complete or shortened local name, if present and valid UTF-8
    #[must_use]
    pub fn local_name(&self) -> Option<&str> {
        crate::protocol::local_name(&self.data)
    }
}

/// Properties of a discovered characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharacteristicProperties(pub u8);

impl CharacteristicProperties {
    /// Read permitted
    pub const READ: Self = Self(0x02);
    /// Write without response permitted
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    /// Write permitted
    pub const WRITE: Self = Self(0x08);
    /// Notifications permitted
    pub const NOTIFY: Self = Self(0x10);
    /// Indications permitted
    pub const INDICATE: Self = Self(0x20);

    /// Whether every property in `other` is also set here
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Structured event delivered by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum HciEvent {
    /// An HCI command finished
    CommandComplete {
        /// Command opcode
        opcode: Opcode,
        /// HCI status, 0 on success
        status: u8,
    },
    /// An asynchronous HCI command was accepted or rejected
    CommandStatus {
        /// Command opcode
        opcode: Opcode,
        /// HCI status, 0 on success
        status: u8,
    },
    /// An LE link was established (or failed to be)
    Connected {
        /// HCI status, 0 on success
        status: u8,
        /// Connection handle
        handle: u16,
        /// Local role
        role: Role,
        /// Remote address
        address: BluetoothAddress,
        /// Remote address type
        address_type: AddressType,
    },
    /// An LE link went down
    Disconnected {
        /// Connection handle
        handle: u16,
        /// HCI reason code
        reason: u8,
    },
    /// Advertising report or scan response
    AdvertisingReport(AdvertisingReport),
    /// A host changed the client configuration of one of our characteristics
    HostNotificationsConfigured {
        /// Connection handle of the host
        handle: u16,
        /// Which characteristic
        service: Service,
        /// Notifications on or off
        enabled: bool,
    },
    /// A host wrote to the Pybricks command characteristic
    HostWrite {
        /// Connection handle of the host
        handle: u16,
        /// Written value
        data: Vec<u8, MAX_CHAR_SIZE>,
    },
    /// A previously requested notification may be sent now
    CanSendNow {
        /// Connection handle of the host
        handle: u16,
    },
    /// Pairing of a new bond finished
    PairingComplete {
        /// Connection handle
        handle: u16,
        /// 0 on success, otherwise the failure reason
        status: u8,
    },
    /// Re-encryption with an existing bond finished
    ReencryptionComplete {
        /// Connection handle
        handle: u16,
        /// 0 on success, otherwise the failure reason
        status: u8,
    },
    /// One characteristic found by a discovery query
    CharacteristicDiscovered {
        /// Connection handle
        handle: u16,
        /// Handle of the characteristic value
        value_handle: u16,
        /// Last handle belonging to the characteristic
        end_handle: u16,
        /// Characteristic properties
        properties: CharacteristicProperties,
        /// Characteristic UUID
        uuid: Uuid,
    },
    /// Value returned by a read query
    CharacteristicValue {
        /// Connection handle
        handle: u16,
        /// Handle of the characteristic value
        value_handle: u16,
        /// Value
        value: Vec<u8, MAX_CHAR_SIZE>,
    },
    /// A GATT client query (discover, read, write) finished
    QueryComplete {
        /// Connection handle
        handle: u16,
        /// ATT status, 0 on success
        status: u8,
    },
    /// Value notification from a peripheral
    Notification {
        /// Connection handle
        handle: u16,
        /// Handle of the characteristic value
        value_handle: u16,
        /// Value
        value: Vec<u8, MAX_CHAR_SIZE>,
    },
}

impl HciEvent {
    /// Short name for logging
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CommandComplete { .. } => "CommandComplete",
            Self::CommandStatus { .. } => "CommandStatus",
            Self::Connected { .. } => "Connected",
            Self::Disconnected { .. } => "Disconnected",
            Self::AdvertisingReport(_) => "AdvertisingReport",
            Self::HostNotificationsConfigured { .. } => "HostNotificationsConfigured",
            Self::HostWrite { .. } => "HostWrite",
            Self::CanSendNow { .. } => "CanSendNow",
            Self::PairingComplete { .. } => "PairingComplete",
            Self::ReencryptionComplete { .. } => "ReencryptionComplete",
            Self::CharacteristicDiscovered { .. } => "CharacteristicDiscovered",
            Self::CharacteristicValue { .. } => "CharacteristicValue",
            Self::QueryComplete { .. } => "QueryComplete",
            Self::Notification { .. } => "Notification",
        }
    }
}

/// Request issued to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// LE Set Advertising Parameters
    SetAdvertisingParameters {
        /// Minimum interval in 0.625 ms units
        interval_min: u16,
        /// Maximum interval in 0.625 ms units
        interval_max: u16,
        /// PDU type
        kind: AdvertisingKind,
    },
    /// LE Set Advertising Data
    SetAdvertisingData(Vec<u8, MAX_ADV_SIZE>),
    /// LE Set Scan Response Data
    SetScanResponseData(Vec<u8, MAX_ADV_SIZE>),
    /// LE Set Advertising Enable
    SetAdvertisingEnable(bool),
    /// LE Set Scan Parameters
    SetScanParameters {
        /// Active scanning requests scan responses
        active: bool,
        /// Scan interval in 0.625 ms units
        interval: u16,
        /// Scan window in 0.625 ms units
        window: u16,
    },
    /// LE Set Scan Enable
    SetScanEnable {
        /// Scanning on or off
        enable: bool,
        /// Let the controller drop duplicate reports
        filter_duplicates: bool,
    },
    /// LE Create Connection
    Connect {
        /// Remote address
        address: BluetoothAddress,
        /// Remote address type
        address_type: AddressType,
    },
    /// LE Create Connection Cancel
    CancelConnect,
    /// Disconnect
    Disconnect {
        /// Connection handle
        handle: u16,
        /// Reason reported to the remote side
        reason: DisconnectReason,
    },
    /// Ask for a `CanSendNow` event for this host
    RequestCanSendNow {
        /// Connection handle of the host
        handle: u16,
    },
    /// Notify a host on the Pybricks event characteristic
    Notify {
        /// Connection handle of the host
        handle: u16,
        /// Notification value
        data: Vec<u8, MAX_CHAR_SIZE>,
    },
    /// Remove a stored bond
    DeleteBond {
        /// Remote address
        address: BluetoothAddress,
        /// Remote address type
        address_type: AddressType,
    },
    /// Start pairing on a link
    RequestPairing {
        /// Connection handle
        handle: u16,
    },
    /// GATT discover characteristics in a handle range
    DiscoverCharacteristics {
        /// Connection handle
        handle: u16,
        /// First handle of the range
        start_handle: u16,
        /// Last handle of the range
        end_handle: u16,
        /// Only report characteristics with this UUID
        uuid: Option<Uuid>,
    },
    /// GATT write of a client characteristic configuration descriptor
    WriteClientConfiguration {
        /// Connection handle
        handle: u16,
        /// Value handle of the characteristic being configured
        value_handle: u16,
        /// Configuration bits
        value: u16,
    },
    /// GATT read characteristic value
    ReadCharacteristic {
        /// Connection handle
        handle: u16,
        /// Value handle
        value_handle: u16,
    },
    /// GATT write characteristic value (with response)
    WriteCharacteristic {
        /// Connection handle
        handle: u16,
        /// Value handle
        value_handle: u16,
        /// Value
        data: Vec<u8, MAX_CHAR_SIZE>,
    },
}

impl Command {
    /// Opcode of the HCI command, for commands that complete with a
    /// `CommandComplete` or `CommandStatus` event
    #[must_use]
    pub fn opcode(&self) -> Option<Opcode> {
        match self {
            Self::SetAdvertisingParameters { .. } => Some(opcode::LE_SET_ADVERTISING_PARAMETERS),
            Self::SetAdvertisingData(_) => Some(opcode::LE_SET_ADVERTISING_DATA),
            Self::SetScanResponseData(_) => Some(opcode::LE_SET_SCAN_RESPONSE_DATA),
            Self::SetAdvertisingEnable(_) => Some(opcode::LE_SET_ADVERTISING_ENABLE),
            Self::SetScanParameters { .. } => Some(opcode::LE_SET_SCAN_PARAMETERS),
            Self::SetScanEnable { .. } => Some(opcode::LE_SET_SCAN_ENABLE),
            Self::Connect { .. } => Some(opcode::LE_CREATE_CONNECTION),
            Self::CancelConnect => Some(opcode::LE_CREATE_CONNECTION_CANCEL),
            Self::Disconnect { .. } => Some(opcode::DISCONNECT),
            _ => None,
        }
    }

    /// Short name for logging
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetAdvertisingParameters { .. } => "SetAdvertisingParameters",
            Self::SetAdvertisingData(_) => "SetAdvertisingData",
            Self::SetScanResponseData(_) => "SetScanResponseData",
            Self::SetAdvertisingEnable(_) => "SetAdvertisingEnable",
            Self::SetScanParameters { .. } => "SetScanParameters",
            Self::SetScanEnable { .. } => "SetScanEnable",
            Self::Connect { .. } => "Connect",
            Self::CancelConnect => "CancelConnect",
            Self::Disconnect { .. } => "Disconnect",
            Self::RequestCanSendNow { .. } => "RequestCanSendNow",
            Self::Notify { .. } => "Notify",
            Self::DeleteBond { .. } => "DeleteBond",
            Self::RequestPairing { .. } => "RequestPairing",
            Self::DiscoverCharacteristics { .. } => "DiscoverCharacteristics",
            Self::WriteClientConfiguration { .. } => "WriteClientConfiguration",
            Self::ReadCharacteristic { .. } => "ReadCharacteristic",
            Self::WriteCharacteristic { .. } => "WriteCharacteristic",
        }
    }
}

/// Binding to a BLE controller and the host stack running on it.
///
/// Every method must return without blocking. Completion of a command is
/// reported later through [`HciEvent`]s.
pub trait Controller {
    /// Start powering the controller up or down. Progress is observed through
    /// [`Controller::state`].
    ///
    /// # Errors
    /// Returns an error if the request could not be started.
    fn set_power(&mut self, on: bool) -> Result<(), BluetoothError>;

    /// Current power state of the stack
    fn state(&self) -> StackState;

    /// Cut power immediately without a shutdown sequence
    fn reset_hard(&mut self);

    /// Queue a command for the controller
    ///
    /// # Errors
    /// Returns an error if the command could not be queued.
    fn send(&mut self, command: Command) -> Result<(), BluetoothError>;
}
