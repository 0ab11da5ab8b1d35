#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

mod fmt;

mod address;
pub mod api;
pub mod constants;
pub mod hci;
mod host;
pub mod os;
mod peripheral;
pub mod processor;
pub mod protocol;
mod radio;

#[cfg(test)]
pub(crate) mod mock_controller;

use core::cell::{Cell, RefCell};

use bt_hci::param::{self as hci_param, Status};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::pipe::Pipe;
use heapless::String;

use crate::constants::{MAX_HOSTS, MAX_NAME_SIZE, MAX_PERIPHERALS, STDOUT_BUFFER_SIZE};
use crate::hci::{Controller, HciEvent};
use crate::host::{HostConnection, Notifications};
use crate::os::Latch;
use crate::peripheral::Peripheral;
use crate::radio::Radio;

pub use address::{AddressType, BluetoothAddress};
pub use peripheral::{
    AdvertisementMatcher, Characteristic, CharacteristicRequest, ConnectConfig,
    NotificationHandler, ScanResponseMatch, ScanResponseMatcher,
};
pub use radio::{AdvertisingState, ObserveCallback};

/// Handler for data written by a host to the Pybricks command characteristic
pub type ReceiveHandler = fn(&[u8]);

/// Bluetooth errors
///
/// Callers are expected to treat `Busy` as "try again", and to tell
/// `NoDevice`, `TimedOut` and `Canceled` apart for user feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BluetoothError {
    /// The resource is in use by another operation
    Busy,
    /// The peripheral or host is not connected, or disconnected mid-operation
    NoDevice,
    /// The operation exceeded its bounded wait
    TimedOut,
    /// The operation was canceled by its owner
    Canceled,
    /// Protocol-level failure with no more specific mapping
    Failed,
    /// Malformed input, rejected before any I/O
    InvalidArgument,
    /// The controller or build lacks the capability
    NotSupported,
    /// The request is not valid in the current state
    InvalidOperation,
}

impl BluetoothError {
    /// Map a non-zero HCI (or pairing) status code to an error
    #[must_use]
    pub fn from_hci_status(status: u8) -> Self {
        match Status::new(status).to_result() {
            Ok(()) => Self::Failed,
            Err(err) => {
                let mapped = Self::from(err);
                warn!("[HCI] status {} mapped to {:?}", status, mapped);
                mapped
            }
        }
    }

    /// `Ok(())` for a zero status, the mapped error otherwise
    ///
    /// # Errors
    /// Returns the mapped error for any non-zero status.
    pub fn check_hci_status(status: u8) -> Result<(), Self> {
        Status::new(status)
            .to_result()
            .map_err(|_| Self::from_hci_status(status))
    }

    /// `Ok(())` for a zero ATT status, `Failed` otherwise
    ///
    /// # Errors
    /// Returns `BluetoothError::Failed` for any non-zero status.
    pub fn check_att_status(status: u8) -> Result<(), Self> {
        if status == 0 {
            return Ok(());
        }
        warn!("[HCI] ATT error {}", status);
        Err(Self::Failed)
    }
}

impl core::fmt::Display for BluetoothError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Busy => write!(f, "Resource busy"),
            Self::NoDevice => write!(f, "Device not connected"),
            Self::TimedOut => write!(f, "Operation timed out"),
            Self::Canceled => write!(f, "Operation canceled"),
            Self::Failed => write!(f, "Operation failed"),
            Self::InvalidArgument => write!(f, "Invalid argument"),
            Self::NotSupported => write!(f, "Not supported"),
            Self::InvalidOperation => write!(f, "Invalid operation in current state"),
        }
    }
}

impl From<hci_param::Error> for BluetoothError {
    fn from(err: hci_param::Error) -> Self {
        match err {
            hci_param::Error::UNKNOWN_CONN_IDENTIFIER
            | hci_param::Error::REMOTE_USER_TERMINATED_CONN
            | hci_param::Error::CONN_TERMINATED_BY_LOCAL_HOST => Self::NoDevice,
            hci_param::Error::CONN_TIMEOUT | hci_param::Error::LMP_LL_RESPONSE_TIMEOUT => Self::TimedOut,
            hci_param::Error::CMD_DISALLOWED => Self::Busy,
            hci_param::Error::UNSUPPORTED | hci_param::Error::UNSUPPORTED_REMOTE_FEATURE => {
                Self::NotSupported
            }
            hci_param::Error::INVALID_HCI_PARAMETERS => Self::InvalidArgument,
            _ => Self::Failed,
        }
    }
}

/// Represents the current state of the Bluetooth process thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BluetoothState {
    /// Powering the controller down
    Resetting,
    /// Powered down, waiting for a power-on request
    Off,
    /// Powering the controller up
    Initializing,
    /// Powered up and servicing tasks
    On,
}

/// Kinds of connection that can be queried with [`Bluetooth::is_connected`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Connection {
    /// Any LE link, in either role
    LowEnergy,
    /// A host subscribed to the Pybricks event characteristic
    Pybricks,
    /// A host subscribed to the legacy UART characteristic
    Uart,
    /// Any connected peripheral
    Peripheral,
}

/// Identity of this hub, used in the scan response and hub capabilities
///
/// # Examples
///
/// ```rust
/// use pybricks_ble::HubInfo;
///
/// let hub = HubInfo {
///     hub_kind: 0x81,
///     max_program_size: 256 * 1024,
///     ..HubInfo::default()
/// };
/// assert_eq!(hub.name.as_str(), "Pybricks Hub");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubInfo {
    /// Advertised name
    pub name: String<MAX_NAME_SIZE>,
    /// LEGO hub kind (product ID)
    pub hub_kind: u8,
    /// Hardware variant
    pub hub_variant: u8,
    /// Pybricks feature flags reported in the hub capabilities
    pub feature_flags: u32,
    /// Largest user program the hub accepts, in bytes
    pub max_program_size: u32,
    /// Number of user program slots
    pub num_slots: u8,
}

impl Default for HubInfo {
    fn default() -> Self {
        let mut name = String::new();
        let _ = name.push_str("Pybricks Hub");
        Self {
            name,
            hub_kind: 0x80,
            hub_variant: 0,
            feature_flags: 0,
            max_program_size: 0,
            num_slots: 1,
        }
    }
}

/// Bluetooth driver state shared by the process thread and the application.
///
/// Everything is owned here: the controller, the host and peripheral
/// connection tables, the notification buffers and the radio mode. The
/// application keeps one instance, pins [`Bluetooth::process_thread`] and
/// drives it with [`Bluetooth::propagate`].
pub struct Bluetooth<C: Controller> {
    pub(crate) controller: RefCell<C>,
    pub(crate) hub: HubInfo,
    pub(crate) now: Cell<u32>,
    /// Event being propagated. Only valid during one `propagate` call.
    pub(crate) event: RefCell<Option<HciEvent>>,
    pub(crate) state: Cell<BluetoothState>,
    pub(crate) power_requested: Cell<bool>,
    pub(crate) pass_latch: Latch,
    pub(crate) hosts: RefCell<[HostConnection; MAX_HOSTS]>,
    pub(crate) notifications: RefCell<Notifications>,
    pub(crate) stdout: Pipe<NoopRawMutex, STDOUT_BUFFER_SIZE>,
    pub(crate) receive_handler: Cell<Option<ReceiveHandler>>,
    pub(crate) peripherals: RefCell<[Peripheral; MAX_PERIPHERALS]>,
    pub(crate) radio: RefCell<Radio>,
}

impl<C: Controller> Bluetooth<C> {
    /// Create a powered-off driver around `controller`
    #[must_use]
    pub fn new(controller: C, hub: HubInfo) -> Self {
        Self {
            controller: RefCell::new(controller),
            hub,
            now: Cell::new(0),
            event: RefCell::new(None),
            state: Cell::new(BluetoothState::Resetting),
            power_requested: Cell::new(false),
            pass_latch: Latch::new(),
            hosts: RefCell::new([HostConnection::new(); MAX_HOSTS]),
            notifications: RefCell::new(Notifications::new()),
            stdout: Pipe::new(),
            receive_handler: Cell::new(None),
            peripherals: RefCell::new(core::array::from_fn(|_| Peripheral::new())),
            radio: RefCell::new(Radio::new()),
        }
    }

    /// Hub identity
    #[must_use]
    pub fn hub(&self) -> &HubInfo {
        &self.hub
    }

    /// Current state of the process thread
    #[must_use]
    pub fn state(&self) -> BluetoothState {
        self.state.get()
    }

    /// Clock value of the most recent pass, in ms
    #[must_use]
    pub fn now(&self) -> u32 {
        self.now.get()
    }

    /// Run `f` with the controller, e.g. to feed it received bytes
    pub fn with_controller<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        f(&mut self.controller.borrow_mut())
    }
}
