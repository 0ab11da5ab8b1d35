//! `pybricks-ble` Constants
//!
//! Sizes of the fixed connection tables and buffers, scheduler timing, and the
//! numeric values of the Pybricks GATT protocol. Nothing in the crate allocates;
//! every table is sized from the values here.

/// Number of peripheral slots that can be connected at the same time
pub const MAX_PERIPHERALS: usize = 2;

/// Number of hosts (centrals) that can be connected at the same time
pub const MAX_HOSTS: usize = 1;

/// Largest characteristic value that is sent or written, in bytes.
///
/// This is the default ATT MTU (23) minus the 3 byte ATT header.
pub const MAX_CHAR_SIZE: usize = 20;

/// Largest legacy advertising or scan response payload
pub const MAX_ADV_SIZE: usize = 31;

/// Stdout ring buffer size: one chunk in flight plus one being filled
pub const STDOUT_BUFFER_SIZE: usize = MAX_CHAR_SIZE * 2;

/// Longest peripheral or hub name that is stored
pub const MAX_NAME_SIZE: usize = 20;

/// Connection handle value meaning "not connected"
pub const CON_HANDLE_INVALID: u16 = 0xFFFF;

/// Interval at which the status report is resent even if unchanged
pub const STATUS_UPDATE_INTERVAL_MS: u32 = 500;

/// Wait at the top of every enabled pass so short stdout writes are batched
pub const SERVICE_INTERVAL_MS: u32 = 1;

/// Inactivity window after which an unattended peripheral operation cancels itself
pub const PERIPHERAL_WATCHDOG_MS: u32 = 10;

/// Time allowed for the controller to report that it is powered on
pub const POWER_ON_TIMEOUT_MS: u32 = 5_000;

/// Time allowed for the controller to report that it is powered off
pub const POWER_OFF_TIMEOUT_MS: u32 = 1_000;

/// Time allowed for a connection attempt after the scan response matched
pub const CONNECT_TIMEOUT_MS: u32 = 5_000;

/// Time allowed for one pairing attempt
pub const PAIRING_TIMEOUT_MS: u32 = 5_000;

/// Pairing attempts made before giving up on repeated re-encryption failures
pub const MAX_PAIRING_ATTEMPTS: u8 = 2;

/// GATT "client characteristic configuration" value that enables notifications
pub const CCC_ENABLE_NOTIFICATIONS: u16 = 0x0001;

/// Default advertising interval in 0.625 ms units (30 ms)
pub const ADVERTISING_INTERVAL: u16 = 0x0030;

/// Broadcasting interval in 0.625 ms units (100 ms)
pub const BROADCAST_INTERVAL: u16 = 0x00A0;

/// Scan interval and window in 0.625 ms units (both 30 ms, i.e. continuous)
pub const SCAN_INTERVAL: u16 = 0x0030;

/// See [`SCAN_INTERVAL`]
pub const SCAN_WINDOW: u16 = 0x0030;

/// Advertising TX power in dBm included in the advertising data
pub const ADVERTISING_TX_POWER: i8 = 0;

/// Pybricks protocol: event code of a status report
pub const EVENT_STATUS_REPORT: u8 = 0x00;

/// Pybricks protocol: event code of a stdout chunk
pub const EVENT_WRITE_STDOUT: u8 = 0x01;

/// Pybricks protocol: event code of application data
pub const EVENT_WRITE_APP_DATA: u8 = 0x02;

/// Size of a complete status report notification, including the event code
pub const STATUS_REPORT_SIZE: usize = 7;

/// Size of the hub capabilities characteristic value
pub const HUB_CAPABILITIES_SIZE: usize = 11;

/// LEGO company identifier used in the scan response service data
pub const LEGO_COMPANY_ID: u16 = 0x0397;

/// PnP ID characteristic UUID, used as the service data UUID in the scan response
pub const PNP_ID_UUID: u16 = 0x2A50;

/// Vendor ID source value meaning "Bluetooth SIG assigned"
pub const VENDOR_ID_SOURCE_BLUETOOTH_SIG: u8 = 0x01;
