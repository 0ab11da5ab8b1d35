//! Pybricks GATT Protocol
//!
//! Wire formats shared with the Pybricks apps: the service and characteristic
//! UUIDs, the status report and hub capabilities values, and the advertising
//! and scan response payloads a hub sends while waiting for a host.
//!
//! Also holds the advertising data (AD structure) parser used when matching
//! peripherals and extracting their names.

use heapless::Vec;

use crate::constants::{
    ADVERTISING_TX_POWER, EVENT_STATUS_REPORT, HUB_CAPABILITIES_SIZE, LEGO_COMPANY_ID,
    MAX_ADV_SIZE, PNP_ID_UUID, STATUS_REPORT_SIZE, VENDOR_ID_SOURCE_BLUETOOTH_SIG,
};
use crate::hci::Uuid;
use crate::{BluetoothError, HubInfo};

/// Pybricks service, `c5f50001-8280-46da-89f4-6d8051e4aeef`
pub const PYBRICKS_SERVICE_UUID: Uuid = Uuid::Uuid128([
    0xC5, 0xF5, 0x00, 0x01, 0x82, 0x80, 0x46, 0xDA, 0x89, 0xF4, 0x6D, 0x80, 0x51, 0xE4, 0xAE, 0xEF,
]);

/// Pybricks command/event characteristic, `c5f50002-8280-46da-89f4-6d8051e4aeef`
pub const PYBRICKS_COMMAND_EVENT_UUID: Uuid = Uuid::Uuid128([
    0xC5, 0xF5, 0x00, 0x02, 0x82, 0x80, 0x46, 0xDA, 0x89, 0xF4, 0x6D, 0x80, 0x51, 0xE4, 0xAE, 0xEF,
]);

/// Pybricks hub capabilities characteristic, `c5f50003-8280-46da-89f4-6d8051e4aeef`
pub const PYBRICKS_HUB_CAPABILITIES_UUID: Uuid = Uuid::Uuid128([
    0xC5, 0xF5, 0x00, 0x03, 0x82, 0x80, 0x46, 0xDA, 0x89, 0xF4, 0x6D, 0x80, 0x51, 0xE4, 0xAE, 0xEF,
]);

/// Advertising data types
pub mod ad_type {
    /// Flags
    pub const FLAGS: u8 = 0x01;
    /// Incomplete list of 16-bit service UUIDs
    pub const INCOMPLETE_16_BIT_UUIDS: u8 = 0x02;
    /// Complete list of 16-bit service UUIDs
    pub const COMPLETE_16_BIT_UUIDS: u8 = 0x03;
    /// Incomplete list of 128-bit service UUIDs
    pub const INCOMPLETE_128_BIT_UUIDS: u8 = 0x06;
    /// Complete list of 128-bit service UUIDs
    pub const COMPLETE_128_BIT_UUIDS: u8 = 0x07;
    /// Shortened local name
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;
    /// Complete local name
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    /// TX power level
    pub const TX_POWER_LEVEL: u8 = 0x0A;
    /// Service data with 16-bit UUID
    pub const SERVICE_DATA_16_BIT: u8 = 0x16;
    /// Manufacturer specific data
    pub const MANUFACTURER_DATA: u8 = 0xFF;
}

/// Flags value: LE general discoverable, BR/EDR not supported
pub const FLAGS_GENERAL_DISCOVERABLE_NO_BREDR: u8 = 0x06;

/// Iterator over the `(type, value)` AD structures of an advertising payload.
///
/// Stops at the first zero-length or truncated structure.
#[derive(Debug, Clone)]
pub struct AdStructures<'a> {
    data: &'a [u8],
}

impl<'a> AdStructures<'a> {
    /// Iterate over `data`
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for AdStructures<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let (&len, rest) = self.data.split_first()?;
        let len = usize::from(len);
        if len == 0 || len > rest.len() {
            self.data = &[];
            return None;
        }
        let (structure, rest) = rest.split_at(len);
        self.data = rest;
        Some((structure[0], &structure[1..]))
    }
}

/// Complete or shortened local name in an advertising payload
#[must_use]
pub fn local_name(data: &[u8]) -> Option<&str> {
    AdStructures::new(data)
        .find(|(kind, _)| {
            *kind == ad_type::COMPLETE_LOCAL_NAME || *kind == ad_type::SHORTENED_LOCAL_NAME
        })
        .and_then(|(_, value)| core::str::from_utf8(value).ok())
}

/// Whether an advertising payload lists `uuid` as a service
#[must_use]
pub fn advertises_service(data: &[u8], uuid: Uuid) -> bool {
    AdStructures::new(data).any(|(kind, value)| match (kind, uuid) {
        (ad_type::INCOMPLETE_128_BIT_UUIDS | ad_type::COMPLETE_128_BIT_UUIDS, Uuid::Uuid128(_)) => {
            value
                .chunks_exact(16)
                .any(|chunk| Uuid::from_le_bytes(chunk) == Some(uuid))
        }
        (ad_type::INCOMPLETE_16_BIT_UUIDS | ad_type::COMPLETE_16_BIT_UUIDS, Uuid::Uuid16(_)) => {
            value
                .chunks_exact(2)
                .any(|chunk| Uuid::from_le_bytes(chunk) == Some(uuid))
        }
        _ => false,
    })
}

fn push_ad(
    buf: &mut Vec<u8, MAX_ADV_SIZE>,
    kind: u8,
    value: &[u8],
) -> Result<(), BluetoothError> {
    let len = u8::try_from(value.len() + 1).map_err(|_| BluetoothError::InvalidArgument)?;
    buf.push(len).map_err(|_| BluetoothError::InvalidArgument)?;
    buf.push(kind).map_err(|_| BluetoothError::InvalidArgument)?;
    buf.extend_from_slice(value)
        .map_err(|()| BluetoothError::InvalidArgument)
}

/// Advertising payload of a hub waiting for a host: flags, the Pybricks
/// service UUID and the TX power level
#[must_use]
pub fn advertising_data() -> Vec<u8, MAX_ADV_SIZE> {
    let mut uuid = [0u8; 16];
    if let Uuid::Uuid128(be) = PYBRICKS_SERVICE_UUID {
        for (dst, src) in uuid.iter_mut().zip(be.iter().rev()) {
            *dst = *src;
        }
    }

    let mut buf = Vec::new();
    // 3 + 18 + 3 bytes always fit in 31.
    let _ = push_ad(&mut buf, ad_type::FLAGS, &[FLAGS_GENERAL_DISCOVERABLE_NO_BREDR]);
    let _ = push_ad(&mut buf, ad_type::INCOMPLETE_128_BIT_UUIDS, &uuid);
    let _ = push_ad(&mut buf, ad_type::TX_POWER_LEVEL, &[ADVERTISING_TX_POWER as u8]);
    buf
}

/// Scan response payload: LEGO PnP ID service data followed by the complete
/// local name, truncated to fit
#[must_use]
pub fn scan_response_data(hub: &HubInfo) -> Vec<u8, MAX_ADV_SIZE> {
    let mut service_data = [0u8; 9];
    service_data[0..2].copy_from_slice(&PNP_ID_UUID.to_le_bytes());
    service_data[2] = VENDOR_ID_SOURCE_BLUETOOTH_SIG;
    service_data[3..5].copy_from_slice(&LEGO_COMPANY_ID.to_le_bytes());
    service_data[5..7].copy_from_slice(&u16::from(hub.hub_kind).to_le_bytes());
    service_data[7..9].copy_from_slice(&u16::from(hub.hub_variant).to_le_bytes());

    let mut buf = Vec::new();
    let _ = push_ad(&mut buf, ad_type::SERVICE_DATA_16_BIT, &service_data);

    let room = MAX_ADV_SIZE - buf.len() - 2;
    let mut name = hub.name.as_bytes();
    if name.len() > room {
        // Cut on a character boundary.
        let mut end = room;
        while !hub.name.is_char_boundary(end) {
            end -= 1;
        }
        name = &name[..end];
    }
    let _ = push_ad(&mut buf, ad_type::COMPLETE_LOCAL_NAME, name);
    buf
}

/// Status report notification value
#[must_use]
pub fn status_report(flags: u32, program_id: u8, slot: u8) -> [u8; STATUS_REPORT_SIZE] {
    let mut report = [0u8; STATUS_REPORT_SIZE];
    report[0] = EVENT_STATUS_REPORT;
    report[1..5].copy_from_slice(&flags.to_le_bytes());
    report[5] = program_id;
    report[6] = slot;
    report
}

/// Hub capabilities characteristic value for a negotiated ATT MTU
#[must_use]
pub fn hub_capabilities(
    mtu: u16,
    feature_flags: u32,
    max_program_size: u32,
    num_slots: u8,
) -> [u8; HUB_CAPABILITIES_SIZE] {
    let mut value = [0u8; HUB_CAPABILITIES_SIZE];
    value[0..2].copy_from_slice(&mtu.saturating_sub(3).to_le_bytes());
    value[2..6].copy_from_slice(&feature_flags.to_le_bytes());
    value[6..10].copy_from_slice(&max_program_size.to_le_bytes());
    value[10] = num_slots;
    value
}
