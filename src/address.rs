use bt_hci::param::{AddrKind, BdAddr};

use crate::BluetoothError;

/// A Bluetooth Device Address (`BD_ADDR`), most significant byte first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BluetoothAddress(pub [u8; 6]);

impl BluetoothAddress {
    /// Create a new Bluetooth address from bytes in display order
    #[must_use]
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Get the raw address bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Format the address as a colon-separated hex string
    #[must_use]
    pub fn format_hex(&self) -> heapless::String<17> {
        const HEX: &[u8; 16] = b"0123456789ABCDEF";
        let mut result = heapless::String::new();
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                result.push(':').ok();
            }
            result.push(HEX[usize::from(byte >> 4)] as char).ok();
            result.push(HEX[usize::from(byte & 0x0F)] as char).ok();
        }
        result
    }
}

impl From<[u8; 6]> for BluetoothAddress {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<BluetoothAddress> for [u8; 6] {
    fn from(addr: BluetoothAddress) -> Self {
        addr.0
    }
}

// HCI carries addresses least significant byte first.
impl From<BluetoothAddress> for BdAddr {
    fn from(addr: BluetoothAddress) -> Self {
        let mut wire = addr.0;
        wire.reverse();
        BdAddr::new(wire)
    }
}

impl TryFrom<&[u8]> for BluetoothAddress {
    type Error = BluetoothError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let addr: [u8; 6] = bytes
            .try_into()
            .map_err(|_| BluetoothError::InvalidArgument)?;
        Ok(BluetoothAddress(addr))
    }
}

impl TryFrom<BdAddr> for BluetoothAddress {
    type Error = BluetoothError;

    fn try_from(bd_addr: BdAddr) -> Result<Self, Self::Error> {
        let mut addr = Self::try_from(&bd_addr.raw()[..])?;
        addr.0.reverse();
        Ok(addr)
    }
}

/// LE address type as used in advertising reports and connection requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressType {
    /// Public device address
    #[default]
    Public,
    /// Random device address
    Random,
    /// Public identity address resolved from an RPA
    PublicIdentity,
    /// Random static identity address resolved from an RPA
    RandomIdentity,
}

impl From<AddressType> for AddrKind {
    fn from(address_type: AddressType) -> Self {
        match address_type {
            AddressType::Public => AddrKind::PUBLIC,
            AddressType::Random => AddrKind::RANDOM,
            AddressType::PublicIdentity => AddrKind::RESOLVABLE_PRIVATE_OR_PUBLIC,
            AddressType::RandomIdentity => AddrKind::RESOLVABLE_PRIVATE_OR_RANDOM,
        }
    }
}

impl TryFrom<AddrKind> for AddressType {
    type Error = BluetoothError;

    fn try_from(kind: AddrKind) -> Result<Self, Self::Error> {
        match kind {
            AddrKind::PUBLIC => Ok(Self::Public),
            AddrKind::RANDOM => Ok(Self::Random),
            AddrKind::RESOLVABLE_PRIVATE_OR_PUBLIC => Ok(Self::PublicIdentity),
            AddrKind::RESOLVABLE_PRIVATE_OR_RANDOM => Ok(Self::RandomIdentity),
            _ => Err(BluetoothError::InvalidArgument),
        }
    }
}
