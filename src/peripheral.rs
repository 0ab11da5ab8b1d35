//! Peripheral connections - the hub acting as a GATT client
//!
//! Each peripheral slot runs at most one operation at a time. The
//! application starts an operation with one of the request functions, which
//! only validate and record it, and then polls
//! [`Bluetooth::await_peripheral_command`] until the process thread has run
//! it to completion.
//!
//! # Architecture
//!
//! * Scan and connect: active scan for a matching advertisement, then its
//!   scan response from the same address, then connect and optionally pair
//! * Discover, read and write: one GATT client query each
//! * Disconnect: terminate the link and wait for it to go down
//!
//! Scan and connect can be canceled. Cancellation is requested explicitly
//! with [`Bluetooth::cancel_operation_request`], or implicitly when the
//! application stops polling for the result for longer than the watchdog
//! window.

use core::future::poll_fn;
use core::task::Poll;

use bt_hci::param::DisconnectReason;
use heapless::{String, Vec};

use crate::constants::{
    CCC_ENABLE_NOTIFICATIONS, CONNECT_TIMEOUT_MS, CON_HANDLE_INVALID, MAX_CHAR_SIZE,
    MAX_NAME_SIZE, MAX_PAIRING_ATTEMPTS, PAIRING_TIMEOUT_MS, PERIPHERAL_WATCHDOG_MS,
    SCAN_INTERVAL, SCAN_WINDOW,
};
use crate::hci::{
    AdvertisingReport, CharacteristicProperties, Command, Controller, HciEvent, Role, Uuid,
};
use crate::os::{Timer, request_poll, wait_for};
use crate::{AddressType, Bluetooth, BluetoothAddress, BluetoothError};

/// Decides whether an advertisement is from the wanted peripheral
pub type AdvertisementMatcher = fn(&AdvertisingReport) -> bool;

/// Decides whether a scan response is from the wanted peripheral
pub type ScanResponseMatcher = fn(&AdvertisingReport) -> ScanResponseMatch;

/// Receives notifications from a subscribed peripheral characteristic
pub type NotificationHandler = fn(&[u8]);

/// Outcome of matching a scan response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScanResponseMatch {
    /// This is the peripheral
    Matched,
    /// Not conclusive, keep waiting for another scan response
    Ignored,
    /// Right kind of device but the wrong name, resume scanning
    NameMismatch,
}

/// How to find and connect to a peripheral
#[derive(Debug, Clone, Copy)]
pub struct ConnectConfig {
    /// Advertisement filter
    pub match_adv: AdvertisementMatcher,
    /// Scan response filter
    pub match_adv_rsp: ScanResponseMatcher,
    /// Handler for notifications once subscribed
    pub notification_handler: Option<NotificationHandler>,
    /// Pair (and encrypt) after connecting
    pub pair: bool,
    /// Give up scanning after this many ms. Zero scans until canceled.
    pub timeout_ms: u32,
}

/// Characteristic to look for with [`Bluetooth::discover_characteristic`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharacteristicRequest {
    /// Only characteristics with this UUID
    pub uuid: Option<Uuid>,
    /// First handle to search
    pub start_handle: u16,
    /// Last handle to search
    pub end_handle: u16,
    /// Properties the characteristic must have
    pub properties: CharacteristicProperties,
    /// Enable notifications once found
    pub request_notification: bool,
}

impl CharacteristicRequest {
    /// Request for `uuid` anywhere on the peripheral
    #[must_use]
    pub const fn new(uuid: Uuid) -> Self {
        Self {
            uuid: Some(uuid),
            start_handle: 0x0001,
            end_handle: 0xFFFF,
            properties: CharacteristicProperties(0),
            request_notification: false,
        }
    }
}

/// A discovered characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Characteristic {
    /// Handle of the characteristic value
    pub value_handle: u16,
    /// Last handle belonging to the characteristic
    pub end_handle: u16,
    /// Characteristic properties
    pub properties: CharacteristicProperties,
    /// Characteristic UUID
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum PeripheralOp {
    ScanAndConnect,
    DiscoverCharacteristic,
    ReadCharacteristic,
    WriteCharacteristic,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairingOutcome {
    Paired(u8),
    Reencrypted(u8),
}

/// State of one peripheral slot
#[derive(Debug)]
pub(crate) struct Peripheral {
    pub(crate) address: BluetoothAddress,
    pub(crate) address_type: AddressType,
    pub(crate) name: String<MAX_NAME_SIZE>,
    pub(crate) con_handle: u16,
    pub(crate) op: Option<PeripheralOp>,
    pub(crate) result: Result<(), BluetoothError>,
    pub(crate) cancel: bool,
    watchdog: Timer,
    timeout: Timer,
    config: Option<ConnectConfig>,
    pub(crate) notification_handler: Option<NotificationHandler>,
    char_request: Option<CharacteristicRequest>,
    characteristic: Option<Characteristic>,
    /// Value handle notifications are routed from
    subscribed: Option<u16>,
    value_handle: u16,
    data: Vec<u8, MAX_CHAR_SIZE>,
}

impl Peripheral {
    pub(crate) fn new() -> Self {
        Self {
            address: BluetoothAddress::default(),
            address_type: AddressType::default(),
            name: String::new(),
            con_handle: CON_HANDLE_INVALID,
            op: None,
            result: Ok(()),
            cancel: false,
            watchdog: Timer::default(),
            timeout: Timer::default(),
            config: None,
            notification_handler: None,
            char_request: None,
            characteristic: None,
            subscribed: None,
            value_handle: 0,
            data: Vec::new(),
        }
    }

    pub(crate) const fn is_connected(&self) -> bool {
        self.con_handle != CON_HANDLE_INVALID
    }

    /// Forget the link but keep the finished operation's result
    pub(crate) fn reset_link(&mut self) {
        self.con_handle = CON_HANDLE_INVALID;
        self.subscribed = None;
    }

    fn start(&mut self, op: PeripheralOp, now: u32) {
        self.op = Some(op);
        self.result = Ok(());
        self.cancel = false;
        self.watchdog.set(now, PERIPHERAL_WATCHDOG_MS);
    }

    fn check_idle(&self) -> Result<(), BluetoothError> {
        if self.op.is_some() {
            return Err(BluetoothError::Busy);
        }
        Ok(())
    }

    fn check_connected(&self) -> Result<(), BluetoothError> {
        if !self.is_connected() {
            return Err(BluetoothError::NoDevice);
        }
        self.check_idle()
    }
}

fn truncated_name(name: &str) -> String<MAX_NAME_SIZE> {
    let mut out = String::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

impl<C: Controller> Bluetooth<C> {
    fn with_slot<R>(
        &self,
        slot: usize,
        f: impl FnOnce(&mut Peripheral, u32) -> Result<R, BluetoothError>,
    ) -> Result<R, BluetoothError> {
        let now = self.now();
        let mut peripherals = self.peripherals.borrow_mut();
        let peri = peripherals
            .get_mut(slot)
            .ok_or(BluetoothError::InvalidArgument)?;
        f(peri, now)
    }

    /// Start scanning for a peripheral and connect to it.
    ///
    /// # Errors
    /// * `InvalidArgument` for an unknown slot
    /// * `Busy` if the slot is connected or has an operation in flight
    pub fn scan_and_connect(&self, slot: usize, config: &ConnectConfig) -> Result<(), BluetoothError> {
        self.with_slot(slot, |peri, now| {
            if peri.is_connected() {
                return Err(BluetoothError::Busy);
            }
            peri.check_idle()?;
            *peri = Peripheral::new();
            peri.config = Some(*config);
            peri.notification_handler = config.notification_handler;
            peri.timeout.set(now, config.timeout_ms);
            peri.start(PeripheralOp::ScanAndConnect, now);
            Ok(())
        })?;
        debug!("[PERIPHERAL] slot {}: scan and connect requested", slot);
        request_poll();
        Ok(())
    }

    /// Disconnect the peripheral. Succeeds right away if not connected.
    ///
    /// # Errors
    /// * `InvalidArgument` for an unknown slot
    /// * `Busy` if an operation is in flight
    pub fn disconnect(&self, slot: usize) -> Result<(), BluetoothError> {
        let started = self.with_slot(slot, |peri, now| {
            peri.check_idle()?;
            if !peri.is_connected() {
                peri.result = Ok(());
                return Ok(false);
            }
            peri.notification_handler = None;
            peri.start(PeripheralOp::Disconnect, now);
            Ok(true)
        })?;
        if started {
            request_poll();
        }
        Ok(())
    }

    /// Look for a characteristic on the connected peripheral
    ///
    /// # Errors
    /// * `InvalidArgument` for an unknown slot
    /// * `NoDevice` if not connected
    /// * `Busy` if an operation is in flight
    pub fn discover_characteristic(
        &self,
        slot: usize,
        request: CharacteristicRequest,
    ) -> Result<(), BluetoothError> {
        self.with_slot(slot, |peri, now| {
            peri.check_connected()?;
            peri.char_request = Some(request);
            peri.characteristic = None;
            peri.start(PeripheralOp::DiscoverCharacteristic, now);
            Ok(())
        })?;
        request_poll();
        Ok(())
    }

    /// Read a characteristic value
    ///
    /// # Errors
    /// * `InvalidArgument` for an unknown slot
    /// * `NoDevice` if not connected
    /// * `Busy` if an operation is in flight
    pub fn read_characteristic(&self, slot: usize, value_handle: u16) -> Result<(), BluetoothError> {
        self.with_slot(slot, |peri, now| {
            peri.check_connected()?;
            peri.value_handle = value_handle;
            peri.data.clear();
            peri.start(PeripheralOp::ReadCharacteristic, now);
            Ok(())
        })?;
        request_poll();
        Ok(())
    }

    /// Write a characteristic value (with response)
    ///
    /// # Errors
    /// * `InvalidArgument` for an unknown slot or oversized data
    /// * `NoDevice` if not connected
    /// * `Busy` if an operation is in flight
    pub fn write_characteristic(
        &self,
        slot: usize,
        value_handle: u16,
        data: &[u8],
    ) -> Result<(), BluetoothError> {
        self.with_slot(slot, |peri, now| {
            peri.check_connected()?;
            peri.data = Vec::from_slice(data).map_err(|()| BluetoothError::InvalidArgument)?;
            peri.value_handle = value_handle;
            peri.start(PeripheralOp::WriteCharacteristic, now);
            Ok(())
        })?;
        request_poll();
        Ok(())
    }

    /// Ask the operation in flight to stop. Only scanning, connecting and
    /// pairing honor it.
    pub fn cancel_operation_request(&self, slot: usize) {
        if let Some(peri) = self.peripherals.borrow_mut().get_mut(slot) {
            peri.cancel = true;
        }
    }

    /// Result of the last operation on `slot`, or `Pending` while it runs.
    ///
    /// Every call re-arms the watchdog; an operation nobody polls for gets
    /// canceled.
    pub fn poll_peripheral_command(&self, slot: usize) -> Poll<Result<(), BluetoothError>> {
        let now = self.now();
        let mut peripherals = self.peripherals.borrow_mut();
        let Some(peri) = peripherals.get_mut(slot) else {
            return Poll::Ready(Err(BluetoothError::InvalidArgument));
        };
        peri.watchdog.set(now, PERIPHERAL_WATCHDOG_MS);
        if peri.op.is_some() {
            Poll::Pending
        } else {
            Poll::Ready(peri.result)
        }
    }

    /// Wait for the operation on `slot` to finish
    ///
    /// # Errors
    /// Returns the error of the finished operation.
    pub async fn await_peripheral_command(&self, slot: usize) -> Result<(), BluetoothError> {
        poll_fn(|_| self.poll_peripheral_command(slot)).await
    }

    /// Name from the scan response of the connected peripheral
    #[must_use]
    pub fn peripheral_name(&self, slot: usize) -> Option<String<MAX_NAME_SIZE>> {
        self.peripherals.borrow().get(slot).map(|p| p.name.clone())
    }

    /// Address of the peripheral in `slot`, if connected
    #[must_use]
    pub fn peripheral_address(&self, slot: usize) -> Option<BluetoothAddress> {
        self.peripherals
            .borrow()
            .get(slot)
            .filter(|p| p.is_connected())
            .map(|p| p.address)
    }

    /// Connection handle of the peripheral in `slot`, if connected
    #[must_use]
    pub fn peripheral_con_handle(&self, slot: usize) -> Option<u16> {
        self.peripherals
            .borrow()
            .get(slot)
            .filter(|p| p.is_connected())
            .map(|p| p.con_handle)
    }

    /// Characteristic found by the last discovery
    #[must_use]
    pub fn peripheral_characteristic(&self, slot: usize) -> Option<Characteristic> {
        self.peripherals.borrow().get(slot).and_then(|p| p.characteristic)
    }

    /// Value returned by the last read
    #[must_use]
    pub fn peripheral_read_value(&self, slot: usize) -> Option<Vec<u8, MAX_CHAR_SIZE>> {
        self.peripherals.borrow().get(slot).map(|p| p.data.clone())
    }

    /// Connection bookkeeping for peripheral links. Runs before the process
    /// thread sees the event.
    pub(crate) fn handle_peripheral_event(&self, event: &HciEvent) {
        match event {
            HciEvent::Connected {
                status: 0,
                handle,
                role: Role::Central,
                address,
                ..
            } => {
                let mut peripherals = self.peripherals.borrow_mut();
                let pending = peripherals.iter_mut().find(|p| {
                    p.op == Some(PeripheralOp::ScanAndConnect)
                        && !p.is_connected()
                        && p.address == *address
                });
                if let Some(peri) = pending {
                    peri.con_handle = *handle;
                    info!(
                        "[PERIPHERAL] connected to {}, handle {}",
                        address.format_hex().as_str(),
                        handle
                    );
                }
            }
            HciEvent::Disconnected { handle, reason } => {
                let mut peripherals = self.peripherals.borrow_mut();
                if let Some(peri) = peripherals.iter_mut().find(|p| p.con_handle == *handle) {
                    peri.reset_link();
                    info!("[PERIPHERAL] disconnected, reason {}", reason);
                }
            }
            HciEvent::Notification {
                handle,
                value_handle,
                value,
            } => {
                let handler = self
                    .peripherals
                    .borrow()
                    .iter()
                    .find(|p| p.con_handle == *handle && p.subscribed == Some(*value_handle))
                    .and_then(|p| p.notification_handler);
                if let Some(handler) = handler {
                    handler(value);
                }
            }
            _ => {}
        }
    }

    /// Run the operation pending on `slot`, if any
    pub(crate) async fn service_peripheral(&self, slot: usize) {
        let Some(op) = self.peripherals.borrow()[slot].op else {
            return;
        };
        debug!("[PERIPHERAL] slot {}: running {:?}", slot, op);

        // The scanner is needed for the peripheral, observing resumes after.
        if op == PeripheralOp::ScanAndConnect && self.is_observing() {
            if let Err(err) = self.stop_observing_task().await {
                warn!("[PERIPHERAL] stop observing failed: {:?}", err);
            }
            self.radio.borrow_mut().restart_observing = true;
        }

        let result = match op {
            PeripheralOp::ScanAndConnect => self.peripheral_scan_and_connect(slot).await,
            PeripheralOp::DiscoverCharacteristic => {
                self.peripheral_discover_characteristic(slot).await
            }
            PeripheralOp::ReadCharacteristic => self.peripheral_read_characteristic(slot).await,
            PeripheralOp::WriteCharacteristic => self.peripheral_write_characteristic(slot).await,
            PeripheralOp::Disconnect => self.disconnect_link(slot).await,
        };
        if let Err(err) = result {
            debug!("[PERIPHERAL] slot {}: {:?} failed: {:?}", slot, op, err);
        }

        let mut peripherals = self.peripherals.borrow_mut();
        let peri = &mut peripherals[slot];
        peri.result = result;
        peri.op = None;
        peri.cancel = false;
    }

    /// Cancel flag, raised automatically once the watchdog runs out
    fn peripheral_canceled(&self, slot: usize) -> bool {
        let now = self.now();
        let mut peripherals = self.peripherals.borrow_mut();
        let peri = &mut peripherals[slot];
        if !peri.cancel && peri.watchdog.is_expired(now) {
            debug!("[PERIPHERAL] slot {}: result no longer awaited", slot);
            peri.cancel = true;
        }
        peri.cancel
    }

    /// Why scanning has to stop, if it has to
    fn scan_interrupted(&self, slot: usize) -> Option<BluetoothError> {
        if self.peripheral_canceled(slot) {
            return Some(BluetoothError::Canceled);
        }
        let peripherals = self.peripherals.borrow();
        let peri = &peripherals[slot];
        let timed_out = peri.timeout.duration() > 0 && peri.timeout.is_expired(self.now());
        timed_out.then_some(BluetoothError::TimedOut)
    }

    fn peripheral_link_lost(&self, slot: usize) -> bool {
        !self.peripherals.borrow()[slot].is_connected()
    }

    async fn peripheral_scan_and_connect(&self, slot: usize) -> Result<(), BluetoothError> {
        let config = self.peripherals.borrow()[slot]
            .config
            .ok_or(BluetoothError::InvalidArgument)?;

        self.hci_command(Command::SetScanParameters {
            active: true,
            interval: SCAN_INTERVAL,
            window: SCAN_WINDOW,
        })
        .await?;
        self.hci_command(Command::SetScanEnable {
            enable: true,
            filter_duplicates: false,
        })
        .await?;

        let found = self.scan_for_peripheral(slot, &config).await;

        // Scanning stops whether or not a match was found. A canceled slot
        // goes idle in the same pass, so its stop is not awaited.
        let stop = Command::SetScanEnable {
            enable: false,
            filter_duplicates: false,
        };
        if let Err(BluetoothError::Canceled) = found {
            if let Err(err) = self.send(stop) {
                warn!("[PERIPHERAL] stop scan failed: {:?}", err);
            }
            return Err(BluetoothError::Canceled);
        }
        let stopped = self.hci_command(stop).await;
        let (address, address_type) = found?;
        stopped?;

        self.connect_peripheral(slot, address, address_type).await?;
        if config.pair {
            self.pair_peripheral(slot).await?;
        }
        Ok(())
    }

    async fn scan_for_peripheral(
        &self,
        slot: usize,
        config: &ConnectConfig,
    ) -> Result<(BluetoothAddress, AddressType), BluetoothError> {
        loop {
            let (address, address_type) = wait_for(|| {
                if let Some(err) = self.scan_interrupted(slot) {
                    return Some(Err(err));
                }
                self.take_event(|event| match event {
                    HciEvent::AdvertisingReport(report)
                        if !report.is_scan_response() && (config.match_adv)(report) =>
                    {
                        Some(Ok((report.address, report.address_type)))
                    }
                    _ => None,
                })
            })
            .await?;
            trace!("[PERIPHERAL] slot {}: advertisement matched", slot);

            let name = wait_for(|| {
                if let Some(err) = self.scan_interrupted(slot) {
                    return Some(Err(err));
                }
                self.take_event(|event| match event {
                    HciEvent::AdvertisingReport(report)
                        if report.is_scan_response() && report.address == address =>
                    {
                        match (config.match_adv_rsp)(report) {
                            ScanResponseMatch::Matched => Some(Ok(Some(truncated_name(
                                report.local_name().unwrap_or_default(),
                            )))),
                            ScanResponseMatch::NameMismatch => Some(Ok(None)),
                            ScanResponseMatch::Ignored => None,
                        }
                    }
                    _ => None,
                })
            })
            .await?;

            if let Some(name) = name {
                let mut peripherals = self.peripherals.borrow_mut();
                let peri = &mut peripherals[slot];
                peri.address = address;
                peri.address_type = address_type;
                peri.name = name;
                return Ok((address, address_type));
            }
            // Same kind of device with another name, keep looking.
            debug!("[PERIPHERAL] slot {}: name mismatch, resuming scan", slot);
        }
    }

    async fn connect_peripheral(
        &self,
        slot: usize,
        address: BluetoothAddress,
        address_type: AddressType,
    ) -> Result<(), BluetoothError> {
        self.hci_command(Command::Connect {
            address,
            address_type,
        })
        .await?;

        let timer = Timer::new(self.now(), CONNECT_TIMEOUT_MS);
        let result = wait_for(|| {
            if !self.peripheral_link_lost(slot) {
                return Some(Ok(()));
            }
            let failed = self.take_event(|event| match event {
                HciEvent::Connected {
                    status,
                    role: Role::Central,
                    address: remote,
                    ..
                } if *status != 0 && *remote == address => Some(*status),
                _ => None,
            });
            if let Some(status) = failed {
                return Some(Err(BluetoothError::from_hci_status(status)));
            }
            if self.peripheral_canceled(slot) {
                return Some(Err(BluetoothError::Canceled));
            }
            if timer.is_expired(self.now()) {
                return Some(Err(BluetoothError::TimedOut));
            }
            None
        })
        .await;

        if matches!(
            result,
            Err(BluetoothError::Canceled | BluetoothError::TimedOut)
        ) {
            debug!("[PERIPHERAL] slot {}: canceling connection attempt", slot);
            if let Err(err) = self.hci_command(Command::CancelConnect).await {
                warn!("[PERIPHERAL] cancel connect failed: {:?}", err);
            }
            // The link may have come up while the cancel was in flight.
            if !self.peripheral_link_lost(slot) {
                self.abandon_link(slot).await;
            }
        }
        result
    }

    async fn pair_peripheral(&self, slot: usize) -> Result<(), BluetoothError> {
        let (handle, address, address_type) = {
            let peripherals = self.peripherals.borrow();
            let peri = &peripherals[slot];
            (peri.con_handle, peri.address, peri.address_type)
        };

        for attempt in 1..=MAX_PAIRING_ATTEMPTS {
            // A stale bond makes re-encryption fail, so always pair from scratch.
            let requested = self
                .send(Command::DeleteBond {
                    address,
                    address_type,
                })
                .and_then(|()| self.send(Command::RequestPairing { handle }));
            if let Err(err) = requested {
                self.abandon_link(slot).await;
                return Err(err);
            }

            let timer = Timer::new(self.now(), PAIRING_TIMEOUT_MS);
            let outcome = wait_for(|| {
                if self.peripheral_link_lost(slot) {
                    return Some(Err(BluetoothError::NoDevice));
                }
                let done = self.take_event(|event| match event {
                    HciEvent::PairingComplete { handle: h, status } if *h == handle => {
                        Some(PairingOutcome::Paired(*status))
                    }
                    HciEvent::ReencryptionComplete { handle: h, status } if *h == handle => {
                        Some(PairingOutcome::Reencrypted(*status))
                    }
                    _ => None,
                });
                if let Some(done) = done {
                    return Some(Ok(done));
                }
                if self.peripheral_canceled(slot) {
                    return Some(Err(BluetoothError::Canceled));
                }
                if timer.is_expired(self.now()) {
                    return Some(Err(BluetoothError::TimedOut));
                }
                None
            })
            .await;

            match outcome {
                Ok(PairingOutcome::Paired(0) | PairingOutcome::Reencrypted(0)) => {
                    info!("[PERIPHERAL] slot {}: paired", slot);
                    return Ok(());
                }
                Ok(PairingOutcome::Reencrypted(status)) if attempt < MAX_PAIRING_ATTEMPTS => {
                    warn!("[PERIPHERAL] re-encryption failed ({}), retrying", status);
                }
                Ok(PairingOutcome::Paired(status) | PairingOutcome::Reencrypted(status)) => {
                    let err = BluetoothError::from_hci_status(status);
                    self.abandon_link(slot).await;
                    return Err(err);
                }
                Err(BluetoothError::NoDevice) => return Err(BluetoothError::NoDevice),
                Err(err) => {
                    self.abandon_link(slot).await;
                    return Err(err);
                }
            }
        }
        Err(BluetoothError::Failed)
    }

    /// Disconnect after a failed setup step, keeping the original error
    async fn abandon_link(&self, slot: usize) {
        if let Err(err) = self.disconnect_link(slot).await {
            warn!("[PERIPHERAL] disconnect after failure: {:?}", err);
        }
    }

    async fn peripheral_discover_characteristic(&self, slot: usize) -> Result<(), BluetoothError> {
        let (handle, request) = {
            let peripherals = self.peripherals.borrow();
            let peri = &peripherals[slot];
            (peri.con_handle, peri.char_request)
        };
        let request = request.ok_or(BluetoothError::InvalidArgument)?;

        self.send(Command::DiscoverCharacteristics {
            handle,
            start_handle: request.start_handle,
            end_handle: request.end_handle,
            uuid: request.uuid,
        })?;

        let mut found = None;
        let status = wait_for(|| {
            if self.peripheral_link_lost(slot) {
                return Some(Err(BluetoothError::NoDevice));
            }
            self.take_event(|event| match event {
                HciEvent::CharacteristicDiscovered {
                    handle: h,
                    value_handle,
                    end_handle,
                    properties,
                    uuid,
                } if *h == handle => {
                    if found.is_none() && properties.contains(request.properties) {
                        found = Some(Characteristic {
                            value_handle: *value_handle,
                            end_handle: *end_handle,
                            properties: *properties,
                            uuid: *uuid,
                        });
                    }
                    None
                }
                HciEvent::QueryComplete { handle: h, status } if *h == handle => Some(Ok(*status)),
                _ => None,
            })
        })
        .await?;
        BluetoothError::check_att_status(status)?;

        let characteristic = found.ok_or(BluetoothError::Failed)?;
        self.peripherals.borrow_mut()[slot].characteristic = Some(characteristic);
        debug!(
            "[PERIPHERAL] slot {}: characteristic at {}",
            slot, characteristic.value_handle
        );

        if request.request_notification {
            self.send(Command::WriteClientConfiguration {
                handle,
                value_handle: characteristic.value_handle,
                value: CCC_ENABLE_NOTIFICATIONS,
            })?;
            let status = self.await_query_complete(slot, handle).await?;
            BluetoothError::check_att_status(status)?;
            self.peripherals.borrow_mut()[slot].subscribed = Some(characteristic.value_handle);
        }
        Ok(())
    }

    async fn peripheral_read_characteristic(&self, slot: usize) -> Result<(), BluetoothError> {
        let (handle, value_handle) = {
            let peripherals = self.peripherals.borrow();
            let peri = &peripherals[slot];
            (peri.con_handle, peri.value_handle)
        };
        self.send(Command::ReadCharacteristic {
            handle,
            value_handle,
        })?;

        let mut value = None;
        let status = wait_for(|| {
            if self.peripheral_link_lost(slot) {
                return Some(Err(BluetoothError::NoDevice));
            }
            self.take_event(|event| match event {
                HciEvent::CharacteristicValue {
                    handle: h,
                    value_handle: v,
                    value: data,
                } if *h == handle && *v == value_handle => {
                    value = Some(data.clone());
                    None
                }
                HciEvent::QueryComplete { handle: h, status } if *h == handle => Some(Ok(*status)),
                _ => None,
            })
        })
        .await?;
        BluetoothError::check_att_status(status)?;

        self.peripherals.borrow_mut()[slot].data = value.ok_or(BluetoothError::Failed)?;
        Ok(())
    }

    async fn peripheral_write_characteristic(&self, slot: usize) -> Result<(), BluetoothError> {
        let (handle, value_handle, data) = {
            let peripherals = self.peripherals.borrow();
            let peri = &peripherals[slot];
            (peri.con_handle, peri.value_handle, peri.data.clone())
        };
        self.send(Command::WriteCharacteristic {
            handle,
            value_handle,
            data,
        })?;
        let status = self.await_query_complete(slot, handle).await?;
        BluetoothError::check_att_status(status)
    }

    async fn await_query_complete(&self, slot: usize, handle: u16) -> Result<u8, BluetoothError> {
        wait_for(|| {
            if self.peripheral_link_lost(slot) {
                return Some(Err(BluetoothError::NoDevice));
            }
            self.take_event(|event| match event {
                HciEvent::QueryComplete { handle: h, status } if *h == handle => Some(Ok(*status)),
                _ => None,
            })
        })
        .await
    }

    /// Terminate the link in `slot` and wait for it to go down, at most
    /// `CONNECT_TIMEOUT_MS`
    pub(crate) async fn disconnect_link(&self, slot: usize) -> Result<(), BluetoothError> {
        let handle = self.peripherals.borrow()[slot].con_handle;
        if handle == CON_HANDLE_INVALID {
            return Ok(());
        }
        self.hci_command(Command::Disconnect {
            handle,
            reason: DisconnectReason::RemoteUserTerminatedConn,
        })
        .await?;

        let timer = Timer::new(self.now(), CONNECT_TIMEOUT_MS);
        wait_for(|| {
            if self.peripheral_link_lost(slot) {
                return Some(Ok(()));
            }
            if timer.is_expired(self.now()) {
                warn!("[PERIPHERAL] slot {}: link did not go down", slot);
                return Some(Err(BluetoothError::TimedOut));
            }
            None
        })
        .await
    }
}
