//! Scripted controller and pass-by-pass helpers for tests

use std::collections::VecDeque;
use std::vec::Vec;

use core::future::Future;
use core::pin::Pin;
use core::task::Poll;

use crate::constants::MAX_ADV_SIZE;
use crate::hci::packet::{self, MAX_COMMAND_SIZE};
use crate::hci::{
    AdvertisingKind, AdvertisingReport, Command, Controller, HciEvent, Role, Service, StackState,
};
use crate::protocol::ad_type;
use crate::{AddressType, Bluetooth, BluetoothAddress, BluetoothError, HubInfo};

/// Connection handle given to the test host
pub(crate) const HOST_HANDLE: u16 = 0x0040;

/// Connection handle given to test peripherals
pub(crate) const PERIPHERAL_HANDLE: u16 = 0x0041;

/// Controller that records commands and answers them like a healthy chip
#[derive(Debug, Default)]
pub(crate) struct MockController {
    pub(crate) state: StackState,
    /// Ignore power requests, as a controller that hung would
    pub(crate) stuck: bool,
    pub(crate) power_calls: Vec<bool>,
    pub(crate) hard_resets: usize,
    /// Accept disconnects without ever reporting the link down
    pub(crate) silent_disconnect: bool,
    /// Commands the transport refuses to queue
    pub(crate) refuse: Option<fn(&Command) -> bool>,
    pub(crate) commands: Vec<Command>,
    /// HCI packets of the radio commands, as a UART transport would send them
    pub(crate) packets: Vec<heapless::Vec<u8, MAX_COMMAND_SIZE>>,
    pub(crate) events: VecDeque<HciEvent>,
}

impl MockController {
    pub(crate) fn stuck() -> Self {
        Self {
            stuck: true,
            ..Self::default()
        }
    }
}

impl Controller for MockController {
    fn set_power(&mut self, on: bool) -> Result<(), BluetoothError> {
        self.power_calls.push(on);
        if !self.stuck {
            self.state = if on {
                StackState::Working
            } else {
                StackState::Off
            };
        }
        Ok(())
    }

    fn state(&self) -> StackState {
        self.state
    }

    fn reset_hard(&mut self) {
        self.hard_resets += 1;
        self.state = StackState::Off;
    }

    fn send(&mut self, command: Command) -> Result<(), BluetoothError> {
        if self.refuse.is_some_and(|refuse| refuse(&command)) {
            return Err(BluetoothError::Failed);
        }
        match packet::encode_command(&command) {
            Ok(bytes) => self.packets.push(bytes),
            Err(err) => assert_eq!(command.opcode(), None, "{:?} failed to encode: {}", command, err),
        }
        match &command {
            Command::Connect { .. } => self.events.push_back(HciEvent::CommandStatus {
                opcode: crate::hci::opcode::LE_CREATE_CONNECTION,
                status: 0,
            }),
            Command::Disconnect { handle, .. } => {
                self.events.push_back(HciEvent::CommandStatus {
                    opcode: crate::hci::opcode::DISCONNECT,
                    status: 0,
                });
                if !self.silent_disconnect {
                    self.events.push_back(HciEvent::Disconnected {
                        handle: *handle,
                        reason: 0x16,
                    });
                }
            }
            Command::RequestCanSendNow { handle } => {
                self.events.push_back(HciEvent::CanSendNow { handle: *handle });
            }
            other => {
                if let Some(opcode) = other.opcode() {
                    self.events
                        .push_back(HciEvent::CommandComplete { opcode, status: 0 });
                }
            }
        }
        self.commands.push(command);
        Ok(())
    }
}

pub(crate) type TestBluetooth = Bluetooth<MockController>;

pub(crate) fn new_bluetooth() -> TestBluetooth {
    Bluetooth::new(MockController::default(), HubInfo::default())
}

/// One pass: advance the clock by 1 ms and deliver the next queued
/// controller event, if any
pub(crate) fn step<F: Future>(bt: &TestBluetooth, thread: &mut Pin<&mut F>) {
    let event = bt.with_controller(|c| c.events.pop_front());
    let _ = bt.propagate(thread.as_mut(), event, bt.now().wrapping_add(1));
}

/// One pass delivering `event`. Queued controller events keep waiting.
pub(crate) fn step_with<F: Future>(bt: &TestBluetooth, thread: &mut Pin<&mut F>, event: HciEvent) {
    let _ = bt.propagate(thread.as_mut(), Some(event), bt.now().wrapping_add(1));
}

pub(crate) fn run<F: Future>(bt: &TestBluetooth, thread: &mut Pin<&mut F>, passes: usize) {
    for _ in 0..passes {
        step(bt, thread);
    }
}

/// One pass while awaiting the operation on `slot`, like an application
/// would. `event` replaces the queued event for this pass.
pub(crate) fn step_peripheral<F: Future>(
    bt: &TestBluetooth,
    thread: &mut Pin<&mut F>,
    slot: usize,
    event: Option<HciEvent>,
) -> Poll<Result<(), BluetoothError>> {
    let _ = bt.poll_peripheral_command(slot);
    match event {
        Some(event) => step_with(bt, thread, event),
        None => step(bt, thread),
    }
    bt.poll_peripheral_command(slot)
}

/// Power on and discard the commands sent so far
pub(crate) fn power_up<F: Future>(bt: &TestBluetooth, thread: &mut Pin<&mut F>) {
    bt.request_power(true);
    for _ in 0..10 {
        step(bt, thread);
        if bt.state() == crate::BluetoothState::On {
            break;
        }
    }
    assert_eq!(bt.state(), crate::BluetoothState::On);
    let _ = sent_commands(bt);
}

/// Connect a host that subscribes to Pybricks events, then let the
/// initial status report go out and discard it
pub(crate) fn connect_host<F: Future>(bt: &TestBluetooth, thread: &mut Pin<&mut F>) {
    step_with(
        bt,
        thread,
        HciEvent::Connected {
            status: 0,
            handle: HOST_HANDLE,
            role: Role::Peripheral,
            address: BluetoothAddress::new([0xA0, 0xB1, 0xC2, 0xD3, 0xE4, 0xF5]),
            address_type: AddressType::Random,
        },
    );
    step_with(
        bt,
        thread,
        HciEvent::HostNotificationsConfigured {
            handle: HOST_HANDLE,
            service: Service::Pybricks,
            enabled: true,
        },
    );
    run(bt, thread, 5);
    let _ = sent_commands(bt);
}

/// Drive a requested scan and connect on `slot` until the connection
/// request to `address` is accepted and the link is awaited
pub(crate) fn scan_until_connect<F: Future>(
    bt: &TestBluetooth,
    thread: &mut Pin<&mut F>,
    slot: usize,
    address: BluetoothAddress,
) {
    // Scan parameters and scan enable.
    for _ in 0..4 {
        let _ = step_peripheral(bt, thread, slot, None);
    }
    let _ = step_peripheral(bt, thread, slot, Some(advertisement(address)));
    let _ = step_peripheral(bt, thread, slot, Some(scan_response(address, "Technic Hub")));
    // Scan disable and connection request.
    for _ in 0..4 {
        let _ = step_peripheral(bt, thread, slot, None);
    }
}

/// Drive a requested scan and connect on `slot` to `address` up to the
/// connection event. Returns the operation state after that pass.
pub(crate) fn connect_peripheral<F: Future>(
    bt: &TestBluetooth,
    thread: &mut Pin<&mut F>,
    slot: usize,
    address: BluetoothAddress,
) -> Poll<Result<(), BluetoothError>> {
    scan_until_connect(bt, thread, slot, address);
    let connected = HciEvent::Connected {
        status: 0,
        handle: PERIPHERAL_HANDLE,
        role: Role::Central,
        address,
        address_type: AddressType::Public,
    };
    step_peripheral(bt, thread, slot, Some(connected))
}

/// Take the commands sent since the last call
pub(crate) fn sent_commands(bt: &TestBluetooth) -> Vec<Command> {
    bt.with_controller(|c| core::mem::take(&mut c.commands))
}

/// Take the notification values sent since the last call
pub(crate) fn notifications(bt: &TestBluetooth) -> Vec<heapless::Vec<u8, 20>> {
    sent_commands(bt)
        .into_iter()
        .filter_map(|command| match command {
            Command::Notify { data, .. } => Some(data),
            _ => None,
        })
        .collect()
}

fn report(
    kind: AdvertisingKind,
    address: BluetoothAddress,
    data: &[u8],
) -> HciEvent {
    let mut payload: heapless::Vec<u8, MAX_ADV_SIZE> = heapless::Vec::new();
    let len = data.len().min(MAX_ADV_SIZE);
    let _ = payload.extend_from_slice(&data[..len]);
    HciEvent::AdvertisingReport(AdvertisingReport {
        kind,
        address_type: AddressType::Public,
        address,
        rssi: -60,
        data: payload,
    })
}

/// Connectable advertisement carrying only flags
pub(crate) fn advertisement(address: BluetoothAddress) -> HciEvent {
    report(
        AdvertisingKind::ConnectableUndirected,
        address,
        &[0x02, ad_type::FLAGS, 0x06],
    )
}

/// Scan response carrying a complete local name
pub(crate) fn scan_response(address: BluetoothAddress, name: &str) -> HciEvent {
    let mut data = Vec::new();
    data.push(name.len() as u8 + 1);
    data.push(ad_type::COMPLETE_LOCAL_NAME);
    data.extend_from_slice(name.as_bytes());
    report(AdvertisingKind::ScanResponse, address, &data)
}
