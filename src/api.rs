//! Pybricks BLE API Functions
//!
//! Async helpers for application code. Each one issues a request to the
//! process thread through the non-blocking methods on [`Bluetooth`] and then
//! waits for it to finish. They make progress only while the transport keeps
//! calling [`Bluetooth::propagate`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use pybricks_ble::api::{connect, discover_characteristic, read_characteristic};
//! use pybricks_ble::{CharacteristicRequest, hci::Uuid};
//!
//! connect(&bt, 0, &config).await?;
//!
//! let request = CharacteristicRequest::new(Uuid::Uuid16(0x2A19));
//! let battery = discover_characteristic(&bt, 0, request).await?;
//! let level = read_characteristic(&bt, 0, battery.value_handle).await?;
//! ```

use heapless::Vec;

use crate::constants::MAX_CHAR_SIZE;
use crate::hci::Controller;
use crate::os::Timer;
use crate::{
    Bluetooth, BluetoothError, Characteristic, CharacteristicRequest, ConnectConfig,
    ObserveCallback,
};

/// Power the controller on and wait until it is ready
pub async fn power_on<C: Controller>(bt: &Bluetooth<C>) {
    bt.power_on(true).await;
}

/// Power the controller off and wait until it is
pub async fn power_off<C: Controller>(bt: &Bluetooth<C>) {
    bt.power_on(false).await;
}

/// Wait for the operation on a peripheral slot to finish.
///
/// # Errors
///
/// Returns the error of the finished operation.
pub async fn await_peripheral<C: Controller>(
    bt: &Bluetooth<C>,
    slot: usize,
) -> Result<(), BluetoothError> {
    bt.await_peripheral_command(slot).await
}

/// Scan for a peripheral matching `config` and connect to it.
///
/// # Errors
///
/// Returns an error if the slot is busy, the scan times out or is canceled,
/// or the connection or pairing fails.
pub async fn connect<C: Controller>(
    bt: &Bluetooth<C>,
    slot: usize,
    config: &ConnectConfig,
) -> Result<(), BluetoothError> {
    bt.scan_and_connect(slot, config)?;
    bt.await_peripheral_command(slot).await
}

/// Disconnect a peripheral. Completes at once if it is not connected.
///
/// # Errors
///
/// Returns an error if the slot is unknown or busy.
pub async fn disconnect<C: Controller>(bt: &Bluetooth<C>, slot: usize) -> Result<(), BluetoothError> {
    bt.disconnect(slot)?;
    bt.await_peripheral_command(slot).await
}

/// Find a characteristic on a connected peripheral.
///
/// # Errors
///
/// Returns `NoDevice` if not connected, `Failed` if no characteristic
/// matches, or the error of the underlying GATT query.
pub async fn discover_characteristic<C: Controller>(
    bt: &Bluetooth<C>,
    slot: usize,
    request: CharacteristicRequest,
) -> Result<Characteristic, BluetoothError> {
    bt.discover_characteristic(slot, request)?;
    bt.await_peripheral_command(slot).await?;
    bt.peripheral_characteristic(slot)
        .ok_or(BluetoothError::Failed)
}

/// Read a characteristic value from a connected peripheral.
///
/// # Errors
///
/// Returns `NoDevice` if not connected, or the error of the read.
pub async fn read_characteristic<C: Controller>(
    bt: &Bluetooth<C>,
    slot: usize,
    value_handle: u16,
) -> Result<Vec<u8, MAX_CHAR_SIZE>, BluetoothError> {
    bt.read_characteristic(slot, value_handle)?;
    bt.await_peripheral_command(slot).await?;
    bt.peripheral_read_value(slot).ok_or(BluetoothError::Failed)
}

/// Write a characteristic value on a connected peripheral.
///
/// # Errors
///
/// Returns `InvalidArgument` for oversized data, `NoDevice` if not
/// connected, or the error of the write.
pub async fn write_characteristic<C: Controller>(
    bt: &Bluetooth<C>,
    slot: usize,
    value_handle: u16,
    data: &[u8],
) -> Result<(), BluetoothError> {
    bt.write_characteristic(slot, value_handle, data)?;
    bt.await_peripheral_command(slot).await
}

/// Start or stop connectable advertising.
///
/// # Errors
///
/// Returns `Busy` if another radio request is pending, or the error of the
/// HCI commands.
pub async fn start_advertising<C: Controller>(
    bt: &Bluetooth<C>,
    start: bool,
) -> Result<(), BluetoothError> {
    bt.start_advertising(start)?;
    bt.await_advertise_or_scan_command().await
}

/// Broadcast `data`, or stop broadcasting if it is empty.
///
/// # Errors
///
/// Returns `Busy` if another radio request is pending, `InvalidArgument` if
/// `data` does not fit in one advertisement, or the error of the HCI
/// commands.
pub async fn start_broadcasting<C: Controller>(
    bt: &Bluetooth<C>,
    data: &[u8],
) -> Result<(), BluetoothError> {
    bt.start_broadcasting(data)?;
    bt.await_advertise_or_scan_command().await
}

/// Observe advertisements with `callback`, or stop with `None`.
///
/// # Errors
///
/// Returns `Busy` if another radio request is pending, or the error of the
/// HCI commands.
pub async fn start_observing<C: Controller>(
    bt: &Bluetooth<C>,
    callback: Option<ObserveCallback>,
) -> Result<(), BluetoothError> {
    bt.start_observing(callback)?;
    bt.await_advertise_or_scan_command().await
}

/// Stop everything the user program started, giving up when `timer`
/// expires.
///
/// # Errors
///
/// Returns `TimedOut` if the timer expired first.
pub async fn close_user_tasks<C: Controller>(
    bt: &Bluetooth<C>,
    timer: &Timer,
) -> Result<(), BluetoothError> {
    bt.close_user_tasks(timer).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::{Command, HciEvent, opcode};
    use crate::mock_controller::{
        PERIPHERAL_HANDLE, TestBluetooth, connect_peripheral, new_bluetooth, power_up,
        sent_commands, step, step_peripheral,
    };
    use crate::{AdvertisingState, BluetoothAddress, BluetoothState, ScanResponseMatch};
    use core::future::Future;
    use core::pin::{Pin, pin};
    use core::task::Poll;
    use embassy_futures::poll_once;

    /// Poll `fut` around each pass until it finishes or `passes` run out
    fn drive<T, F: Future, G: Future<Output = T>>(
        bt: &TestBluetooth,
        thread: &mut Pin<&mut F>,
        fut: &mut Pin<&mut G>,
        passes: usize,
    ) -> Poll<T> {
        for _ in 0..passes {
            if let Poll::Ready(out) = poll_once(fut.as_mut()) {
                return Poll::Ready(out);
            }
            step(bt, thread);
        }
        poll_once(fut.as_mut())
    }

    #[test]
    fn test_power_on_and_off() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());

        let mut on = pin!(power_on(&bt));
        assert_eq!(drive(&bt, &mut thread, &mut on, 20), Poll::Ready(()));
        assert_eq!(bt.state(), BluetoothState::On);

        let mut off = pin!(power_off(&bt));
        assert_eq!(drive(&bt, &mut thread, &mut off, 20), Poll::Ready(()));
        assert_eq!(bt.state(), BluetoothState::Off);
    }

    #[test]
    fn test_start_advertising_completes() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);

        let mut adv = pin!(start_advertising(&bt, true));
        assert_eq!(drive(&bt, &mut thread, &mut adv, 20), Poll::Ready(Ok(())));
        assert_eq!(bt.advertising_state(), AdvertisingState::Advertising);

        let opcodes: std::vec::Vec<_> = sent_commands(&bt)
            .iter()
            .filter_map(Command::opcode)
            .collect();
        assert!(opcodes.contains(&opcode::LE_SET_ADVERTISING_ENABLE));

        // LE Set Advertising Enable on the wire.
        bt.with_controller(|c| {
            assert!(c.packets.iter().any(|p| p.as_slice() == [0x0A, 0x20, 0x01, 0x01]));
        });
    }

    #[test]
    fn test_broadcast_rejects_oversized_data() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);

        let data = [0u8; 32];
        let mut broadcast = pin!(start_broadcasting(&bt, &data));
        assert_eq!(
            drive(&bt, &mut thread, &mut broadcast, 1),
            Poll::Ready(Err(BluetoothError::InvalidArgument))
        );
    }

    #[test]
    fn test_disconnect_idle_slot_is_immediate() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);

        let mut fut = pin!(disconnect(&bt, 0));
        assert_eq!(drive(&bt, &mut thread, &mut fut, 0), Poll::Ready(Ok(())));
        assert!(sent_commands(&bt).is_empty());
    }

    #[test]
    fn test_read_without_connection() {
        let bt = new_bluetooth();
        let mut fut = pin!(read_characteristic(&bt, 0, 0x0010));
        assert_eq!(
            poll_once(fut.as_mut()),
            Poll::Ready(Err(BluetoothError::NoDevice))
        );
    }

    #[test]
    fn test_disconnect_after_lost_link_succeeds() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);
        let remote = BluetoothAddress::new([0x90, 0x84, 0x2B, 0x01, 0x02, 0x03]);
        let config = ConnectConfig {
            match_adv: |_| true,
            match_adv_rsp: |_| ScanResponseMatch::Matched,
            notification_handler: None,
            pair: false,
            timeout_ms: 5000,
        };
        assert_eq!(bt.scan_and_connect(0, &config), Ok(()));
        assert_eq!(
            connect_peripheral(&bt, &mut thread, 0, remote),
            Poll::Ready(Ok(()))
        );

        let mut read = pin!(read_characteristic(&bt, 0, 0x0010));
        assert!(drive(&bt, &mut thread, &mut read, 1).is_pending());
        let lost = HciEvent::Disconnected {
            handle: PERIPHERAL_HANDLE,
            reason: 0x08,
        };
        let _ = step_peripheral(&bt, &mut thread, 0, Some(lost));
        assert_eq!(
            poll_once(read.as_mut()),
            Poll::Ready(Err(BluetoothError::NoDevice))
        );

        let mut fut = pin!(disconnect(&bt, 0));
        assert_eq!(poll_once(fut.as_mut()), Poll::Ready(Ok(())));
        assert!(
            !sent_commands(&bt)
                .iter()
                .any(|c| matches!(c, Command::Disconnect { .. }))
        );
    }
}
