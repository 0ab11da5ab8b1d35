//! Advertising, broadcasting and observing
//!
//! The radio runs at most one advertising mode at a time: connectable
//! Pybricks advertising for hosts, or non-connectable broadcasting of user
//! data. Observing (passive scanning) is independent of both.
//!
//! Requests are recorded as a single pending task and executed by the
//! process thread. Only one task can be pending; a second request gets
//! `Busy`. The result is read with
//! [`Bluetooth::await_advertise_or_scan_command`].

use core::future::poll_fn;
use core::task::Poll;

use heapless::Vec;

use crate::constants::{
    ADVERTISING_INTERVAL, BROADCAST_INTERVAL, MAX_ADV_SIZE, SCAN_INTERVAL, SCAN_WINDOW,
};
use crate::hci::{AdvertisingKind, AdvertisingReport, Command, Controller, HciEvent, Role};
use crate::os::request_poll;
use crate::protocol;
use crate::{Bluetooth, BluetoothError};

/// Receives advertisements while observing
pub type ObserveCallback = fn(&AdvertisingReport);

/// Current advertising mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvertisingState {
    /// Not advertising
    #[default]
    None,
    /// Connectable advertising of the Pybricks service
    Advertising,
    /// Non-connectable broadcasting of user data
    Broadcasting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum RadioTask {
    StartAdvertising,
    StopAdvertising,
    StartBroadcasting,
    StartObserving,
    StopObserving,
}

#[derive(Debug)]
pub(crate) struct Radio {
    pub(crate) advertising: AdvertisingState,
    pub(crate) observing: bool,
    callback: Option<ObserveCallback>,
    /// Data being broadcast. Empty when unknown.
    broadcast: Vec<u8, MAX_ADV_SIZE>,
    task: Option<RadioTask>,
    result: Result<(), BluetoothError>,
    pub(crate) restart_observing: bool,
}

impl Radio {
    pub(crate) const fn new() -> Self {
        Self {
            advertising: AdvertisingState::None,
            observing: false,
            callback: None,
            broadcast: Vec::new(),
            task: None,
            result: Ok(()),
            restart_observing: false,
        }
    }

    /// Forget what the controller was doing. Pending requests survive.
    pub(crate) fn reset(&mut self) {
        self.advertising = AdvertisingState::None;
        self.observing = false;
        self.broadcast.clear();
        self.restart_observing = false;
    }

    fn schedule(&mut self, task: RadioTask) {
        self.task = Some(task);
        self.result = Ok(());
        request_poll();
    }
}

impl<C: Controller> Bluetooth<C> {
    /// Start or stop connectable Pybricks advertising. Asking for the state
    /// the radio is already in does nothing, so stopping is always safe even
    /// if a host connection already ended advertising.
    ///
    /// # Errors
    /// `Busy` if another advertising or scan request is pending.
    pub fn start_advertising(&self, start: bool) -> Result<(), BluetoothError> {
        let mut radio = self.radio.borrow_mut();
        let advertising = radio.advertising == AdvertisingState::Advertising;
        if start == advertising {
            return Ok(());
        }
        if radio.task.is_some() {
            return Err(BluetoothError::Busy);
        }
        radio.broadcast.clear();
        radio.schedule(if start {
            RadioTask::StartAdvertising
        } else {
            RadioTask::StopAdvertising
        });
        Ok(())
    }

    /// Broadcast `data` as non-connectable advertising. Empty data stops
    /// broadcasting. Repeating the data already on air does nothing.
    ///
    /// # Errors
    /// * `Busy` if another advertising or scan request is pending
    /// * `InvalidArgument` if `data` does not fit in one advertisement
    pub fn start_broadcasting(&self, data: &[u8]) -> Result<(), BluetoothError> {
        let mut radio = self.radio.borrow_mut();
        if radio.task.is_some() {
            return Err(BluetoothError::Busy);
        }
        if data.len() > MAX_ADV_SIZE {
            return Err(BluetoothError::InvalidArgument);
        }
        let broadcasting = radio.advertising == AdvertisingState::Broadcasting;

        if data.is_empty() {
            if broadcasting {
                radio.schedule(RadioTask::StopAdvertising);
            }
            return Ok(());
        }
        if broadcasting && radio.broadcast.as_slice() == data {
            return Ok(());
        }
        radio.broadcast = Vec::from_slice(data).map_err(|()| BluetoothError::InvalidArgument)?;
        radio.schedule(RadioTask::StartBroadcasting);
        Ok(())
    }

    /// Start observing with `callback`, or stop with `None`. Swapping one
    /// callback for another while observing needs no radio change.
    ///
    /// # Errors
    /// `Busy` if another advertising or scan request is pending.
    pub fn start_observing(&self, callback: Option<ObserveCallback>) -> Result<(), BluetoothError> {
        let mut radio = self.radio.borrow_mut();
        if radio.task.is_some() {
            return Err(BluetoothError::Busy);
        }
        radio.callback = callback;
        let observe = callback.is_some();
        if observe == radio.observing {
            return Ok(());
        }
        radio.schedule(if observe {
            RadioTask::StartObserving
        } else {
            RadioTask::StopObserving
        });
        Ok(())
    }

    /// Ask the process thread to stop and restart observing, e.g. after the
    /// controller dropped scanning on its own.
    pub fn restart_observing_request(&self) {
        self.radio.borrow_mut().restart_observing = true;
        request_poll();
    }

    /// Result of the last advertising or scan request, or `Pending` while
    /// it runs
    pub fn poll_advertise_or_scan_command(&self) -> Poll<Result<(), BluetoothError>> {
        let radio = self.radio.borrow();
        if radio.task.is_some() {
            Poll::Pending
        } else {
            Poll::Ready(radio.result)
        }
    }

    /// Wait for the last advertising or scan request to finish
    ///
    /// # Errors
    /// Returns the error of the finished request.
    pub async fn await_advertise_or_scan_command(&self) -> Result<(), BluetoothError> {
        poll_fn(|_| self.poll_advertise_or_scan_command()).await
    }

    /// Current advertising mode
    #[must_use]
    pub fn advertising_state(&self) -> AdvertisingState {
        self.radio.borrow().advertising
    }

    /// Whether the radio is observing
    #[must_use]
    pub fn is_observing(&self) -> bool {
        self.radio.borrow().observing
    }

    pub(crate) fn handle_radio_event(&self, event: &HciEvent) {
        match event {
            HciEvent::AdvertisingReport(report) => {
                let callback = {
                    let radio = self.radio.borrow();
                    if radio.observing { radio.callback } else { None }
                };
                if let Some(callback) = callback {
                    callback(report);
                }
            }
            HciEvent::Connected {
                status: 0,
                role: Role::Peripheral,
                ..
            } => {
                // The controller stops connectable advertising on connection.
                let mut radio = self.radio.borrow_mut();
                if radio.advertising == AdvertisingState::Advertising {
                    radio.advertising = AdvertisingState::None;
                }
            }
            _ => {}
        }
    }

    /// Run the pending radio task, if any
    pub(crate) async fn service_radio(&self) {
        let Some(task) = self.radio.borrow().task else {
            return;
        };
        debug!("[RADIO] running {:?}", task);

        let result = match task {
            RadioTask::StartAdvertising => self.start_advertising_task().await,
            RadioTask::StopAdvertising => self.stop_advertising_task().await,
            RadioTask::StartBroadcasting => self.start_broadcasting_task().await,
            RadioTask::StartObserving => self.start_observing_task().await,
            RadioTask::StopObserving => self.stop_observing_task().await,
        };
        if let Err(err) = result {
            warn!("[RADIO] {:?} failed: {:?}", task, err);
        }

        let mut radio = self.radio.borrow_mut();
        radio.result = result;
        radio.task = None;
    }

    /// Stop and restart observing if requested, after a peripheral scan
    /// took over the scanner or on external request
    pub(crate) async fn service_observe_restart(&self) {
        if !self.radio.borrow().restart_observing {
            return;
        }
        debug!("[RADIO] restarting observing");
        if let Err(err) = self.stop_observing_task().await {
            warn!("[RADIO] stop observing failed: {:?}", err);
        }
        if self.radio.borrow().callback.is_some() {
            if let Err(err) = self.start_observing_task().await {
                warn!("[RADIO] start observing failed: {:?}", err);
            }
        }
        self.radio.borrow_mut().restart_observing = false;
    }

    async fn start_advertising_task(&self) -> Result<(), BluetoothError> {
        if self.advertising_state() != AdvertisingState::None {
            self.hci_command(Command::SetAdvertisingEnable(false)).await?;
        }
        self.hci_command(Command::SetAdvertisingParameters {
            interval_min: ADVERTISING_INTERVAL,
            interval_max: ADVERTISING_INTERVAL,
            kind: AdvertisingKind::ConnectableUndirected,
        })
        .await?;
        self.hci_command(Command::SetAdvertisingData(protocol::advertising_data()))
            .await?;
        self.hci_command(Command::SetScanResponseData(protocol::scan_response_data(
            &self.hub,
        )))
        .await?;
        self.hci_command(Command::SetAdvertisingEnable(true)).await?;
        self.radio.borrow_mut().advertising = AdvertisingState::Advertising;
        info!("[RADIO] advertising");
        Ok(())
    }

    async fn stop_advertising_task(&self) -> Result<(), BluetoothError> {
        if self.advertising_state() == AdvertisingState::None {
            return Ok(());
        }
        self.hci_command(Command::SetAdvertisingEnable(false)).await?;
        self.radio.borrow_mut().advertising = AdvertisingState::None;
        info!("[RADIO] advertising stopped");
        Ok(())
    }

    async fn start_broadcasting_task(&self) -> Result<(), BluetoothError> {
        let data = self.radio.borrow().broadcast.clone();
        match self.advertising_state() {
            // Already on air, only the payload changes.
            AdvertisingState::Broadcasting => {
                return self.hci_command(Command::SetAdvertisingData(data)).await;
            }
            AdvertisingState::Advertising => {
                self.hci_command(Command::SetAdvertisingEnable(false)).await?;
                self.radio.borrow_mut().advertising = AdvertisingState::None;
            }
            AdvertisingState::None => {}
        }
        self.hci_command(Command::SetAdvertisingParameters {
            interval_min: BROADCAST_INTERVAL,
            interval_max: BROADCAST_INTERVAL,
            kind: AdvertisingKind::NonConnectable,
        })
        .await?;
        self.hci_command(Command::SetAdvertisingData(data)).await?;
        self.hci_command(Command::SetAdvertisingEnable(true)).await?;
        self.radio.borrow_mut().advertising = AdvertisingState::Broadcasting;
        info!("[RADIO] broadcasting");
        Ok(())
    }

    pub(crate) async fn start_observing_task(&self) -> Result<(), BluetoothError> {
        self.hci_command(Command::SetScanParameters {
            active: false,
            interval: SCAN_INTERVAL,
            window: SCAN_WINDOW,
        })
        .await?;
        self.hci_command(Command::SetScanEnable {
            enable: true,
            filter_duplicates: false,
        })
        .await?;
        self.radio.borrow_mut().observing = true;
        Ok(())
    }

    pub(crate) async fn stop_observing_task(&self) -> Result<(), BluetoothError> {
        if !self.is_observing() {
            return Ok(());
        }
        self.hci_command(Command::SetScanEnable {
            enable: false,
            filter_duplicates: false,
        })
        .await?;
        self.radio.borrow_mut().observing = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_controller::{
        advertisement, connect_host, new_bluetooth, power_up, run, sent_commands, step_with,
    };
    use core::cell::Cell;
    use core::pin::pin;

    std::thread_local! {
        static OBSERVED: Cell<usize> = const { Cell::new(0) };
    }

    fn observe(_: &AdvertisingReport) {
        OBSERVED.with(|n| n.set(n.get() + 1));
    }

    fn observe_other(_: &AdvertisingReport) {}

    #[test]
    fn test_start_advertising() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);

        assert_eq!(bt.start_advertising(true), Ok(()));
        assert_eq!(bt.start_advertising(true), Err(BluetoothError::Busy));
        assert!(bt.poll_advertise_or_scan_command().is_pending());
        run(&bt, &mut thread, 10);
        assert_eq!(bt.poll_advertise_or_scan_command(), Poll::Ready(Ok(())));
        assert_eq!(bt.advertising_state(), AdvertisingState::Advertising);

        let commands = sent_commands(&bt);
        assert_eq!(commands.len(), 4);
        assert_eq!(
            commands[0],
            Command::SetAdvertisingParameters {
                interval_min: ADVERTISING_INTERVAL,
                interval_max: ADVERTISING_INTERVAL,
                kind: AdvertisingKind::ConnectableUndirected,
            }
        );
        assert_eq!(commands[1], Command::SetAdvertisingData(protocol::advertising_data()));
        assert_eq!(commands[3], Command::SetAdvertisingEnable(true));
    }

    #[test]
    fn test_host_connection_ends_advertising() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);
        assert_eq!(bt.start_advertising(true), Ok(()));
        run(&bt, &mut thread, 10);

        connect_host(&bt, &mut thread);
        assert_eq!(bt.advertising_state(), AdvertisingState::None);
        // Stopping is a no-op now.
        assert_eq!(bt.start_advertising(false), Ok(()));
        assert!(bt.poll_advertise_or_scan_command().is_ready());
    }

    #[test]
    fn test_second_request_is_busy() {
        let bt = new_bluetooth();
        assert_eq!(bt.start_advertising(true), Ok(()));
        assert_eq!(bt.start_broadcasting(&[1, 2]), Err(BluetoothError::Busy));
        assert_eq!(bt.start_observing(Some(observe)), Err(BluetoothError::Busy));
    }

    #[test]
    fn test_broadcast_data_too_long() {
        let bt = new_bluetooth();
        assert_eq!(
            bt.start_broadcasting(&[0; MAX_ADV_SIZE + 1]),
            Err(BluetoothError::InvalidArgument)
        );
    }

    #[test]
    fn test_broadcast_update_only_sets_data() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);

        assert_eq!(bt.start_broadcasting(&[0x05, 0xFF, 0x97, 0x03, 0x01]), Ok(()));
        run(&bt, &mut thread, 10);
        assert_eq!(bt.advertising_state(), AdvertisingState::Broadcasting);
        assert_eq!(sent_commands(&bt).len(), 3);

        // Same data again: nothing to do.
        assert_eq!(bt.start_broadcasting(&[0x05, 0xFF, 0x97, 0x03, 0x01]), Ok(()));
        assert!(bt.poll_advertise_or_scan_command().is_ready());

        // New data while on air: one data update, no reconfiguration.
        assert_eq!(bt.start_broadcasting(&[0x05, 0xFF, 0x97, 0x03, 0x02]), Ok(()));
        run(&bt, &mut thread, 10);
        let commands = sent_commands(&bt);
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], Command::SetAdvertisingData(_)));
    }

    #[test]
    fn test_stop_broadcasting() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);

        // Not broadcasting: stopping is immediate.
        assert_eq!(bt.start_broadcasting(&[]), Ok(()));
        assert!(bt.poll_advertise_or_scan_command().is_ready());

        assert_eq!(bt.start_broadcasting(&[0x02, 0x01, 0x06]), Ok(()));
        run(&bt, &mut thread, 10);
        let _ = sent_commands(&bt);
        assert_eq!(bt.start_broadcasting(&[]), Ok(()));
        run(&bt, &mut thread, 10);
        assert_eq!(sent_commands(&bt), [Command::SetAdvertisingEnable(false)]);
        assert_eq!(bt.advertising_state(), AdvertisingState::None);
    }

    #[test]
    fn test_observing_round_trip() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);

        assert_eq!(bt.start_observing(None), Ok(()));
        assert_eq!(bt.start_observing(None), Ok(()));
        run(&bt, &mut thread, 5);
        assert!(sent_commands(&bt).is_empty());

        assert_eq!(bt.start_observing(Some(observe)), Ok(()));
        run(&bt, &mut thread, 10);
        assert!(bt.is_observing());
        assert_eq!(sent_commands(&bt).len(), 2);

        // Swapping the callback keeps the radio as is.
        assert_eq!(bt.start_observing(Some(observe_other)), Ok(()));
        assert_eq!(bt.start_observing(Some(observe)), Ok(()));
        run(&bt, &mut thread, 5);
        assert!(sent_commands(&bt).is_empty());

        step_with(&bt, &mut thread, advertisement(crate::BluetoothAddress::new([1; 6])));
        OBSERVED.with(|n| assert_eq!(n.get(), 1));

        assert_eq!(bt.start_observing(None), Ok(()));
        run(&bt, &mut thread, 10);
        assert!(!bt.is_observing());
        assert_eq!(
            sent_commands(&bt),
            [Command::SetScanEnable {
                enable: false,
                filter_duplicates: false,
            }]
        );
    }

    #[test]
    fn test_observing_restarts_after_peripheral_scan() {
        fn any_adv(_: &AdvertisingReport) -> bool {
            false
        }
        fn any_rsp(_: &AdvertisingReport) -> crate::ScanResponseMatch {
            crate::ScanResponseMatch::Matched
        }

        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);
        assert_eq!(bt.start_observing(Some(observe_other)), Ok(()));
        run(&bt, &mut thread, 10);
        let _ = sent_commands(&bt);

        let config = crate::ConnectConfig {
            match_adv: any_adv,
            match_adv_rsp: any_rsp,
            notification_handler: None,
            pair: false,
            timeout_ms: 0,
        };
        assert_eq!(bt.scan_and_connect(0, &config), Ok(()));
        run(&bt, &mut thread, 3);
        assert!(!bt.is_observing());
        bt.cancel_operation_request(0);
        run(&bt, &mut thread, 15);

        assert!(bt.is_observing());
        let commands = sent_commands(&bt);
        assert_eq!(
            commands.last(),
            Some(&Command::SetScanEnable {
                enable: true,
                filter_duplicates: false,
            })
        );
        assert!(commands.contains(&Command::SetScanParameters {
            active: false,
            interval: SCAN_INTERVAL,
            window: SCAN_WINDOW,
        }));
    }
}
