//! Process thread - the scheduler that owns the controller
//!
//! [`Bluetooth::process_thread`] is the only code that talks to the
//! controller. It powers the controller off and on, and while on, services
//! one round of pending work per pass:
//!
//! 1. Host notifications (status, then stdout, then user events)
//! 2. The pending advertising, broadcasting or observing task
//! 3. The pending operation of each peripheral slot
//! 4. An observe restart, if one was requested
//!
//! # Usage
//!
//! The thread is never spawned. The transport pins it and calls
//! [`Bluetooth::propagate`] once for every event it receives, and once with
//! `None` whenever [`POLL_REQUEST`](crate::os::POLL_REQUEST) is set:
//!
//! ```rust,ignore
//! let mut thread = pin!(bt.process_thread());
//! loop {
//!     let event = transport.next_event().await;
//!     let _ = bt.propagate(thread.as_mut(), event, clock.now_ms());
//! }
//! ```
//!
//! Transports that read H4 frames can hand them over undecoded through
//! [`Bluetooth::propagate_h4`].
//!
//! # Architecture
//!
//! * **Bookkeeping**: connection tables and handlers are updated from each
//!   event before the thread sees it, so every wait point observes the same
//!   state
//! * **Current event**: valid only for one `propagate` call; a wait point
//!   that consumes it takes it, so the same event cannot complete two waits
//! * **Re-entrancy**: a nested `propagate` call from inside the controller
//!   is reported as pending instead of polling the thread recursively

use core::future::Future;
use core::pin::Pin;
use core::task::Poll;

use embassy_futures::poll_once;
use embassy_futures::select::{Either, select};

use crate::constants::{
    MAX_PERIPHERALS, POWER_OFF_TIMEOUT_MS, POWER_ON_TIMEOUT_MS, SERVICE_INTERVAL_MS,
    STATUS_UPDATE_INTERVAL_MS,
};
use crate::hci::{Command, Controller, HciEvent, StackState, packet};
use crate::host::HostConnection;
use crate::os::{Timer, request_poll, wait_for, wait_ms, wait_until};
use crate::{Bluetooth, BluetoothError, BluetoothState};

impl<C: Controller> Bluetooth<C> {
    /// The Bluetooth process thread. Never completes.
    pub async fn process_thread(&self) {
        loop {
            self.state.set(BluetoothState::Resetting);
            self.controller_reset().await;
            self.state.set(BluetoothState::Off);
            info!("[PROCESSOR] controller off");

            wait_until(|| self.power_requested.get()).await;

            self.state.set(BluetoothState::Initializing);
            if let Err(err) = self.controller_initialize().await {
                warn!("[PROCESSOR] initialization failed, resetting: {:?}", err);
                continue;
            }
            self.state.set(BluetoothState::On);
            info!("[PROCESSOR] controller on");

            let mut status_timer = Timer::new(self.now(), STATUS_UPDATE_INTERVAL_MS);
            while self.power_requested.get() {
                // Also lets short stdout writes coalesce into one notification.
                wait_ms(|| self.now(), SERVICE_INTERVAL_MS).await;

                self.service_host_notifications(&mut status_timer).await;
                self.service_radio().await;
                for slot in 0..MAX_PERIPHERALS {
                    self.service_peripheral(slot).await;
                }
                self.service_observe_restart().await;
            }
            info!("[PROCESSOR] shutting down");
        }
    }

    /// Run one pass of the process thread.
    ///
    /// `event` is the event just received from the controller, or `None` for
    /// an idle poll. `now_ms` is a free-running millisecond clock.
    ///
    /// Returns `Pending` without polling when called from within another
    /// `propagate` call.
    pub fn propagate<F: Future>(
        &self,
        thread: Pin<&mut F>,
        event: Option<HciEvent>,
        now_ms: u32,
    ) -> Poll<F::Output> {
        self.now.set(now_ms);
        self.pass_latch
            .call(|| {
                if let Some(event) = &event {
                    trace!("[PROCESSOR] event {}", event.name());
                    self.handle_event(event);
                }
                *self.event.borrow_mut() = event;
                let poll = poll_once(thread);
                *self.event.borrow_mut() = None;
                poll
            })
            .unwrap_or(Poll::Pending)
    }

    /// Run one pass for a raw H4 frame received from the controller.
    ///
    /// Frames that do not decode to an [`HciEvent`] are dropped and the pass
    /// runs as an idle poll.
    pub fn propagate_h4<F: Future>(
        &self,
        thread: Pin<&mut F>,
        frame: &[u8],
        now_ms: u32,
    ) -> Poll<F::Output> {
        let event = match packet::decode_h4(frame) {
            Ok(event) => Some(event),
            Err(err) => {
                trace!("[HCI] dropped frame: {}", err);
                None
            }
        };
        self.propagate(thread, event, now_ms)
    }

    fn handle_event(&self, event: &HciEvent) {
        self.handle_host_event(event);
        self.handle_peripheral_event(event);
        self.handle_radio_event(event);
    }

    /// Consume the current event if `f` accepts it
    pub(crate) fn take_event<T>(&self, f: impl FnOnce(&HciEvent) -> Option<T>) -> Option<T> {
        let mut current = self.event.borrow_mut();
        let value = f(current.as_ref()?)?;
        *current = None;
        Some(value)
    }

    /// Hand a command to the controller without waiting
    pub(crate) fn send(&self, command: Command) -> Result<(), BluetoothError> {
        trace!("[HCI] send {}", command.name());
        self.controller.borrow_mut().send(command)
    }

    /// Send an HCI command and wait for its completion or status event
    pub(crate) async fn hci_command(&self, command: Command) -> Result<(), BluetoothError> {
        let opcode = command.opcode();
        self.send(command)?;
        let Some(opcode) = opcode else {
            return Ok(());
        };
        let status = wait_for(|| {
            self.take_event(|event| match event {
                HciEvent::CommandComplete { opcode: op, status }
                | HciEvent::CommandStatus { opcode: op, status }
                    if *op == opcode =>
                {
                    Some(*status)
                }
                _ => None,
            })
        })
        .await;
        BluetoothError::check_hci_status(status)
    }

    async fn controller_reset(&self) {
        if let Err(err) = self.controller.borrow_mut().set_power(false) {
            warn!("[PROCESSOR] power off request failed: {:?}", err);
        }
        let timer = Timer::new(self.now(), POWER_OFF_TIMEOUT_MS);
        wait_until(|| {
            self.controller.borrow().state() == StackState::Off || timer.is_expired(self.now())
        })
        .await;
        if self.controller.borrow().state() != StackState::Off {
            warn!("[PROCESSOR] controller did not power off, forcing reset");
            self.controller.borrow_mut().reset_hard();
        }
        self.reset_connections();
    }

    async fn controller_initialize(&self) -> Result<(), BluetoothError> {
        self.controller.borrow_mut().set_power(true)?;
        let timer = Timer::new(self.now(), POWER_ON_TIMEOUT_MS);
        wait_for(|| match self.controller.borrow().state() {
            StackState::Working => Some(Ok(())),
            _ if timer.is_expired(self.now()) => Some(Err(BluetoothError::TimedOut)),
            _ => None,
        })
        .await
    }

    /// Forget all links. Pending requests stay queued for the next power-up.
    fn reset_connections(&self) {
        for host in self.hosts.borrow_mut().iter_mut() {
            *host = HostConnection::new();
        }
        for peri in self.peripherals.borrow_mut().iter_mut() {
            peri.reset_link();
        }
        self.radio.borrow_mut().reset();
    }

    /// Ask for the controller to be powered on or off. Returns immediately.
    pub fn request_power(&self, on: bool) {
        debug!("[PROCESSOR] power requested: {}", on);
        self.power_requested.set(on);
        request_poll();
    }

    /// Power the controller on or off and wait until it is. Waits for any
    /// change already in progress first. Calling it for the current state
    /// completes right away.
    pub async fn power_on(&self, on: bool) {
        wait_until(|| matches!(self.state(), BluetoothState::Off | BluetoothState::On)).await;
        self.request_power(on);
        let target = if on {
            BluetoothState::On
        } else {
            BluetoothState::Off
        };
        wait_until(|| self.state() == target).await;
    }

    /// Wind down everything the user program started: cancel and finish
    /// peripheral operations, disconnect peripherals, stop observing and
    /// broadcasting.
    ///
    /// # Errors
    /// `TimedOut` if `timer` expires first.
    pub async fn close_user_tasks(&self, timer: &Timer) -> Result<(), BluetoothError> {
        let expired = wait_until(|| timer.is_expired(self.now()));
        match select(expired, self.wind_down_user_tasks()).await {
            Either::First(()) => {
                warn!("[PROCESSOR] closing user tasks timed out");
                Err(BluetoothError::TimedOut)
            }
            Either::Second(()) => Ok(()),
        }
    }

    async fn wind_down_user_tasks(&self) {
        for slot in 0..MAX_PERIPHERALS {
            self.cancel_operation_request(slot);
        }
        // Results of the canceled work are of no interest anymore.
        for slot in 0..MAX_PERIPHERALS {
            let _ = self.await_peripheral_command(slot).await;
        }
        let _ = self.await_advertise_or_scan_command().await;

        for slot in 0..MAX_PERIPHERALS {
            if self.disconnect(slot).is_ok() {
                let _ = self.await_peripheral_command(slot).await;
            }
        }
        if self.start_observing(None).is_ok() {
            let _ = self.await_advertise_or_scan_command().await;
        }
        if self.start_broadcasting(&[]).is_ok() {
            let _ = self.await_advertise_or_scan_command().await;
        }
    }

    /// Power down for good. Graceful if no user task is still running,
    /// otherwise the controller is cut off immediately.
    pub fn deinit(&self) {
        let stuck = self.poll_advertise_or_scan_command().is_pending()
            || (0..MAX_PERIPHERALS).any(|slot| self.poll_peripheral_command(slot).is_pending());
        if stuck {
            warn!("[PROCESSOR] user tasks still running, forcing power off");
            self.controller.borrow_mut().reset_hard();
        } else {
            for slot in 0..MAX_PERIPHERALS {
                self.cancel_operation_request(slot);
            }
        }
        self.request_power(false);
    }
}
