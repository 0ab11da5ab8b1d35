//! Host connection - the hub acting as a GATT server for a connected computer
//!
//! A host (Pybricks Code, pybricksdev, ...) connects to the hub and
//! subscribes to the Pybricks event characteristic. Three kinds of outgoing
//! notification share that characteristic, and one is sent per scheduler
//! pass, in this order:
//!
//! 1. Status report, whenever it changed or the periodic timer ran out
//! 2. Buffered stdout, in chunks of at most one characteristic minus the
//!    event byte
//! 3. One pending user event
//!
//! Every notification goes through the same two-step flow: ask the
//! transport for a `CanSendNow` event for each subscribed host, then send
//! the value when it arrives.
//!
//! # Usage
//!
//! ```rust,ignore
//! bt.schedule_status_update(&status_report(flags, program_id, slot));
//! let written = bt.tx(b"hello\n")?;
//! bt.send_event_notification(EVENT_WRITE_APP_DATA, &payload).await?;
//! ```

use heapless::Vec;

use crate::constants::{
    CON_HANDLE_INVALID, EVENT_WRITE_STDOUT, HUB_CAPABILITIES_SIZE, MAX_CHAR_SIZE, MAX_HOSTS,
    STATUS_REPORT_SIZE, STATUS_UPDATE_INTERVAL_MS,
};
use crate::hci::{Command, Controller, HciEvent, Role, Service};
use crate::os::{Timer, request_poll, wait_until};
use crate::protocol;
use crate::{Bluetooth, BluetoothError, Connection, ReceiveHandler};

/// State of one host connection slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HostConnection {
    pub(crate) con_handle: u16,
    pub(crate) pybricks_configured: bool,
    pub(crate) uart_configured: bool,
    /// Cleared while a notification to this host is outstanding
    pub(crate) send_done: bool,
}

impl HostConnection {
    pub(crate) const fn new() -> Self {
        Self {
            con_handle: CON_HANDLE_INVALID,
            pybricks_configured: false,
            uart_configured: false,
            send_done: true,
        }
    }

    pub(crate) const fn is_connected(&self) -> bool {
        self.con_handle != CON_HANDLE_INVALID
    }

    /// Connected and subscribed to Pybricks events
    pub(crate) const fn is_subscribed(&self) -> bool {
        self.is_connected() && self.pybricks_configured
    }
}

/// Outgoing notification buffers other than stdout
#[derive(Debug)]
pub(crate) struct Notifications {
    status: [u8; STATUS_REPORT_SIZE],
    status_pending: bool,
    stdout_busy: bool,
    user_event: Option<Vec<u8, MAX_CHAR_SIZE>>,
}

impl Notifications {
    pub(crate) const fn new() -> Self {
        Self {
            status: [0; STATUS_REPORT_SIZE],
            status_pending: false,
            stdout_busy: false,
            user_event: None,
        }
    }
}

impl<C: Controller> Bluetooth<C> {
    /// Whether a connection of the given kind currently exists
    #[must_use]
    pub fn is_connected(&self, connection: Connection) -> bool {
        let hosts = self.hosts.borrow();
        match connection {
            Connection::LowEnergy => {
                hosts.iter().any(HostConnection::is_connected)
                    || self.peripherals.borrow().iter().any(|p| p.is_connected())
            }
            Connection::Pybricks => hosts.iter().any(HostConnection::is_subscribed),
            Connection::Uart => hosts
                .iter()
                .any(|h| h.is_connected() && h.uart_configured),
            Connection::Peripheral => self.peripherals.borrow().iter().any(|p| p.is_connected()),
        }
    }

    /// Register the handler for data written by a host. `None` discards it.
    pub fn set_receive_handler(&self, handler: Option<ReceiveHandler>) {
        self.receive_handler.set(handler);
    }

    /// Hub capabilities characteristic value for a host with the given MTU
    #[must_use]
    pub fn hub_capabilities(&self, mtu: u16) -> [u8; HUB_CAPABILITIES_SIZE] {
        protocol::hub_capabilities(
            mtu,
            self.hub.feature_flags,
            self.hub.max_program_size,
            self.hub.num_slots,
        )
    }

    /// Schedule a status report notification.
    ///
    /// Identical consecutive reports are sent once. The periodic timer sends
    /// the latest report again anyway.
    pub fn schedule_status_update(&self, status: &[u8; STATUS_REPORT_SIZE]) {
        let mut notifications = self.notifications.borrow_mut();
        if notifications.status == *status {
            return;
        }
        notifications.status = *status;
        notifications.status_pending = true;
        drop(notifications);
        request_poll();
    }

    /// Queue stdout data for the host. Returns how many bytes were accepted,
    /// which may be fewer than `data.len()`.
    ///
    /// # Errors
    /// * `InvalidOperation` if no host is subscribed to Pybricks events
    /// * `Busy` if the buffer is full
    pub fn tx(&self, data: &[u8]) -> Result<usize, BluetoothError> {
        if !self.is_connected(Connection::Pybricks) {
            return Err(BluetoothError::InvalidOperation);
        }
        // The ring buffer hands out contiguous space, so a write may wrap.
        let mut written = 0;
        while written < data.len() {
            match self.stdout.try_write(&data[written..]) {
                Ok(n) => written += n,
                Err(_) => break,
            }
        }
        if written == 0 && !data.is_empty() {
            return Err(BluetoothError::Busy);
        }
        request_poll();
        Ok(written)
    }

    /// Free space in the stdout buffer. Unbounded while no host is listening,
    /// so that writers never block on a missing host.
    #[must_use]
    pub fn tx_available(&self) -> usize {
        if !self.is_connected(Connection::Pybricks) {
            return usize::MAX;
        }
        self.stdout.free_capacity()
    }

    /// Whether all queued stdout data has been sent
    #[must_use]
    pub fn tx_is_idle(&self) -> bool {
        if !self.is_connected(Connection::Pybricks) {
            return true;
        }
        !self.notifications.borrow().stdout_busy && self.stdout.is_empty()
    }

    /// Send one Pybricks event notification and wait until it went out.
    ///
    /// # Errors
    /// * `InvalidArgument` if the event does not fit in one notification
    /// * `Busy` if another user event is still pending
    pub async fn send_event_notification(
        &self,
        event_type: u8,
        data: &[u8],
    ) -> Result<(), BluetoothError> {
        if data.len() + 1 > MAX_CHAR_SIZE {
            return Err(BluetoothError::InvalidArgument);
        }
        {
            let mut notifications = self.notifications.borrow_mut();
            if notifications.user_event.is_some() {
                return Err(BluetoothError::Busy);
            }
            let mut value = Vec::new();
            // Capacity was checked above.
            let _ = value.push(event_type);
            let _ = value.extend_from_slice(data);
            notifications.user_event = Some(value);
        }
        request_poll();
        wait_until(|| self.notifications.borrow().user_event.is_none()).await;
        Ok(())
    }

    /// Connection bookkeeping for host links. Runs before the process thread
    /// sees the event.
    pub(crate) fn handle_host_event(&self, event: &HciEvent) {
        match event {
            HciEvent::Connected {
                status: 0,
                handle,
                role: Role::Peripheral,
                ..
            } => {
                let mut hosts = self.hosts.borrow_mut();
                if let Some(host) = hosts.iter_mut().find(|h| !h.is_connected()) {
                    *host = HostConnection::new();
                    host.con_handle = *handle;
                    info!("[HOST] connected, handle {}", handle);
                } else {
                    warn!("[HOST] no free slot for handle {}", handle);
                }
            }
            HciEvent::Disconnected { handle, reason } => {
                let mut hosts = self.hosts.borrow_mut();
                if let Some(host) = hosts.iter_mut().find(|h| h.con_handle == *handle) {
                    *host = HostConnection::new();
                    info!("[HOST] disconnected, reason {}", reason);
                }
            }
            HciEvent::HostNotificationsConfigured {
                handle,
                service,
                enabled,
            } => {
                let mut hosts = self.hosts.borrow_mut();
                if let Some(host) = hosts.iter_mut().find(|h| h.con_handle == *handle) {
                    match service {
                        Service::Pybricks => host.pybricks_configured = *enabled,
                        Service::Uart => host.uart_configured = *enabled,
                    }
                    debug!("[HOST] notifications {}", enabled);
                    if *service == Service::Pybricks && *enabled {
                        // New subscribers get the current status right away.
                        self.notifications.borrow_mut().status_pending = true;
                    }
                }
            }
            HciEvent::HostWrite { handle, data } => {
                let known = self.hosts.borrow().iter().any(|h| h.con_handle == *handle);
                if let (true, Some(handler)) = (known, self.receive_handler.get()) {
                    handler(data);
                }
            }
            _ => {}
        }
    }

    /// Send at most one pending host notification. Called once per pass of
    /// the process thread.
    pub(crate) async fn service_host_notifications(&self, status_timer: &mut Timer) {
        if !self.is_connected(Connection::Pybricks) {
            return;
        }

        let now = self.now();
        let status = {
            let mut notifications = self.notifications.borrow_mut();
            if notifications.status_pending || status_timer.is_expired(now) {
                notifications.status_pending = false;
                Some(notifications.status)
            } else {
                None
            }
        };
        if let Some(status) = status {
            self.send_value_notification(&status).await;
            status_timer.set(self.now(), STATUS_UPDATE_INTERVAL_MS);
            return;
        }

        if !self.stdout.is_empty() {
            let mut value: Vec<u8, MAX_CHAR_SIZE> = Vec::new();
            let _ = value.push(EVENT_WRITE_STDOUT);
            let mut chunk = [0u8; MAX_CHAR_SIZE - 1];
            let mut len = 0;
            while len < chunk.len() {
                match self.stdout.try_read(&mut chunk[len..]) {
                    Ok(n) => len += n,
                    Err(_) => break,
                }
            }
            let _ = value.extend_from_slice(&chunk[..len]);
            self.notifications.borrow_mut().stdout_busy = true;
            self.send_value_notification(&value).await;
            self.notifications.borrow_mut().stdout_busy = false;
            return;
        }

        let user_event = self.notifications.borrow().user_event.clone();
        if let Some(value) = user_event {
            self.send_value_notification(&value).await;
            self.notifications.borrow_mut().user_event = None;
        }
    }

    /// Notify every subscribed host, waiting for each one's turn
    async fn send_value_notification(&self, data: &[u8]) {
        let Ok(data) = Vec::<u8, MAX_CHAR_SIZE>::from_slice(data) else {
            error!("[HOST] notification too long: {}", data.len());
            return;
        };

        let handles: Vec<u16, MAX_HOSTS> = {
            let mut hosts = self.hosts.borrow_mut();
            let mut handles = Vec::new();
            for host in hosts.iter_mut() {
                host.send_done = !host.is_subscribed();
                if !host.send_done {
                    let _ = handles.push(host.con_handle);
                }
            }
            handles
        };
        for handle in handles {
            if let Err(err) = self.send(Command::RequestCanSendNow { handle }) {
                warn!("[HOST] can-send-now request failed: {:?}", err);
                self.mark_sent(handle);
            }
        }

        wait_until(|| {
            let ready = self.take_event(|event| match event {
                HciEvent::CanSendNow { handle } => Some(*handle),
                _ => None,
            });
            if let Some(handle) = ready {
                let pending = self
                    .hosts
                    .borrow()
                    .iter()
                    .any(|h| h.con_handle == handle && !h.send_done);
                if pending {
                    let command = Command::Notify {
                        handle,
                        data: data.clone(),
                    };
                    if let Err(err) = self.send(command) {
                        warn!("[HOST] notify failed: {:?}", err);
                    }
                    self.mark_sent(handle);
                    request_poll();
                }
            }
            // A host that disconnected or unsubscribed is no longer waited on.
            self.hosts
                .borrow()
                .iter()
                .all(|h| h.send_done || !h.is_subscribed())
        })
        .await;
    }

    fn mark_sent(&self, handle: u16) {
        let mut hosts = self.hosts.borrow_mut();
        if let Some(host) = hosts.iter_mut().find(|h| h.con_handle == handle) {
            host.send_done = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{EVENT_STATUS_REPORT, EVENT_WRITE_APP_DATA, STDOUT_BUFFER_SIZE};
    use crate::mock_controller::{
        HOST_HANDLE, connect_host, new_bluetooth, notifications, power_up, run, step,
    };
    use core::cell::RefCell;
    use core::pin::pin;
    use embassy_futures::poll_once;

    #[test]
    fn test_tx_without_host() {
        let bt = new_bluetooth();
        assert_eq!(bt.tx(b"hi"), Err(BluetoothError::InvalidOperation));
        assert_eq!(bt.tx_available(), usize::MAX);
        assert!(bt.tx_is_idle());
    }

    #[test]
    fn test_status_update_sent_once() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);
        connect_host(&bt, &mut thread);

        let report = protocol::status_report(0x01, 0x20, 0);
        bt.schedule_status_update(&report);
        bt.schedule_status_update(&report);
        run(&bt, &mut thread, 20);

        let sent = notifications(&bt);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], EVENT_STATUS_REPORT);
        assert_eq!(sent[0].as_slice(), &report);
    }

    #[test]
    fn test_stdout_chunks_are_limited() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);
        connect_host(&bt, &mut thread);

        let data = [b'x'; 30];
        assert_eq!(bt.tx(&data), Ok(30));
        assert_eq!(bt.tx_available(), STDOUT_BUFFER_SIZE - 30);
        assert!(!bt.tx_is_idle());
        run(&bt, &mut thread, 20);

        let sent = notifications(&bt);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].len(), MAX_CHAR_SIZE);
        assert_eq!(sent[0][0], EVENT_WRITE_STDOUT);
        assert_eq!(sent[1].len(), 1 + 30 - (MAX_CHAR_SIZE - 1));
        assert!(bt.tx_is_idle());
    }

    #[test]
    fn test_tx_partial_and_full() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);
        connect_host(&bt, &mut thread);

        let data = [b'y'; STDOUT_BUFFER_SIZE + 5];
        assert_eq!(bt.tx(&data), Ok(STDOUT_BUFFER_SIZE));
        assert_eq!(bt.tx(&data), Err(BluetoothError::Busy));
        assert_eq!(bt.tx_available(), 0);
    }

    #[test]
    fn test_notification_priority() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);
        connect_host(&bt, &mut thread);

        let mut event = pin!(bt.send_event_notification(EVENT_WRITE_APP_DATA, &[1, 2, 3]));
        assert!(poll_once(event.as_mut()).is_pending());
        assert_eq!(bt.tx(b"out"), Ok(3));
        bt.schedule_status_update(&protocol::status_report(0x04, 0, 0));
        run(&bt, &mut thread, 30);

        let sent = notifications(&bt);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0][0], EVENT_STATUS_REPORT);
        assert_eq!(sent[1].as_slice(), &[EVENT_WRITE_STDOUT, b'o', b'u', b't']);
        assert_eq!(sent[2].as_slice(), &[EVENT_WRITE_APP_DATA, 1, 2, 3]);
        assert_eq!(poll_once(event.as_mut()), core::task::Poll::Ready(Ok(())));
    }

    #[test]
    fn test_status_pass_sends_nothing_else() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);
        connect_host(&bt, &mut thread);

        assert_eq!(bt.tx(b"out"), Ok(3));
        bt.schedule_status_update(&protocol::status_report(0x04, 0, 0));
        let mut passes = std::vec::Vec::new();
        for _ in 0..30 {
            step(&bt, &mut thread);
            passes.push(notifications(&bt));
        }

        let status_pass = passes
            .iter()
            .position(|sent| sent.iter().any(|n| n[0] == EVENT_STATUS_REPORT))
            .unwrap();
        let stdout_pass = passes
            .iter()
            .position(|sent| sent.iter().any(|n| n[0] == EVENT_WRITE_STDOUT))
            .unwrap();
        assert_eq!(passes[status_pass].len(), 1);
        assert!(stdout_pass > status_pass);
    }

    #[test]
    fn test_event_notification_checks() {
        let bt = new_bluetooth();
        let mut first = pin!(bt.send_event_notification(EVENT_WRITE_APP_DATA, &[0]));
        assert!(poll_once(first.as_mut()).is_pending());

        let mut second = pin!(bt.send_event_notification(EVENT_WRITE_APP_DATA, &[0]));
        assert_eq!(
            poll_once(second.as_mut()),
            core::task::Poll::Ready(Err(BluetoothError::Busy))
        );

        let mut too_big = pin!(bt.send_event_notification(EVENT_WRITE_APP_DATA, &[0; MAX_CHAR_SIZE]));
        assert_eq!(
            poll_once(too_big.as_mut()),
            core::task::Poll::Ready(Err(BluetoothError::InvalidArgument))
        );
    }

    #[test]
    fn test_periodic_status_resend() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);
        connect_host(&bt, &mut thread);

        run(&bt, &mut thread, 10);
        assert!(notifications(&bt).is_empty());
        run(&bt, &mut thread, STATUS_UPDATE_INTERVAL_MS as usize + 10);
        assert_eq!(notifications(&bt).len(), 1);
    }

    #[test]
    fn test_host_write_reaches_handler() {
        std::thread_local! {
            static RECEIVED: RefCell<std::vec::Vec<u8>> = const { RefCell::new(std::vec::Vec::new()) };
        }
        fn handler(data: &[u8]) {
            RECEIVED.with(|r| r.borrow_mut().extend_from_slice(data));
        }

        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);
        connect_host(&bt, &mut thread);
        bt.set_receive_handler(Some(handler));

        let data = Vec::from_slice(&[0x11, 0x22]).unwrap();
        crate::mock_controller::step_with(
            &bt,
            &mut thread,
            HciEvent::HostWrite {
                handle: HOST_HANDLE,
                data,
            },
        );
        RECEIVED.with(|r| assert_eq!(r.borrow().as_slice(), &[0x11, 0x22]));
    }

    #[test]
    fn test_host_disconnect_clears_slot() {
        let bt = new_bluetooth();
        let mut thread = pin!(bt.process_thread());
        power_up(&bt, &mut thread);
        connect_host(&bt, &mut thread);
        assert!(bt.is_connected(Connection::Pybricks));
        assert!(bt.is_connected(Connection::LowEnergy));

        crate::mock_controller::step_with(
            &bt,
            &mut thread,
            HciEvent::Disconnected {
                handle: HOST_HANDLE,
                reason: 0x13,
            },
        );
        assert!(!bt.is_connected(Connection::Pybricks));
        assert!(!bt.is_connected(Connection::LowEnergy));
        assert_eq!(bt.tx(b"x"), Err(BluetoothError::InvalidOperation));
    }
}
