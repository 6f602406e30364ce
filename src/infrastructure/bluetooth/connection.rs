//! BLE Connection Module
//!
//! Owns the single peripheral session: discovery list, link lifecycle,
//! characteristic resolution and the routing of notifications into the
//! transfer controller.
//!
//! All mutable link state sits in one [`LinkState`] behind a mutex that is
//! never held across an await. A session epoch, published through a
//! `watch` channel, is bumped whenever a session is torn down or a new
//! connect begins; operations in flight race against it and give up as
//! soon as it moves.

use crate::domain::error::LinkError;
use crate::domain::models::{
    AppEvent, ConnectionStatus, InboundEvent, MessageSeverity, PeripheralHandle, StatusMessage,
};
use crate::domain::transfer::TransferController;
use crate::infrastructure::bluetooth::protocol::GattProfile;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicId, GattLink, LinkSignal, TransportError,
};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// The one active connection
pub(crate) struct ConnectionSession {
    pub id: u64,
    pub peripheral: PeripheralHandle,
    pub link: Arc<dyn GattLink>,
    pub write_char: CharacteristicId,
    pub notify_char: CharacteristicId,
    forwarder: JoinHandle<()>,
}

pub(crate) struct LinkState {
    pub devices: Vec<PeripheralHandle>,
    pub session: Option<ConnectionSession>,
    pub status: ConnectionStatus,
    pub transfer: TransferController,
    /// Epoch of the connect attempt currently in flight
    connecting: Option<u64>,
    next_session_id: u64,
}

/// State shared by the connection manager, the messenger and the
/// per-session notification forwarders
pub(crate) struct LinkShared {
    state: Mutex<LinkState>,
    epoch: watch::Sender<u64>,
    events: mpsc::UnboundedSender<AppEvent>,
}

impl LinkShared {
    pub fn new(transfer: TransferController, events: mpsc::UnboundedSender<AppEvent>) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            state: Mutex::new(LinkState {
                devices: Vec::new(),
                session: None,
                status: ConnectionStatus::NotConnected,
                transfer,
                connecting: None,
                next_session_id: 1,
            }),
            epoch,
            events,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to the session epoch, marking the current value as seen.
    /// Call with the state lock held so no teardown slips in between.
    pub fn watch_epoch(&self, _state: &LinkState) -> watch::Receiver<u64> {
        let mut epoch = self.epoch.subscribe();
        epoch.borrow_and_update();
        epoch
    }

    fn bump_epoch(&self, _state: &LinkState) -> u64 {
        self.epoch.send_modify(|epoch| *epoch += 1);
        *self.epoch.borrow()
    }

    pub fn set_status(&self, state: &mut LinkState, status: ConnectionStatus) {
        debug!("Connection status: {}", status);
        state.status = status.clone();
        let _ = self.events.send(AppEvent::ConnectionStatus(status));
    }

    pub fn log(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self.events.send(AppEvent::LogMessage(StatusMessage {
            message: message.into(),
            severity,
        }));
    }

    pub fn emit(&self, event: AppEvent) {
        let _ = self.events.send(event);
    }

    /// Detach a session from the state. The returned link still has to be closed.
    fn release(&self, state: &mut LinkState, session: ConnectionSession) -> Arc<dyn GattLink> {
        self.bump_epoch(state);
        session.forwarder.abort();
        let discarded = state.transfer.abort();
        if discarded > 0 {
            info!(discarded, "Incomplete CSV capture dropped with session");
        }
        debug!(session = session.id, "Session released");
        session.link
    }

    /// Apply one notification payload if it belongs to the live session
    fn deliver(&self, session_id: u64, payload: &[u8]) {
        let mut state = self.lock();
        if state.session.as_ref().map(|s| s.id) != Some(session_id) {
            trace!(session_id, "Dropping notification from stale session");
            return;
        }

        for event in state.transfer.on_fragment(payload) {
            match &event {
                InboundEvent::CsvComplete(csv) => {
                    self.log(
                        format!("CSV received ({} bytes). Ready to upload.", csv.len()),
                        MessageSeverity::Success,
                    );
                }
                InboundEvent::DecodeAnomaly { replaced } => {
                    self.log(
                        format!("Received {} malformed byte sequence(s)", replaced),
                        MessageSeverity::Warning,
                    );
                }
                _ => {}
            }
            self.emit(AppEvent::Inbound(event));
        }
    }

    /// The platform reported the link gone, or its signal channel closed
    fn link_lost(&self, session_id: u64) {
        let link = {
            let mut state = self.lock();
            if state.session.as_ref().map(|s| s.id) != Some(session_id) {
                return;
            }
            let Some(session) = state.session.take() else {
                return;
            };
            warn!(
                session = session_id,
                "Link to {} lost",
                session.peripheral.display_name()
            );
            let link = self.release(&mut state, session);
            self.set_status(&mut state, ConnectionStatus::Disconnected);
            self.log(
                format!("{}", LinkError::LinkLost),
                MessageSeverity::Warning,
            );
            link
        };

        tokio::spawn(async move {
            if let Err(e) = link.disconnect().await {
                debug!("Closing lost link: {}", e);
            }
        });
    }
}

/// Race `op` against the session epoch; `None` means it was cancelled
pub(crate) async fn cancellable<F: Future>(
    epoch: &mut watch::Receiver<u64>,
    op: F,
) -> Option<F::Output> {
    tokio::select! {
        output = op => Some(output),
        _ = epoch.changed() => None,
    }
}

async fn forward_signals(
    shared: Weak<LinkShared>,
    session_id: u64,
    mut signals: mpsc::UnboundedReceiver<LinkSignal>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match signal {
            LinkSignal::Notification(payload) => shared.deliver(session_id, &payload),
            LinkSignal::Lost => break,
        }
    }

    if let Some(shared) = shared.upgrade() {
        shared.link_lost(session_id);
    }
}

/// Outcome of a disconnect request; neither case is an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    Disconnected,
    /// A connect in progress was abandoned
    Cancelled,
    NothingToDisconnect,
}

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub profile: GattProfile,
    /// How long each scan listens for advertisements
    pub scan_window: Duration,
    /// Report every advertiser, not only those offering the profile's service
    pub show_all_devices: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            profile: GattProfile::default(),
            scan_window: Duration::from_secs(5),
            show_all_devices: true,
        }
    }
}

/// Connection Manager
pub struct ConnectionManager {
    transport: Arc<dyn BleTransport>,
    config: ConnectionConfig,
    shared: Arc<LinkShared>,
}

impl ConnectionManager {
    pub(crate) fn new(
        transport: Arc<dyn BleTransport>,
        config: ConnectionConfig,
        shared: Arc<LinkShared>,
    ) -> Self {
        Self {
            transport,
            config,
            shared,
        }
    }

    /// Run discovery and append whatever was found to the device list
    pub async fn scan(&self) -> Result<Vec<PeripheralHandle>, LinkError> {
        {
            let mut state = self.shared.lock();
            self.shared.set_status(&mut state, ConnectionStatus::Scanning);
        }
        info!("Starting BLE scan for {:?}", self.config.scan_window);
        self.shared.log("Scanning...", MessageSeverity::Info);

        let filter = (!self.config.show_all_devices).then_some(self.config.profile.service);
        let result = self.transport.scan(self.config.scan_window, filter).await;

        let mut state = self.shared.lock();
        let connected = state.session.is_some();
        match result {
            Ok(found) => {
                info!("Scan finished, {} device(s) found", found.len());
                for device in &found {
                    self.shared.emit(AppEvent::DeviceFound(device.clone()));
                }
                state.devices.extend(found.iter().cloned());
                let status = if connected {
                    ConnectionStatus::Connected
                } else {
                    ConnectionStatus::NotConnected
                };
                self.shared.set_status(&mut state, status);
                self.shared.log(
                    format!("Found {} device(s). Select one to connect.", found.len()),
                    MessageSeverity::Info,
                );
                Ok(found)
            }
            Err(e) => {
                error!("Scan failed: {}", e);
                let status = if connected {
                    ConnectionStatus::Connected
                } else {
                    ConnectionStatus::Error(format!("Scan failed: {}", e))
                };
                self.shared.set_status(&mut state, status);
                self.shared
                    .log(format!("Scan failed: {}", e), MessageSeverity::Error);
                Err(LinkError::Scan(e.to_string()))
            }
        }
    }

    pub fn devices(&self) -> Vec<PeripheralHandle> {
        self.shared.lock().devices.clone()
    }

    pub fn clear_devices(&self) {
        self.shared.lock().devices.clear();
    }

    /// Connect to the discovered device at `index`
    pub async fn connect_index(&self, index: usize) -> Result<(), LinkError> {
        let peripheral = self.shared.lock().devices.get(index).cloned();
        match peripheral {
            Some(peripheral) => self.connect(&peripheral).await,
            None => {
                let reason = format!("no discovered device at index {}", index);
                warn!("{}", reason);
                self.shared.log(reason.clone(), MessageSeverity::Warning);
                Err(LinkError::connect(reason))
            }
        }
    }

    /// Open a session with `peripheral`, replacing any existing one
    pub async fn connect(&self, peripheral: &PeripheralHandle) -> Result<(), LinkError> {
        info!(
            "Connecting to {} ({})",
            peripheral.display_name(),
            peripheral.id
        );

        let (previous, mut epoch, attempt) = {
            let mut state = self.shared.lock();
            let previous = state
                .session
                .take()
                .map(|session| self.shared.release(&mut state, session));
            let attempt = self.shared.bump_epoch(&state);
            let epoch = self.shared.watch_epoch(&state);
            state.connecting = Some(attempt);
            self.shared.set_status(&mut state, ConnectionStatus::Connecting);
            (previous, epoch, attempt)
        };
        self.shared.log(
            format!("Connecting to {}...", peripheral.display_name()),
            MessageSeverity::Info,
        );

        if let Some(previous) = previous {
            info!("Closing previous session before connecting");
            if let Err(e) = previous.disconnect().await {
                warn!("Failed to close previous link: {}", e);
            }
        }

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let link = match cancellable(&mut epoch, self.transport.connect(peripheral, signal_tx))
            .await
        {
            Some(Ok(link)) => link,
            Some(Err(e)) => return Err(self.fail(attempt, connect_reason(&e))),
            None => return Err(self.cancelled()),
        };

        let resolved = cancellable(&mut epoch, self.prepare(link.as_ref())).await;
        let (write_char, notify_char) = match resolved {
            Some(Ok(chars)) => chars,
            outcome => {
                if let Err(e) = link.disconnect().await {
                    debug!("Closing half-open link: {}", e);
                }
                return Err(match outcome {
                    Some(Err(e)) => self.fail(attempt, connect_reason(&e)),
                    _ => self.cancelled(),
                });
            }
        };

        let superseded = {
            let mut state = self.shared.lock();
            if *self.shared.epoch.borrow() != attempt {
                Some(link)
            } else {
                let id = state.next_session_id;
                state.next_session_id += 1;
                let forwarder = tokio::spawn(forward_signals(
                    Arc::downgrade(&self.shared),
                    id,
                    signal_rx,
                ));
                state.connecting = None;
                state.session = Some(ConnectionSession {
                    id,
                    peripheral: peripheral.clone(),
                    link,
                    write_char,
                    notify_char,
                    forwarder,
                });
                self.shared.set_status(&mut state, ConnectionStatus::Connected);
                info!(session = id, "Connected to {}", peripheral.display_name());
                None
            }
        };

        if let Some(link) = superseded {
            if let Err(e) = link.disconnect().await {
                debug!("Closing superseded link: {}", e);
            }
            return Err(self.cancelled());
        }

        self.shared
            .log("Connected and ready", MessageSeverity::Success);
        Ok(())
    }

    /// Resolve both characteristics and turn on notifications
    async fn prepare(
        &self,
        link: &dyn GattLink,
    ) -> Result<(CharacteristicId, CharacteristicId), TransportError> {
        let profile = self.config.profile;

        let notify_char = link
            .characteristic(profile.service, profile.notify)
            .await?;
        debug!("Found notify characteristic {}", notify_char.uuid);
        let write_char = link.characteristic(profile.service, profile.write).await?;
        debug!("Found write characteristic {}", write_char.uuid);

        link.subscribe(&notify_char).await?;
        info!("Notifications enabled");

        Ok((write_char, notify_char))
    }

    /// Tear down the session, or cancel a connect in progress
    pub async fn disconnect(&self) -> DisconnectOutcome {
        let (link, outcome) = {
            let mut state = self.shared.lock();
            match state.session.take() {
                Some(session) => {
                    let name = session.peripheral.display_name().to_string();
                    let link = self.shared.release(&mut state, session);
                    self.shared
                        .set_status(&mut state, ConnectionStatus::Disconnected);
                    info!("Disconnected from {}", name);
                    self.shared.log("Disconnected", MessageSeverity::Info);
                    (Some(link), DisconnectOutcome::Disconnected)
                }
                None if state.connecting.is_some() => {
                    state.connecting = None;
                    self.shared.bump_epoch(&state);
                    self.shared
                        .set_status(&mut state, ConnectionStatus::Disconnected);
                    info!("Cancelling connection attempt");
                    (None, DisconnectOutcome::Cancelled)
                }
                None => {
                    info!("Disconnect requested without an active session");
                    self.shared
                        .log("No device to disconnect", MessageSeverity::Warning);
                    (None, DisconnectOutcome::NothingToDisconnect)
                }
            }
        };

        if let Some(link) = link {
            if let Err(e) = link.disconnect().await {
                warn!("Error while closing link: {}", e);
            }
        }
        outcome
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.lock().status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().session.is_some()
    }

    pub fn connected_peripheral(&self) -> Option<PeripheralHandle> {
        self.shared
            .lock()
            .session
            .as_ref()
            .map(|s| s.peripheral.clone())
    }

    /// Characteristics of the live session as (write, notify)
    pub fn characteristics(&self) -> Option<(Uuid, Uuid)> {
        self.shared
            .lock()
            .session
            .as_ref()
            .map(|s| (s.write_char.uuid, s.notify_char.uuid))
    }

    fn fail(&self, attempt: u64, reason: String) -> LinkError {
        error!("Connection failed: {}", reason);
        let mut state = self.shared.lock();
        // A disconnect or a newer connect owns the status once the epoch moved
        if state.connecting == Some(attempt) {
            state.connecting = None;
            self.shared.set_status(
                &mut state,
                ConnectionStatus::Error(format!("Connection error: {}", reason)),
            );
        }
        self.shared.log(
            format!("Connection error: {}", reason),
            MessageSeverity::Error,
        );
        LinkError::connect(reason)
    }

    /// The status was already settled by whoever moved the epoch
    fn cancelled(&self) -> LinkError {
        info!("Connection attempt cancelled");
        self.shared
            .log("Connection cancelled", MessageSeverity::Warning);
        LinkError::connect("cancelled")
    }
}

fn connect_reason(error: &TransportError) -> String {
    match error {
        TransportError::MissingService(_) | TransportError::MissingCharacteristic { .. } => {
            format!("peripheral does not expose the expected UART service: {}", error)
        }
        other => other.to_string(),
    }
}
