//! Connection lifecycle of the BLE central.
//!
//! [`Central`] owns every piece of per-link state (connection handle,
//! discovery progress, procedure gate, scan results) and is driven one
//! event at a time: host commands, user actions, GAP events, GATT
//! messages and timers.  It never blocks; requests go out through the
//! [`BleStack`] and their outcomes come back later as events.
//!
//! ```text
//!   Idle ──connect──▶ Connecting ──LinkEstablished(ok)──▶ Connected
//!    ▲                    │ disconnect                       │ disconnect
//!    │                    ▼                                  ▼
//!    └────LinkTerminated── Disconnecting ◀───────────────────┘
//! ```

use crate::ble::discovery::{DiscoveryOutcome, DiscoverySequencer, DiscoveryState};
use crate::ble::gate::{GateStatus, Procedure, ProcedureGate};
use crate::ble::scanner::ScanResultStore;
use crate::ble::stack::{BleStack, GapEvent, GattMessage, StackError, TimerId};
use crate::ble::types::{Address, AttOpcode, ConnHandle, PeerDevice};
use crate::config::{CentralConfig, ManualOpPolicy, MAX_SCAN_RESULTS};
use crate::error::Error;
use crate::serial::notify::NotificationSink;
use crate::serial::report::{emit, HostSink, Report};
use crate::serial::Command;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

/// Local user input (buttons on the board).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UserAction {
    /// Start a scan, or cancel the one running.
    ToggleScan,
    /// Move the selection to the next scan result.
    SelectNext,
    /// Connect to the selected device, or drop the current link.
    ConnectOrDisconnect,
    /// Manual read or write of the discovered characteristic.
    ReadOrWrite,
    /// Request the configured connection parameters.
    UpdateLink,
    /// Start or stop periodic RSSI reports.
    ToggleRssi,
}

pub struct Central<S: BleStack> {
    config: CentralConfig,
    stack: S,
    state: ConnectionState,
    conn: Option<ConnHandle>,
    gate: ProcedureGate,
    discovery: DiscoverySequencer,
    /// Value handle of the target characteristic; 0 while unresolved.
    char_handle: u16,
    store: ScanResultStore<MAX_SCAN_RESULTS>,
    discovery_timer: bool,
    rssi_polling: bool,
    /// Payload of the next manual write.
    write_counter: u8,
    manual_write_pending: bool,
    notify: NotificationSink,
}

impl<S: BleStack> Central<S> {
    pub fn new(config: CentralConfig, stack: S) -> Self {
        Self {
            discovery: DiscoverySequencer::new(
                config.discovery,
                config.service_uuid,
                config.characteristic_uuid,
            ),
            store: ScanResultStore::new(config.scan_filter),
            notify: NotificationSink::new(config.notify_format),
            config,
            stack,
            state: ConnectionState::Idle,
            conn: None,
            gate: ProcedureGate::new(),
            char_handle: 0,
            discovery_timer: false,
            rssi_polling: false,
            write_counter: 0,
            manual_write_pending: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connection(&self) -> Option<ConnHandle> {
        self.conn
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery.state()
    }

    pub fn characteristic_handle(&self) -> u16 {
        self.char_handle
    }

    pub fn gate(&self) -> &ProcedureGate {
        &self.gate
    }

    pub fn store(&self) -> &ScanResultStore<MAX_SCAN_RESULTS> {
        &self.store
    }

    pub fn is_rssi_polling(&self) -> bool {
        self.rssi_polling
    }

    pub fn config(&self) -> &CentralConfig {
        &self.config
    }

    pub fn stack_mut(&mut self) -> &mut S {
        &mut self.stack
    }

    // ═══════════════════════════════════════════════════════════════════
    // Inputs
    // ═══════════════════════════════════════════════════════════════════

    /// Run a host command, reporting any failure as an `error:` line.
    pub fn execute(&mut self, cmd: Command, out: &mut impl HostSink) {
        debug!("command {:?}", cmd);
        let result = match cmd {
            Command::Scan => self.start_scan(out),
            Command::Connect(peer) => self.connect(peer, out),
            Command::Disconnect => self.disconnect(out),
            Command::Write { handle, value } => self.write(handle, &value, out),
        };
        if let Err(e) = result {
            warn!("command failed: {:?}", e);
            emit(out, &Report::Error(e));
        }
    }

    pub fn on_action(&mut self, action: UserAction, out: &mut impl HostSink) {
        debug!("action {:?} in {:?}", action, self.state);
        let result = match action {
            UserAction::ToggleScan => {
                if self.store.is_scanning() {
                    self.cancel_scan(out)
                } else {
                    self.start_scan(out)
                }
            }
            UserAction::SelectNext => self.select_next(out),
            UserAction::ConnectOrDisconnect => match self.state {
                ConnectionState::Idle => self.connect_selected(out),
                ConnectionState::Connecting | ConnectionState::Connected => self.disconnect(out),
                ConnectionState::Disconnecting => Err(Error::InvalidState),
            },
            UserAction::ReadOrWrite => self.read_or_write(out),
            UserAction::UpdateLink => self.update_link(),
            UserAction::ToggleRssi => self.toggle_rssi(out),
        };
        if let Err(e) = result {
            warn!("action failed: {:?}", e);
            emit(out, &Report::Error(e));
        }
    }

    pub fn on_gap(&mut self, event: GapEvent, out: &mut impl HostSink) {
        match event {
            GapEvent::DeviceReady { address } => {
                info!("central ready, address {:?}", address);
                emit(out, &Report::BleCentral(address));
            }
            GapEvent::DeviceSeen { device, data } => {
                if self.store.is_scanning() && self.store.on_device_seen(device, &data) {
                    debug!("found {:?}", device.address);
                }
            }
            GapEvent::ScanComplete { devices } => {
                self.store.on_discovery_complete(&devices);
                info!("scan complete, {} devices", self.store.len());
                emit(out, &Report::DevicesFound(self.store.len()));
                for device in self.store.iter() {
                    emit(out, &Report::Device(device.address));
                }
            }
            GapEvent::LinkEstablished {
                status,
                conn,
                address,
            } => self.on_link_established(status, conn, address, out),
            GapEvent::LinkTerminated { conn, reason } => {
                info!("link {} terminated, reason {}", conn, reason);
                self.reset_link();
                emit(out, &Report::Disconnected);
            }
            GapEvent::LinkParamUpdated { conn } => {
                if self.conn == Some(conn) {
                    emit(out, &Report::ParamUpdate);
                }
            }
            GapEvent::Rssi { conn, rssi } => {
                if self.rssi_polling && self.conn == Some(conn) {
                    emit(out, &Report::Rssi(rssi));
                }
            }
        }
    }

    /// Handle a GATT client message for `conn`.
    ///
    /// Messages arriving outside `Connected`, or for another connection,
    /// are late and dropped.
    pub fn on_gatt(&mut self, conn: ConnHandle, msg: GattMessage, out: &mut impl HostSink) {
        if self.state != ConnectionState::Connected || self.conn != Some(conn) {
            debug!("dropping GATT message for {} in {:?}", conn, self.state);
            return;
        }

        if self.discovery.is_active() && is_discovery_message(&msg) {
            self.on_discovery_message(conn, &msg, out);
            return;
        }

        match msg {
            GattMessage::Notification { handle, value }
            | GattMessage::Indication { handle, value } => {
                self.notify.deliver(out, handle, &value);
            }
            GattMessage::ReadRsp { value } => {
                self.finish(Procedure::Read);
                emit(out, &Report::ReadRsp(&value));
            }
            GattMessage::WriteRsp => {
                if self.finish(Procedure::Write) && self.manual_write_pending {
                    self.write_counter = self.write_counter.wrapping_add(1);
                }
                self.manual_write_pending = false;
                emit(out, &Report::WriteOk);
            }
            GattMessage::ErrorRsp {
                request: AttOpcode::ReadReq,
                code,
            } => {
                self.finish(Procedure::Read);
                emit(out, &Report::ReadError(code));
            }
            GattMessage::ErrorRsp {
                request: AttOpcode::WriteReq,
                code,
            } => {
                self.finish(Procedure::Write);
                self.manual_write_pending = false;
                emit(out, &Report::WriteError(code));
            }
            other => debug!("unexpected GATT message {:?}", other),
        }
    }

    pub fn on_timer(&mut self, timer: TimerId, out: &mut impl HostSink) {
        match timer {
            TimerId::StartDiscovery => self.start_discovery(out),
            TimerId::HostRxIdle => {}
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Operations
    // ═══════════════════════════════════════════════════════════════════

    /// Begin a scan; only possible while idle and not already scanning.
    pub fn start_scan(&mut self, out: &mut impl HostSink) -> Result<(), Error> {
        if self.state != ConnectionState::Idle || self.store.is_scanning() {
            return Err(Error::InvalidState);
        }
        self.stack.start_scan(self.config.scan)?;
        self.store.start_scan();
        info!("scanning");
        emit(out, &Report::Scanning);
        Ok(())
    }

    pub fn cancel_scan(&mut self, out: &mut impl HostSink) -> Result<(), Error> {
        if !self.store.is_scanning() {
            return Err(Error::InvalidState);
        }
        self.stack.cancel_scan()?;
        self.store.cancel();
        emit(out, &Report::ScanCancelled);
        Ok(())
    }

    pub fn select_next(&mut self, out: &mut impl HostSink) -> Result<(), Error> {
        if self.state != ConnectionState::Idle || self.store.is_scanning() {
            return Err(Error::InvalidState);
        }
        let (index, device) = self.store.select_next().ok_or(Error::InvalidTarget)?;
        emit(out, &Report::Selected(index, device.address));
        Ok(())
    }

    /// Establish a link to `peer`, cancelling a running scan first.
    pub fn connect(&mut self, peer: PeerDevice, out: &mut impl HostSink) -> Result<(), Error> {
        if self.state != ConnectionState::Idle {
            return Err(Error::InvalidState);
        }
        if self.store.is_scanning() {
            self.stack.cancel_scan()?;
            self.store.cancel();
        }
        self.stack.establish_link(self.config.link, peer)?;
        self.state = ConnectionState::Connecting;
        info!("connecting to {:?}", peer.address);
        emit(out, &Report::Connecting);
        Ok(())
    }

    /// Connect to the device under the selection cursor.
    pub fn connect_selected(&mut self, out: &mut impl HostSink) -> Result<(), Error> {
        let peer = self.store.selected().ok_or(Error::InvalidTarget)?;
        self.connect(peer, out)
    }

    /// Drop the link, or cancel its establishment.
    pub fn disconnect(&mut self, out: &mut impl HostSink) -> Result<(), Error> {
        match self.state {
            ConnectionState::Connecting => self.stack.terminate_link(None)?,
            ConnectionState::Connected => self.stack.terminate_link(self.conn)?,
            _ => return Err(Error::NotConnected),
        }
        self.state = ConnectionState::Disconnecting;
        self.leave_connected();
        emit(out, &Report::Disconnecting);
        Ok(())
    }

    /// Read the discovered characteristic.
    pub fn read(&mut self) -> Result<(), Error> {
        let (conn, handle) = self.characteristic()?;
        self.claim(Procedure::Read)?;
        if let Err(e) = self.stack.read_char_value(conn, handle) {
            self.gate.abort();
            return Err(e.into());
        }
        debug!("read handle {}", handle);
        Ok(())
    }

    /// Write `value` to attribute `handle` on the current link.
    pub fn write(&mut self, handle: u16, value: &[u8], out: &mut impl HostSink) -> Result<(), Error> {
        self.issue_write(handle, value, false, out)
    }

    pub fn update_link(&mut self) -> Result<(), Error> {
        let conn = self.connected()?;
        self.stack.update_link(conn, self.config.update)?;
        debug!("link update requested");
        Ok(())
    }

    pub fn toggle_rssi(&mut self, out: &mut impl HostSink) -> Result<(), Error> {
        let conn = self.connected()?;
        if self.rssi_polling {
            self.stack.cancel_rssi(conn)?;
            self.rssi_polling = false;
            emit(out, &Report::RssiCancelled);
        } else {
            self.stack.start_rssi(conn, self.config.rssi_period_ms)?;
            self.rssi_polling = true;
        }
        Ok(())
    }

    fn read_or_write(&mut self, out: &mut impl HostSink) -> Result<(), Error> {
        let kind = match self.config.manual_op {
            ManualOpPolicy::Alternate => self.gate.alternate_kind(),
            ManualOpPolicy::Read => Procedure::Read,
            ManualOpPolicy::Write => Procedure::Write,
        };
        match kind {
            Procedure::Write => {
                let (_, handle) = self.characteristic()?;
                let value = [self.write_counter];
                self.issue_write(handle, &value, true, out)
            }
            _ => self.read(),
        }
    }

    fn issue_write(
        &mut self,
        handle: u16,
        value: &[u8],
        manual: bool,
        out: &mut impl HostSink,
    ) -> Result<(), Error> {
        let conn = self.connected()?;
        self.claim(Procedure::Write)?;
        match self.stack.write_char_value(conn, handle, value) {
            Ok(()) => {
                self.manual_write_pending = manual;
                emit(out, &Report::Writing);
                Ok(())
            }
            Err(StackError::NoResources) => {
                self.gate.abort();
                Err(Error::AllocFailed)
            }
            Err(e) => {
                self.gate.abort();
                Err(e.into())
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Internals
    // ═══════════════════════════════════════════════════════════════════

    fn on_link_established(
        &mut self,
        status: u8,
        conn: ConnHandle,
        address: Address,
        out: &mut impl HostSink,
    ) {
        match (self.state, status) {
            (ConnectionState::Connecting, 0) => {
                self.state = ConnectionState::Connected;
                self.conn = Some(conn);
                info!("connected {:?} as {}", address, conn);
                emit(out, &Report::Connected(address));
                if self.char_handle == 0 {
                    self.gate.arm_for_discovery();
                    let delay = self.config.discovery_delay_ms;
                    match self.stack.schedule_timer(TimerId::StartDiscovery, delay) {
                        Ok(()) => self.discovery_timer = true,
                        Err(e) => {
                            warn!("discovery timer not scheduled: {:?}", e);
                            self.start_discovery(out);
                        }
                    }
                }
            }
            (ConnectionState::Connecting, reason) => {
                warn!("connect failed, reason {}", reason);
                self.state = ConnectionState::Idle;
                self.conn = None;
                emit(out, &Report::ConnectFailed(reason));
            }
            (ConnectionState::Disconnecting, 0) => {
                // The link came up after we asked to cancel it.
                self.conn = Some(conn);
                if let Err(e) = self.stack.terminate_link(Some(conn)) {
                    emit(out, &Report::Error(e.into()));
                }
            }
            (ConnectionState::Disconnecting, reason) => {
                debug!("establishment cancelled, reason {}", reason);
                self.reset_link();
                emit(out, &Report::Disconnected);
            }
            (state, _) => debug!("ignoring link establishment in {:?}", state),
        }
    }

    fn start_discovery(&mut self, out: &mut impl HostSink) {
        self.discovery_timer = false;
        let conn = match self.conn {
            Some(conn) if self.state == ConnectionState::Connected => conn,
            _ => {
                debug!("stale discovery timer");
                return;
            }
        };
        if self.discovery.is_active() || self.char_handle != 0 {
            return;
        }
        if let Err(e) = self.discovery.start(&mut self.stack, conn) {
            self.finish(Procedure::Discovery);
            emit(out, &Report::Error(e.into()));
        }
    }

    fn on_discovery_message(&mut self, conn: ConnHandle, msg: &GattMessage, out: &mut impl HostSink) {
        if let GattMessage::ReadByGroupTypeRsp { services, .. } = msg {
            if self.discovery.state() == DiscoveryState::DiscoveringService {
                for service in services.iter() {
                    emit(out, &Report::Service(&service.uuid));
                }
            }
        }

        match self.discovery.on_message(&mut self.stack, conn, msg) {
            DiscoveryOutcome::Pending | DiscoveryOutcome::Ignored => {}
            DiscoveryOutcome::CharacteristicFound(handle) => {
                info!("characteristic handle {}", handle);
                self.char_handle = handle;
                self.finish(Procedure::Discovery);
                emit(out, &Report::CharHandle(handle));
            }
            DiscoveryOutcome::ServiceNotFound => {
                self.finish(Procedure::Discovery);
                emit(out, &Report::ServiceNotFound);
            }
            DiscoveryOutcome::CharacteristicNotFound => {
                self.finish(Procedure::Discovery);
                emit(out, &Report::CharacteristicNotFound);
            }
            DiscoveryOutcome::Failed(e) => {
                self.finish(Procedure::Discovery);
                emit(out, &Report::Error(e.into()));
            }
        }
    }

    /// Release the gate if `kind` holds it.
    fn finish(&mut self, kind: Procedure) -> bool {
        if self.gate.in_progress() == Some(kind) {
            self.gate.complete();
            true
        } else {
            false
        }
    }

    fn claim(&mut self, kind: Procedure) -> Result<(), Error> {
        match self.gate.begin(kind) {
            GateStatus::Allowed => Ok(()),
            GateStatus::Busy => Err(Error::Busy),
        }
    }

    fn connected(&self) -> Result<ConnHandle, Error> {
        match self.conn {
            Some(conn) if self.state == ConnectionState::Connected => Ok(conn),
            _ => Err(Error::NotConnected),
        }
    }

    fn characteristic(&self) -> Result<(ConnHandle, u16), Error> {
        let conn = self.connected()?;
        if self.char_handle == 0 {
            return Err(Error::NoCharacteristic);
        }
        Ok((conn, self.char_handle))
    }

    /// Stop everything tied to the Connected state.
    fn leave_connected(&mut self) {
        if self.discovery_timer {
            // A timer that fires anyway is ignored outside Connected.
            if let Err(e) = self.stack.cancel_timer(TimerId::StartDiscovery) {
                warn!("discovery timer not cancelled: {:?}", e);
            }
            self.discovery_timer = false;
        }
        self.discovery.reset();
        if self.rssi_polling {
            if let Some(conn) = self.conn {
                if let Err(e) = self.stack.cancel_rssi(conn) {
                    warn!("RSSI cancel failed: {:?}", e);
                }
            }
            self.rssi_polling = false;
        }
    }

    fn reset_link(&mut self) {
        self.leave_connected();
        self.state = ConnectionState::Idle;
        self.conn = None;
        if !self.config.cache_characteristic {
            self.char_handle = 0;
        }
        self.gate.reset();
        self.manual_write_pending = false;
    }
}

fn is_discovery_message(msg: &GattMessage) -> bool {
    match msg {
        GattMessage::FindByTypeValueRsp { .. }
        | GattMessage::ReadByTypeRsp { .. }
        | GattMessage::ReadByGroupTypeRsp { .. } => true,
        GattMessage::ErrorRsp { request, .. } => request.is_discovery(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::stack::{AttributeData, ProcedureStatus, QueuedStack, StackRequest};
    use crate::ble::types::{AddressType, AttValue, HandleRange, Uuid};
    use crate::config::TARGET_SERVICE_UUID;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embassy_sync::channel::Channel;
    use heapless::Vec;

    const CONN: ConnHandle = 1;
    const CHAR_HANDLE: u16 = 0x25;

    type Requests = Channel<NoopRawMutex, StackRequest, 16>;
    type TestCentral<'a> = Central<QueuedStack<'a, NoopRawMutex, 16>>;
    type Out = heapless::Vec<u8, 512>;

    fn peer() -> PeerDevice {
        PeerDevice::new(
            Address::new([0xEF, 0x35, 0x01, 0x00, 0x15, 0x5F]),
            AddressType::Public,
        )
    }

    fn central(requests: &Requests, config: CentralConfig) -> TestCentral<'_> {
        Central::new(config, QueuedStack::new(requests.sender()))
    }

    fn drain(requests: &Requests) -> std::vec::Vec<StackRequest> {
        let mut out = std::vec::Vec::new();
        while let Ok(r) = requests.try_receive() {
            out.push(r);
        }
        out
    }

    fn take(out: &mut Out) -> std::string::String {
        let text = std::string::String::from_utf8(out.to_vec()).unwrap();
        out.clear();
        text
    }

    fn established() -> GapEvent {
        GapEvent::LinkEstablished {
            status: 0,
            conn: CONN,
            address: peer().address,
        }
    }

    fn service_found() -> GattMessage {
        let mut ranges = Vec::new();
        ranges.push(HandleRange::new(0x20, 0x30)).unwrap();
        GattMessage::FindByTypeValueRsp {
            ranges,
            status: ProcedureStatus::Complete,
        }
    }

    fn characteristic_found() -> GattMessage {
        let mut pairs = Vec::new();
        pairs
            .push(AttributeData {
                handle: CHAR_HANDLE,
                value: AttValue::from_slice(&[0x00]).unwrap(),
            })
            .unwrap();
        GattMessage::ReadByTypeRsp {
            pairs,
            status: ProcedureStatus::Complete,
        }
    }

    /// Connected with the characteristic resolved and all requests drained.
    fn ready<'a>(requests: &'a Requests, out: &mut Out) -> TestCentral<'a> {
        let mut c = central(requests, CentralConfig::default());
        c.connect(peer(), out).unwrap();
        c.on_gap(established(), out);
        c.on_timer(TimerId::StartDiscovery, out);
        c.on_gatt(CONN, service_found(), out);
        c.on_gatt(CONN, characteristic_found(), out);
        assert_eq!(c.characteristic_handle(), CHAR_HANDLE);
        drain(requests);
        out.clear();
        c
    }

    // ═══════════════════════════════════════════════════════════════════
    // Connection lifecycle
    // ═══════════════════════════════════════════════════════════════════

    #[test]
    fn connect_discovers_characteristic() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = central(&requests, CentralConfig::default());

        c.execute(crate::serial::Command::Connect(peer()), &mut out);
        assert_eq!(c.state(), ConnectionState::Connecting);
        assert_eq!(take(&mut out), "Connecting...\r\n");

        c.on_gap(established(), &mut out);
        assert_eq!(c.state(), ConnectionState::Connected);
        assert_eq!(c.connection(), Some(CONN));
        assert_eq!(take(&mut out), "connected device 0x5F15000135EF\r\n");
        assert_eq!(c.gate().in_progress(), Some(Procedure::Discovery));

        c.on_timer(TimerId::StartDiscovery, &mut out);
        assert_eq!(c.discovery_state(), DiscoveryState::DiscoveringService);
        c.on_gatt(CONN, service_found(), &mut out);
        assert_eq!(c.discovery_state(), DiscoveryState::DiscoveringCharacteristic);
        c.on_gatt(CONN, characteristic_found(), &mut out);

        assert_eq!(c.discovery_state(), DiscoveryState::Idle);
        assert_eq!(c.characteristic_handle(), CHAR_HANDLE);
        assert!(!c.gate().is_busy());
        assert_eq!(take(&mut out), "char handle 0025\r\n");

        let target = Uuid::Uuid128(TARGET_SERVICE_UUID);
        assert_eq!(
            drain(&requests),
            [
                StackRequest::EstablishLink {
                    params: c.config().link,
                    peer: peer(),
                },
                StackRequest::ScheduleTimer {
                    timer: TimerId::StartDiscovery,
                    delay_ms: crate::config::SVC_DISCOVERY_DELAY_MS,
                },
                StackRequest::DiscoverPrimaryService { conn: CONN, uuid: target },
                StackRequest::ReadUsingCharUuid {
                    conn: CONN,
                    range: HandleRange::new(0x20, 0x30),
                    uuid: target,
                },
            ]
        );
    }

    #[test]
    fn connect_failure_returns_to_idle() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = central(&requests, CentralConfig::default());
        c.connect(peer(), &mut out).unwrap();
        out.clear();

        c.on_gap(
            GapEvent::LinkEstablished {
                status: 0x3E,
                conn: CONN,
                address: peer().address,
            },
            &mut out,
        );
        assert_eq!(c.state(), ConnectionState::Idle);
        assert_eq!(c.connection(), None);
        assert_eq!(take(&mut out), "Connect Failed 62\r\n");
    }

    #[test]
    fn connect_only_from_idle() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = ready(&requests, &mut out);
        assert_eq!(c.connect(peer(), &mut out), Err(Error::InvalidState));
        assert!(drain(&requests).is_empty());
    }

    #[test]
    fn disconnect_resets_link_state() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = central(&requests, CentralConfig::default());
        c.connect(peer(), &mut out).unwrap();
        c.on_gap(established(), &mut out);
        c.on_timer(TimerId::StartDiscovery, &mut out);
        drain(&requests);
        out.clear();

        c.disconnect(&mut out).unwrap();
        assert_eq!(c.state(), ConnectionState::Disconnecting);
        assert_eq!(c.discovery_state(), DiscoveryState::Idle);
        assert_eq!(drain(&requests), [StackRequest::TerminateLink(Some(CONN))]);
        assert_eq!(take(&mut out), "Disconnecting\r\n");

        c.on_gap(GapEvent::LinkTerminated { conn: CONN, reason: 0x16 }, &mut out);
        assert_eq!(c.state(), ConnectionState::Idle);
        assert_eq!(c.connection(), None);
        assert_eq!(c.characteristic_handle(), 0);
        assert!(!c.gate().is_busy());
        assert_eq!(take(&mut out), "disconnected\r\n");
    }

    #[test]
    fn link_lost_while_connecting_returns_to_idle() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = central(&requests, CentralConfig::default());
        c.connect(peer(), &mut out).unwrap();
        out.clear();

        c.on_gap(GapEvent::LinkTerminated { conn: CONN, reason: 0x3E }, &mut out);
        assert_eq!(c.state(), ConnectionState::Idle);
        assert_eq!(c.connection(), None);
        assert_eq!(c.discovery_state(), DiscoveryState::Idle);
        assert_eq!(c.characteristic_handle(), 0);
        assert_eq!(c.gate().in_progress(), None);
        assert_eq!(take(&mut out), "disconnected\r\n");
        assert!(c.connect(peer(), &mut out).is_ok());
    }

    #[test]
    fn peer_drop_during_read_or_write_clears_gate() {
        for kind in [Procedure::Read, Procedure::Write] {
            let requests = Requests::new();
            let mut out = Out::new();
            let mut c = ready(&requests, &mut out);
            match kind {
                Procedure::Write => c.write(CHAR_HANDLE, &[0x01], &mut out).unwrap(),
                _ => c.read().unwrap(),
            }
            assert_eq!(c.gate().in_progress(), Some(kind));
            out.clear();

            c.on_gap(GapEvent::LinkTerminated { conn: CONN, reason: 0x08 }, &mut out);
            assert_eq!(c.state(), ConnectionState::Idle);
            assert_eq!(c.discovery_state(), DiscoveryState::Idle);
            assert_eq!(c.characteristic_handle(), 0);
            assert_eq!(c.gate().in_progress(), None);
            assert_eq!(take(&mut out), "disconnected\r\n");

            // The response that never made it is not waited for.
            c.on_gatt(CONN, GattMessage::WriteRsp, &mut out);
            assert!(out.is_empty());
        }
    }

    #[test]
    fn discovery_starts_at_once_when_timer_refused() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = central(&requests, CentralConfig::default());
        c.connect(peer(), &mut out).unwrap();
        drain(&requests);
        out.clear();

        // Neither the timer nor the discovery request fits.
        while requests.try_send(StackRequest::CancelScan).is_ok() {}
        c.on_gap(established(), &mut out);

        assert_eq!(c.discovery_state(), DiscoveryState::Idle);
        assert_eq!(c.gate().in_progress(), None);
        assert_eq!(
            take(&mut out),
            "connected device 0x5F15000135EF\r\nerror: stack out of resources\r\n"
        );
        assert!(drain(&requests)
            .iter()
            .all(|r| *r == StackRequest::CancelScan));
    }

    #[test]
    fn disconnect_cancels_pending_discovery_timer() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = central(&requests, CentralConfig::default());
        c.connect(peer(), &mut out).unwrap();
        c.on_gap(established(), &mut out);
        drain(&requests);

        c.disconnect(&mut out).unwrap();
        assert_eq!(
            drain(&requests),
            [
                StackRequest::TerminateLink(Some(CONN)),
                StackRequest::CancelTimer(TimerId::StartDiscovery),
            ]
        );

        // A timer that fired anyway is ignored.
        c.on_timer(TimerId::StartDiscovery, &mut out);
        assert!(drain(&requests).is_empty());
    }

    #[test]
    fn disconnect_while_connecting_cancels_establishment() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = central(&requests, CentralConfig::default());
        c.connect(peer(), &mut out).unwrap();
        drain(&requests);

        c.disconnect(&mut out).unwrap();
        assert_eq!(drain(&requests), [StackRequest::TerminateLink(None)]);
        out.clear();

        c.on_gap(
            GapEvent::LinkEstablished {
                status: 0x02,
                conn: CONN,
                address: peer().address,
            },
            &mut out,
        );
        assert_eq!(c.state(), ConnectionState::Idle);
        assert_eq!(take(&mut out), "disconnected\r\n");
    }

    #[test]
    fn link_up_after_cancel_is_terminated() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = central(&requests, CentralConfig::default());
        c.connect(peer(), &mut out).unwrap();
        c.disconnect(&mut out).unwrap();
        drain(&requests);

        c.on_gap(established(), &mut out);
        assert_eq!(c.state(), ConnectionState::Disconnecting);
        assert_eq!(drain(&requests), [StackRequest::TerminateLink(Some(CONN))]);
    }

    #[test]
    fn disconnect_when_idle_is_an_error() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = central(&requests, CentralConfig::default());
        c.execute(crate::serial::Command::Disconnect, &mut out);
        assert_eq!(take(&mut out), "error: not connected\r\n");
    }

    #[test]
    fn cached_handle_skips_rediscovery() {
        let requests = Requests::new();
        let mut out = Out::new();
        let config = CentralConfig {
            cache_characteristic: true,
            ..CentralConfig::default()
        };
        let mut c = central(&requests, config);
        c.connect(peer(), &mut out).unwrap();
        c.on_gap(established(), &mut out);
        c.on_timer(TimerId::StartDiscovery, &mut out);
        c.on_gatt(CONN, service_found(), &mut out);
        c.on_gatt(CONN, characteristic_found(), &mut out);
        c.on_gap(GapEvent::LinkTerminated { conn: CONN, reason: 0x08 }, &mut out);
        assert_eq!(c.characteristic_handle(), CHAR_HANDLE);
        drain(&requests);

        c.connect(peer(), &mut out).unwrap();
        c.on_gap(established(), &mut out);
        assert!(!c.gate().is_busy());
        assert_eq!(drain(&requests).len(), 1);
    }

    // ═══════════════════════════════════════════════════════════════════
    // Scanning
    // ═══════════════════════════════════════════════════════════════════

    #[test]
    fn scan_collects_filtered_devices() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = central(&requests, CentralConfig::default());

        c.execute(crate::serial::Command::Scan, &mut out);
        assert_eq!(take(&mut out), "scanning...\r\n");
        assert!(c.store().is_scanning());

        let target = peer();
        let other = PeerDevice::new(Address::new([1, 2, 3, 4, 5, 6]), AddressType::Random);
        let ad = crate::ble::types::AdData::from_slice(&[0x03, 0x03, 0xF0, 0xFF]).unwrap();
        c.on_gap(GapEvent::DeviceSeen { device: target, data: ad.clone() }, &mut out);
        c.on_gap(GapEvent::DeviceSeen { device: target, data: ad }, &mut out);
        c.on_gap(
            GapEvent::DeviceSeen {
                device: other,
                data: crate::ble::types::AdData::new(),
            },
            &mut out,
        );

        let mut devices = Vec::new();
        devices.push(target).unwrap();
        devices.push(other).unwrap();
        c.on_gap(GapEvent::ScanComplete { devices }, &mut out);

        assert!(!c.store().is_scanning());
        assert_eq!(c.store().len(), 1);
        assert_eq!(take(&mut out), "Devices Found 1\r\nDevice 0x5F15000135EF\r\n");
    }

    #[test]
    fn scan_only_from_idle() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = ready(&requests, &mut out);
        assert_eq!(c.start_scan(&mut out), Err(Error::InvalidState));

        let mut idle = central(&requests, CentralConfig::default());
        idle.start_scan(&mut out).unwrap();
        assert_eq!(idle.start_scan(&mut out), Err(Error::InvalidState));
    }

    #[test]
    fn connect_cancels_running_scan() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = central(&requests, CentralConfig::default());
        c.start_scan(&mut out).unwrap();
        c.connect(peer(), &mut out).unwrap();

        let sent = drain(&requests);
        assert_eq!(sent[1], StackRequest::CancelScan);
        assert!(matches!(sent[2], StackRequest::EstablishLink { .. }));
        assert!(!c.store().is_scanning());
    }

    #[test]
    fn buttons_select_then_connect() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = central(&requests, CentralConfig::default());

        c.on_action(UserAction::ConnectOrDisconnect, &mut out);
        assert_eq!(take(&mut out), "error: no device selected\r\n");

        c.on_action(UserAction::ToggleScan, &mut out);
        let ad = crate::ble::types::AdData::from_slice(&[0x03, 0x02, 0xF0, 0xFF]).unwrap();
        c.on_gap(GapEvent::DeviceSeen { device: peer(), data: ad }, &mut out);
        c.on_gap(GapEvent::ScanComplete { devices: Vec::new() }, &mut out);
        out.clear();

        c.on_action(UserAction::SelectNext, &mut out);
        assert_eq!(take(&mut out), "Selected 0 0x5F15000135EF\r\n");

        c.on_action(UserAction::ConnectOrDisconnect, &mut out);
        assert_eq!(c.state(), ConnectionState::Connecting);
    }

    #[test]
    fn toggle_scan_cancels() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = central(&requests, CentralConfig::default());
        c.on_action(UserAction::ToggleScan, &mut out);
        c.on_action(UserAction::ToggleScan, &mut out);
        assert!(!c.store().is_scanning());
        assert_eq!(take(&mut out), "scanning...\r\nscan cancelled\r\n");
        assert_eq!(drain(&requests).last(), Some(&StackRequest::CancelScan));
    }

    // ═══════════════════════════════════════════════════════════════════
    // Reads and writes
    // ═══════════════════════════════════════════════════════════════════

    #[test]
    fn second_procedure_is_busy() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = ready(&requests, &mut out);

        c.read().unwrap();
        assert_eq!(drain(&requests), [StackRequest::Read { conn: CONN, handle: CHAR_HANDLE }]);
        assert_eq!(c.write(CHAR_HANDLE, &[1], &mut out), Err(Error::Busy));
        assert!(drain(&requests).is_empty());

        c.on_gatt(
            CONN,
            GattMessage::ReadRsp {
                value: AttValue::from_slice(&[0x07]).unwrap(),
            },
            &mut out,
        );
        assert_eq!(take(&mut out), "Read rsp: 07\r\n");
        assert!(!c.gate().is_busy());
        assert!(c.write(CHAR_HANDLE, &[1], &mut out).is_ok());
    }

    #[test]
    fn write_response_is_never_an_error() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = ready(&requests, &mut out);

        c.execute(
            crate::serial::Command::Write {
                handle: 0x15,
                value: crate::ble::types::WriteValue::from_slice(&[0xF0]).unwrap(),
            },
            &mut out,
        );
        c.on_gatt(CONN, GattMessage::WriteRsp, &mut out);
        assert_eq!(take(&mut out), "writing...\r\nwrite ok\r\n");

        c.write(0x15, &[0xF0], &mut out).unwrap();
        c.on_gatt(
            CONN,
            GattMessage::ErrorRsp {
                request: AttOpcode::WriteReq,
                code: 0x03,
            },
            &mut out,
        );
        assert_eq!(take(&mut out), "writing...\r\nWrite Error 3\r\n");
        assert!(!c.gate().is_busy());
    }

    #[test]
    fn read_error_releases_gate() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = ready(&requests, &mut out);
        c.read().unwrap();
        c.on_gatt(
            CONN,
            GattMessage::ErrorRsp {
                request: AttOpcode::ReadReq,
                code: 0x02,
            },
            &mut out,
        );
        assert_eq!(take(&mut out), "Read Error 2\r\n");
        assert!(!c.gate().is_busy());
    }

    #[test]
    fn write_without_buffer_reports_alloc_failure() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = ready(&requests, &mut out);
        while requests.try_send(StackRequest::CancelScan).is_ok() {}

        c.execute(
            crate::serial::Command::Write {
                handle: CHAR_HANDLE,
                value: crate::ble::types::WriteValue::from_slice(&[1]).unwrap(),
            },
            &mut out,
        );
        assert_eq!(take(&mut out), "error: alloc failed\r\n");
        assert!(!c.gate().is_busy());
    }

    #[test]
    fn manual_trigger_alternates_read_and_write() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = ready(&requests, &mut out);

        c.on_action(UserAction::ReadOrWrite, &mut out);
        assert!(matches!(&drain(&requests)[..], [StackRequest::Read { .. }]));
        c.on_gatt(CONN, GattMessage::ReadRsp { value: AttValue::new() }, &mut out);

        c.on_action(UserAction::ReadOrWrite, &mut out);
        match &drain(&requests)[..] {
            [StackRequest::Write { handle, value, .. }] => {
                assert_eq!(*handle, CHAR_HANDLE);
                assert_eq!(value.as_slice(), &[0]);
            }
            other => panic!("unexpected {:?}", other),
        }
        c.on_gatt(CONN, GattMessage::WriteRsp, &mut out);

        c.on_action(UserAction::ReadOrWrite, &mut out);
        c.on_gatt(CONN, GattMessage::ReadRsp { value: AttValue::new() }, &mut out);
        c.on_action(UserAction::ReadOrWrite, &mut out);
        match &drain(&requests)[..] {
            [StackRequest::Read { .. }, StackRequest::Write { value, .. }] => {
                assert_eq!(value.as_slice(), &[1]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn manual_trigger_needs_characteristic() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = central(&requests, CentralConfig::default());
        c.connect(peer(), &mut out).unwrap();
        c.on_gap(established(), &mut out);
        out.clear();

        c.on_action(UserAction::ReadOrWrite, &mut out);
        assert_eq!(take(&mut out), "error: characteristic unknown\r\n");
    }

    // ═══════════════════════════════════════════════════════════════════
    // Inbound traffic
    // ═══════════════════════════════════════════════════════════════════

    #[test]
    fn notification_relayed_to_host() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = ready(&requests, &mut out);
        c.on_gatt(
            CONN,
            GattMessage::Notification {
                handle: CHAR_HANDLE,
                value: AttValue::from_slice(&[0x00, 0x07, 0x02]).unwrap(),
            },
            &mut out,
        );
        assert_eq!(take(&mut out), "handle 0025 00 07 02\r\n");
    }

    #[test]
    fn late_messages_are_dropped() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = ready(&requests, &mut out);

        c.on_gatt(CONN + 1, GattMessage::WriteRsp, &mut out);
        assert!(out.is_empty());

        c.disconnect(&mut out).unwrap();
        out.clear();
        c.on_gatt(CONN, GattMessage::ReadRsp { value: AttValue::new() }, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn service_not_found_clears_gate() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = central(&requests, CentralConfig::default());
        c.connect(peer(), &mut out).unwrap();
        c.on_gap(established(), &mut out);
        c.on_timer(TimerId::StartDiscovery, &mut out);
        out.clear();

        c.on_gatt(
            CONN,
            GattMessage::ErrorRsp {
                request: AttOpcode::FindByTypeValueReq,
                code: 0x0A,
            },
            &mut out,
        );
        assert_eq!(take(&mut out), "service not found\r\n");
        assert!(!c.gate().is_busy());
        assert_eq!(c.characteristic_handle(), 0);
    }

    #[test]
    fn rssi_polling_toggles() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = ready(&requests, &mut out);

        c.on_action(UserAction::ToggleRssi, &mut out);
        assert!(c.is_rssi_polling());
        c.on_gap(GapEvent::Rssi { conn: CONN, rssi: -60 }, &mut out);
        c.on_action(UserAction::ToggleRssi, &mut out);
        c.on_gap(GapEvent::Rssi { conn: CONN, rssi: -61 }, &mut out);

        assert_eq!(take(&mut out), "RSSI -dB: 60\r\nRSSI Cancelled\r\n");
        assert_eq!(
            drain(&requests),
            [
                StackRequest::StartRssi {
                    conn: CONN,
                    period_ms: crate::config::RSSI_PERIOD_MS,
                },
                StackRequest::CancelRssi(CONN),
            ]
        );
    }

    #[test]
    fn link_update_reported() {
        let requests = Requests::new();
        let mut out = Out::new();
        let mut c = ready(&requests, &mut out);
        c.on_action(UserAction::UpdateLink, &mut out);
        assert!(matches!(&drain(&requests)[..], [StackRequest::UpdateLink { conn: CONN, .. }]));
        c.on_gap(GapEvent::LinkParamUpdated { conn: CONN }, &mut out);
        assert_eq!(take(&mut out), "Param Update\r\n");
    }
}
