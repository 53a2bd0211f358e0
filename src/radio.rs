//! SoftDevice side of the stack contract.
//!
//! The central queues [`StackRequest`]s; this task executes them with the
//! nrf-softdevice central and GATT client APIs and answers with the
//! [`GapEvent`]s and [`GattMessage`]s the central expects.  Timer requests
//! are forwarded to the timer task untouched.
//!
//! The SoftDevice client resolves the target service and characteristic
//! in a single discovery, so the two discovery phases are answered from
//! that one result.

use ble2uart::ble::stack::{
    AttributeData, ConnParams, GapEvent, GattMessage, LinkParams, ProcedureStatus, ScanParams,
    ServiceEntry, StackRequest,
};
use ble2uart::ble::types::{
    AdData, Address, AddressType, AttOpcode, AttValue, ConnHandle, HandleRange, PeerDevice, Uuid,
};
use ble2uart::config::{CentralConfig, MAX_AD_DATA, MAX_ATT_VALUE, MAX_SCAN_RESULTS, SCAN_DURATION_MS};
use ble2uart::Event;
use defmt::{debug, info, warn};
use embassy_futures::select::{select, select3, Either, Either3};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Receiver, Sender};
use embassy_time::{Duration, Instant, Timer};
use heapless::Vec;
use nrf_softdevice::ble::{self, central, gatt_client, Connection};
use nrf_softdevice::{raw, Softdevice};

use crate::{EVENT_QUEUE_LEN, REQUEST_QUEUE_LEN, TIMER_QUEUE_LEN};

/// HCI status: unknown connection identifier (establishment cancelled).
const HCI_UNKNOWN_CONN_ID: u8 = 0x02;
/// HCI status: remote user terminated the connection.
const HCI_REMOTE_USER_TERMINATED: u8 = 0x13;
/// HCI status: connection terminated by the local host.
const HCI_LOCAL_HOST_TERMINATED: u8 = 0x16;
/// HCI status: connection failed to be established.
const HCI_CONN_FAILED: u8 = 0x3E;
/// ATT error: attribute not found.
const ATT_ATTRIBUTE_NOT_FOUND: u8 = 0x0A;
/// ATT error: unlikely error.
const ATT_UNLIKELY_ERROR: u8 = 0x0E;

/// How often a link without a GATT client is checked for loss.
const LINK_POLL: Duration = Duration::from_millis(100);

/// GATT client for the target service and its single characteristic.
#[nrf_softdevice::gatt_client(uuid = "e6dd2eb2-27bb-7bbb-e34d-4c90cdb1b98b")]
pub struct TargetClient {
    #[characteristic(uuid = "e6dd2eb2-27bb-7bbb-e34d-4c90cdb1b98b", read, write, notify)]
    pub value: Vec<u8, MAX_ATT_VALUE>,
}

/// State of one established link.
struct Link {
    conn: Connection,
    handle: ConnHandle,
    client: Option<TargetClient>,
    rssi_period: Option<Duration>,
    next_rssi: Instant,
    terminated_locally: bool,
}

pub struct Radio {
    sd: &'static Softdevice,
    requests: Receiver<'static, CriticalSectionRawMutex, StackRequest, REQUEST_QUEUE_LEN>,
    timers: Sender<'static, CriticalSectionRawMutex, StackRequest, TIMER_QUEUE_LEN>,
    events: Sender<'static, CriticalSectionRawMutex, Event, EVENT_QUEUE_LEN>,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
}

impl Radio {
    pub fn new(
        sd: &'static Softdevice,
        requests: Receiver<'static, CriticalSectionRawMutex, StackRequest, REQUEST_QUEUE_LEN>,
        timers: Sender<'static, CriticalSectionRawMutex, StackRequest, TIMER_QUEUE_LEN>,
        events: Sender<'static, CriticalSectionRawMutex, Event, EVENT_QUEUE_LEN>,
        config: &CentralConfig,
    ) -> Self {
        Self {
            sd,
            requests,
            timers,
            events,
            service_uuid: config.service_uuid,
            characteristic_uuid: config.characteristic_uuid,
        }
    }

    pub async fn run(&self) -> ! {
        let own = ble::get_address(self.sd);
        self.post_gap(GapEvent::DeviceReady {
            address: Address::new(own.bytes()),
        })
        .await;

        loop {
            match self.next_request().await {
                StackRequest::StartScan(params) => self.scan(params).await,
                StackRequest::EstablishLink { params, peer } => self.connect(params, peer).await,
                other => debug!("radio idle, ignoring {}", other),
            }
        }
    }

    /// Next request for the radio; timer requests are passed on.
    async fn next_request(&self) -> StackRequest {
        loop {
            let request = self.requests.receive().await;
            match request {
                StackRequest::ScheduleTimer { .. } | StackRequest::CancelTimer(_) => {
                    self.timers.send(request).await
                }
                other => return other,
            }
        }
    }

    async fn post_gap(&self, event: GapEvent) {
        self.events.send(Event::Gap(event)).await;
    }

    async fn post_gatt(&self, conn: ConnHandle, msg: GattMessage) {
        self.events.send(Event::Gatt { conn, msg }).await;
    }

    // ═══════════════════════════════════════════════════════════════════
    // Scanning
    // ═══════════════════════════════════════════════════════════════════

    async fn scan(&self, params: ScanParams) {
        info!("scan starting ({} ms window)", SCAN_DURATION_MS);
        let config = central::ScanConfig {
            active: params.active,
            // 10 ms units.
            timeout: (SCAN_DURATION_MS / 10) as u16,
            ..Default::default()
        };

        let mut seen: Vec<PeerDevice, MAX_SCAN_RESULTS> = Vec::new();

        // The report callback cannot await, so reports are posted with try_send.
        let scan = central::scan(self.sd, &config, |report| {
            let addr = ble::Address::from_raw(report.peer_addr);
            let address_type = match addr.address_type() {
                ble::AddressType::Public => AddressType::Public,
                _ => AddressType::Random,
            };
            let device = PeerDevice::new(Address::new(addr.bytes()), address_type);
            if !seen.contains(&device) && seen.push(device).is_err() {
                debug!("scan list full");
            }

            let data = unsafe {
                core::slice::from_raw_parts(report.data.p_data, report.data.len as usize)
            };
            let data = AdData::from_slice(&data[..data.len().min(MAX_AD_DATA)]).unwrap_or_default();
            if self
                .events
                .try_send(Event::Gap(GapEvent::DeviceSeen { device, data }))
                .is_err()
            {
                warn!("event queue full, advertising report dropped");
            }
            None::<()>
        });

        let outcome = select(scan, self.until_cancel_scan()).await;
        match outcome {
            Either::First(Err(central::ScanError::Timeout)) | Either::First(Ok(())) => {
                info!("scan complete, {} devices", seen.len());
                self.post_gap(GapEvent::ScanComplete { devices: seen }).await;
            }
            Either::First(Err(e)) => {
                warn!("scan failed: {:?}", e);
                self.post_gap(GapEvent::ScanComplete { devices: seen }).await;
            }
            Either::Second(()) => info!("scan cancelled"),
        }
    }

    async fn until_cancel_scan(&self) {
        loop {
            match self.next_request().await {
                StackRequest::CancelScan => return,
                other => warn!("scanning, ignoring {}", other),
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Link
    // ═══════════════════════════════════════════════════════════════════

    async fn connect(&self, params: LinkParams, peer: PeerDevice) {
        info!("connecting to {} (whitelist {})", peer.address, params.use_whitelist);
        let address_type = match peer.address_type {
            AddressType::Public => ble::AddressType::Public,
            AddressType::Random => ble::AddressType::RandomStatic,
        };
        let address = ble::Address::new(address_type, peer.address.bytes());
        let whitelist = [&address];
        let conn_cfg = central::ConnectConfig {
            scan_config: central::ScanConfig {
                whitelist: Some(&whitelist),
                ..Default::default()
            },
            ..Default::default()
        };

        let outcome = select(central::connect(self.sd, &conn_cfg), self.until_terminate()).await;
        let conn = match outcome {
            Either::First(Ok(conn)) => conn,
            Either::First(Err(e)) => {
                warn!("connect failed: {:?}", e);
                self.post_gap(GapEvent::LinkEstablished {
                    status: HCI_CONN_FAILED,
                    conn: 0,
                    address: peer.address,
                })
                .await;
                return;
            }
            Either::Second(()) => {
                info!("connect cancelled");
                self.post_gap(GapEvent::LinkEstablished {
                    status: HCI_UNKNOWN_CONN_ID,
                    conn: 0,
                    address: peer.address,
                })
                .await;
                return;
            }
        };

        let handle = conn.handle().unwrap_or(0);
        self.post_gap(GapEvent::LinkEstablished {
            status: 0,
            conn: handle,
            address: peer.address,
        })
        .await;

        let mut link = Link {
            conn,
            handle,
            client: None,
            rssi_period: None,
            next_rssi: Instant::now(),
            terminated_locally: false,
        };
        self.serve(&mut link).await;

        let reason = if link.terminated_locally {
            HCI_LOCAL_HOST_TERMINATED
        } else {
            HCI_REMOTE_USER_TERMINATED
        };
        self.post_gap(GapEvent::LinkTerminated { conn: handle, reason }).await;
    }

    async fn until_terminate(&self) {
        loop {
            match self.next_request().await {
                StackRequest::TerminateLink(_) => return,
                other => warn!("connecting, ignoring {}", other),
            }
        }
    }

    /// Run requests and notifications until the link drops.
    async fn serve(&self, link: &mut Link) {
        loop {
            let outcome = {
                let conn = &link.conn;
                let handle = link.handle;
                let inbound = async {
                    match &link.client {
                        Some(client) => {
                            let _ = gatt_client::run(conn, client, |event| {
                                self.relay(handle, client, event)
                            })
                            .await;
                        }
                        None => {
                            while conn.handle().is_some() {
                                Timer::after(LINK_POLL).await;
                            }
                        }
                    }
                };
                let rssi_due = async {
                    match link.rssi_period {
                        Some(_) => Timer::at(link.next_rssi).await,
                        None => core::future::pending::<()>().await,
                    }
                };
                select3(self.next_request(), inbound, rssi_due).await
            };

            match outcome {
                Either3::First(request) => self.execute(link, request).await,
                Either3::Second(()) => return,
                Either3::Third(()) => {
                    if let Some(rssi) = link.conn.rssi() {
                        self.post_gap(GapEvent::Rssi {
                            conn: link.handle,
                            rssi,
                        })
                        .await;
                    }
                    if let Some(period) = link.rssi_period {
                        link.next_rssi += period;
                    }
                }
            }
        }
    }

    fn relay(&self, conn: ConnHandle, client: &TargetClient, event: TargetClientEvent) {
        match event {
            TargetClientEvent::ValueNotification(value) => {
                let msg = GattMessage::Notification {
                    handle: client.value_value_handle,
                    value,
                };
                if self.events.try_send(Event::Gatt { conn, msg }).is_err() {
                    warn!("event queue full, notification dropped");
                }
            }
        }
    }

    async fn execute(&self, link: &mut Link, request: StackRequest) {
        let handle = link.handle;
        match request {
            StackRequest::TerminateLink(_) => {
                link.terminated_locally = true;
                if link.conn.disconnect().is_err() {
                    debug!("link already down");
                }
            }
            StackRequest::UpdateLink { params, .. } => self.update_link(link, params).await,
            StackRequest::StartRssi { period_ms, .. } => {
                link.conn.start_rssi();
                let period = Duration::from_millis(period_ms.into());
                link.rssi_period = Some(period);
                link.next_rssi = Instant::now() + period;
            }
            StackRequest::CancelRssi(_) => link.rssi_period = None,
            StackRequest::DiscoverPrimaryService { uuid, .. } => {
                let msg = match self.discover(link, uuid).await {
                    Some(range) => {
                        let mut ranges = Vec::new();
                        let _ = ranges.push(range);
                        GattMessage::FindByTypeValueRsp {
                            ranges,
                            status: ProcedureStatus::Complete,
                        }
                    }
                    None => GattMessage::ErrorRsp {
                        request: AttOpcode::FindByTypeValueReq,
                        code: ATT_ATTRIBUTE_NOT_FOUND,
                    },
                };
                self.post_gatt(handle, msg).await;
            }
            StackRequest::DiscoverAllPrimaryServices(_) => {
                let msg = match self.discover(link, self.service_uuid).await {
                    Some(range) => {
                        let mut services = Vec::new();
                        let _ = services.push(ServiceEntry {
                            range,
                            uuid: self.service_uuid,
                        });
                        GattMessage::ReadByGroupTypeRsp {
                            services,
                            status: ProcedureStatus::Complete,
                        }
                    }
                    None => GattMessage::ErrorRsp {
                        request: AttOpcode::ReadByGroupTypeReq,
                        code: ATT_ATTRIBUTE_NOT_FOUND,
                    },
                };
                self.post_gatt(handle, msg).await;
            }
            StackRequest::ReadUsingCharUuid { uuid, .. } => {
                let msg = self.read_characteristic(link, uuid).await;
                self.post_gatt(handle, msg).await;
            }
            StackRequest::Read { handle: attr, .. } => {
                let msg = match read_value(&link.conn, attr).await {
                    Some(value) => GattMessage::ReadRsp { value },
                    None => GattMessage::ErrorRsp {
                        request: AttOpcode::ReadReq,
                        code: ATT_UNLIKELY_ERROR,
                    },
                };
                self.post_gatt(handle, msg).await;
            }
            StackRequest::Write {
                handle: attr,
                value,
                ..
            } => {
                let msg = match gatt_client::write(&link.conn, attr, &value).await {
                    Ok(()) => GattMessage::WriteRsp,
                    Err(e) => {
                        warn!("write failed: {:?}", e);
                        GattMessage::ErrorRsp {
                            request: AttOpcode::WriteReq,
                            code: ATT_UNLIKELY_ERROR,
                        }
                    }
                };
                self.post_gatt(handle, msg).await;
            }
            other => warn!("connected, ignoring {}", other),
        }
    }

    async fn update_link(&self, link: &Link, params: ConnParams) {
        let conn_params = raw::ble_gap_conn_params_t {
            min_conn_interval: params.min_interval,
            max_conn_interval: params.max_interval,
            slave_latency: params.slave_latency,
            conn_sup_timeout: params.supervision_timeout,
        };
        match link.conn.set_conn_params(conn_params) {
            Ok(()) => {
                self.post_gap(GapEvent::LinkParamUpdated { conn: link.handle })
                    .await
            }
            Err(e) => warn!("link update refused: {:?}", e),
        }
    }

    /// Resolve the target client; returns the span from the service
    /// declaration to the characteristic value.
    async fn discover(&self, link: &mut Link, uuid: Uuid) -> Option<HandleRange> {
        if uuid != self.service_uuid {
            warn!("only the configured service can be discovered");
            return None;
        }
        match gatt_client::discover::<TargetClient>(&link.conn).await {
            Ok(client) => {
                let value_handle = client.value_value_handle;
                link.client = Some(client);
                // Service declaration, characteristic declaration, value.
                Some(HandleRange::new(value_handle.saturating_sub(2).max(1), value_handle))
            }
            Err(e) => {
                warn!("service discovery failed: {:?}", e);
                None
            }
        }
    }

    async fn read_characteristic(&self, link: &Link, uuid: Uuid) -> GattMessage {
        let not_found = GattMessage::ErrorRsp {
            request: AttOpcode::ReadByTypeReq,
            code: ATT_ATTRIBUTE_NOT_FOUND,
        };
        let client = match &link.client {
            Some(client) if uuid == self.characteristic_uuid => client,
            _ => return not_found,
        };
        let handle = client.value_value_handle;
        match read_value(&link.conn, handle).await {
            Some(value) => {
                let mut pairs = Vec::new();
                let _ = pairs.push(AttributeData { handle, value });
                GattMessage::ReadByTypeRsp {
                    pairs,
                    status: ProcedureStatus::Complete,
                }
            }
            None => not_found,
        }
    }
}

async fn read_value(conn: &Connection, handle: u16) -> Option<AttValue> {
    let mut buf = [0u8; MAX_ATT_VALUE];
    match gatt_client::read(conn, handle, &mut buf).await {
        Ok(len) => Some(AttValue::from_slice(&buf[..len.min(buf.len())]).unwrap_or_default()),
        Err(e) => {
            warn!("read of handle {} failed: {:?}", handle, e);
            None
        }
    }
}
