//! Two-phase GATT discovery of the target characteristic.
//!
//! Phase 1 locates the target primary service (by UUID, or by walking all
//! primary services), phase 2 reads the characteristic by UUID inside the
//! service's handle range.  Each run ends in exactly one terminal
//! [`DiscoveryOutcome`]; nothing is retried.

use crate::ble::stack::{BleStack, GattMessage, ProcedureStatus, StackError};
use crate::ble::types::{ConnHandle, HandleRange, Uuid};
use crate::config::DiscoveryMethod;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoveryState {
    #[default]
    Idle,
    DiscoveringService,
    DiscoveringCharacteristic,
}

/// Result of feeding one message to the sequencer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoveryOutcome {
    /// The run continues.
    Pending,
    /// The message does not belong to the current phase.
    Ignored,
    /// Characteristic value handle resolved.
    CharacteristicFound(u16),
    ServiceNotFound,
    CharacteristicNotFound,
    /// The stack refused to issue the next request.
    Failed(StackError),
}

#[derive(Clone, Debug)]
pub struct DiscoverySequencer {
    state: DiscoveryState,
    method: DiscoveryMethod,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    range: HandleRange,
}

impl DiscoverySequencer {
    pub const fn new(method: DiscoveryMethod, service_uuid: Uuid, characteristic_uuid: Uuid) -> Self {
        Self {
            state: DiscoveryState::Idle,
            method,
            service_uuid,
            characteristic_uuid,
            range: HandleRange::new(0, 0),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != DiscoveryState::Idle
    }

    /// Handle range of the service found in phase 1 (zero while unknown).
    pub fn service_range(&self) -> HandleRange {
        self.range
    }

    /// Issue the phase 1 request.
    pub fn start<S: BleStack>(&mut self, stack: &mut S, conn: ConnHandle) -> Result<(), StackError> {
        self.range = HandleRange::default();
        match self.method {
            DiscoveryMethod::ByUuid => stack.discover_primary_service(conn, self.service_uuid)?,
            DiscoveryMethod::All => stack.discover_all_primary_services(conn)?,
        }
        debug!("discovery: service phase ({:?})", self.method);
        self.state = DiscoveryState::DiscoveringService;
        Ok(())
    }

    /// Abandon any run in progress.
    pub fn reset(&mut self) {
        self.state = DiscoveryState::Idle;
        self.range = HandleRange::default();
    }

    pub fn on_message<S: BleStack>(
        &mut self,
        stack: &mut S,
        conn: ConnHandle,
        msg: &GattMessage,
    ) -> DiscoveryOutcome {
        match self.state {
            DiscoveryState::Idle => DiscoveryOutcome::Ignored,
            DiscoveryState::DiscoveringService => self.on_service_message(stack, conn, msg),
            DiscoveryState::DiscoveringCharacteristic => self.on_characteristic_message(msg),
        }
    }

    fn on_service_message<S: BleStack>(
        &mut self,
        stack: &mut S,
        conn: ConnHandle,
        msg: &GattMessage,
    ) -> DiscoveryOutcome {
        let done = match (self.method, msg) {
            (DiscoveryMethod::ByUuid, GattMessage::FindByTypeValueRsp { ranges, status }) => {
                if !self.range.is_known() {
                    if let Some(first) = ranges.first() {
                        self.range = *first;
                    }
                }
                *status == ProcedureStatus::Complete
            }
            (DiscoveryMethod::All, GattMessage::ReadByGroupTypeRsp { services, status }) => {
                if !self.range.is_known() {
                    if let Some(entry) = services.iter().find(|s| s.uuid == self.service_uuid) {
                        self.range = entry.range;
                    }
                }
                *status == ProcedureStatus::Complete
            }
            (_, GattMessage::ErrorRsp { request, code }) if request.is_discovery() => {
                debug!("discovery: service phase ended by error {}", code);
                true
            }
            _ => return DiscoveryOutcome::Ignored,
        };

        if !done {
            return DiscoveryOutcome::Pending;
        }

        if !self.range.is_known() {
            self.state = DiscoveryState::Idle;
            return DiscoveryOutcome::ServiceNotFound;
        }

        debug!(
            "discovery: service at {}..{}",
            self.range.start,
            self.range.end
        );
        match stack.read_using_char_uuid(conn, self.range, self.characteristic_uuid) {
            Ok(()) => {
                self.state = DiscoveryState::DiscoveringCharacteristic;
                DiscoveryOutcome::Pending
            }
            Err(e) => {
                self.state = DiscoveryState::Idle;
                DiscoveryOutcome::Failed(e)
            }
        }
    }

    fn on_characteristic_message(&mut self, msg: &GattMessage) -> DiscoveryOutcome {
        let handle = match msg {
            GattMessage::ReadByTypeRsp { pairs, .. } => pairs.first().map(|p| p.handle),
            GattMessage::ErrorRsp { request, .. } if request.is_discovery() => None,
            _ => return DiscoveryOutcome::Ignored,
        };

        self.state = DiscoveryState::Idle;
        match handle {
            Some(h) => DiscoveryOutcome::CharacteristicFound(h),
            None => DiscoveryOutcome::CharacteristicNotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::stack::{AttributeData, QueuedStack, ServiceEntry, StackRequest};
    use crate::ble::types::{AttOpcode, AttValue};
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embassy_sync::channel::Channel;
    use heapless::Vec;

    const CONN: ConnHandle = 0;
    const SERVICE: Uuid = Uuid::Uuid128([0x11; 16]);
    const CHAR: Uuid = Uuid::Uuid128([0x22; 16]);

    type Requests = Channel<NoopRawMutex, StackRequest, 8>;

    fn found_service(start: u16, end: u16) -> GattMessage {
        let mut ranges = Vec::new();
        ranges.push(HandleRange::new(start, end)).unwrap();
        GattMessage::FindByTypeValueRsp {
            ranges,
            status: ProcedureStatus::InProgress,
        }
    }

    fn service_complete() -> GattMessage {
        GattMessage::FindByTypeValueRsp {
            ranges: Vec::new(),
            status: ProcedureStatus::Complete,
        }
    }

    fn char_rsp(handles: &[u16]) -> GattMessage {
        let mut pairs = Vec::new();
        for &handle in handles {
            pairs
                .push(AttributeData {
                    handle,
                    value: AttValue::new(),
                })
                .unwrap();
        }
        GattMessage::ReadByTypeRsp {
            pairs,
            status: ProcedureStatus::InProgress,
        }
    }

    #[test]
    fn service_then_characteristic() {
        let requests = Requests::new();
        let mut stack = QueuedStack::new(requests.sender());
        let mut seq = DiscoverySequencer::new(DiscoveryMethod::ByUuid, SERVICE, CHAR);

        seq.start(&mut stack, CONN).unwrap();
        assert_eq!(seq.state(), DiscoveryState::DiscoveringService);
        assert_eq!(
            requests.try_receive().unwrap(),
            StackRequest::DiscoverPrimaryService { conn: CONN, uuid: SERVICE }
        );

        assert_eq!(
            seq.on_message(&mut stack, CONN, &found_service(0x20, 0x30)),
            DiscoveryOutcome::Pending
        );
        assert_eq!(seq.state(), DiscoveryState::DiscoveringService);
        assert_eq!(
            seq.on_message(&mut stack, CONN, &service_complete()),
            DiscoveryOutcome::Pending
        );
        assert_eq!(seq.state(), DiscoveryState::DiscoveringCharacteristic);
        assert_eq!(
            requests.try_receive().unwrap(),
            StackRequest::ReadUsingCharUuid {
                conn: CONN,
                range: HandleRange::new(0x20, 0x30),
                uuid: CHAR
            }
        );

        assert_eq!(
            seq.on_message(&mut stack, CONN, &char_rsp(&[0x25, 0x28])),
            DiscoveryOutcome::CharacteristicFound(0x25)
        );
        assert_eq!(seq.state(), DiscoveryState::Idle);
    }

    #[test]
    fn first_service_match_is_kept() {
        let requests = Requests::new();
        let mut stack = QueuedStack::new(requests.sender());
        let mut seq = DiscoverySequencer::new(DiscoveryMethod::ByUuid, SERVICE, CHAR);
        seq.start(&mut stack, CONN).unwrap();

        seq.on_message(&mut stack, CONN, &found_service(0x10, 0x14));
        seq.on_message(&mut stack, CONN, &found_service(0x40, 0x50));
        assert_eq!(seq.service_range(), HandleRange::new(0x10, 0x14));
    }

    #[test]
    fn service_not_found_returns_to_idle() {
        let requests = Requests::new();
        let mut stack = QueuedStack::new(requests.sender());
        let mut seq = DiscoverySequencer::new(DiscoveryMethod::ByUuid, SERVICE, CHAR);
        seq.start(&mut stack, CONN).unwrap();
        let _ = requests.try_receive();

        assert_eq!(
            seq.on_message(&mut stack, CONN, &service_complete()),
            DiscoveryOutcome::ServiceNotFound
        );
        assert_eq!(seq.state(), DiscoveryState::Idle);
        assert!(requests.try_receive().is_err());
    }

    #[test]
    fn error_response_ends_service_phase() {
        let requests = Requests::new();
        let mut stack = QueuedStack::new(requests.sender());
        let mut seq = DiscoverySequencer::new(DiscoveryMethod::ByUuid, SERVICE, CHAR);
        seq.start(&mut stack, CONN).unwrap();

        seq.on_message(&mut stack, CONN, &found_service(0x20, 0x30));
        let err = GattMessage::ErrorRsp {
            request: AttOpcode::FindByTypeValueReq,
            code: 0x0A,
        };
        assert_eq!(seq.on_message(&mut stack, CONN, &err), DiscoveryOutcome::Pending);
        assert_eq!(seq.state(), DiscoveryState::DiscoveringCharacteristic);
    }

    #[test]
    fn empty_characteristic_response_is_not_found() {
        let requests = Requests::new();
        let mut stack = QueuedStack::new(requests.sender());
        let mut seq = DiscoverySequencer::new(DiscoveryMethod::ByUuid, SERVICE, CHAR);
        seq.start(&mut stack, CONN).unwrap();
        seq.on_message(&mut stack, CONN, &found_service(0x20, 0x30));
        seq.on_message(&mut stack, CONN, &service_complete());

        let err = GattMessage::ErrorRsp {
            request: AttOpcode::ReadByTypeReq,
            code: 0x0A,
        };
        assert_eq!(
            seq.on_message(&mut stack, CONN, &err),
            DiscoveryOutcome::CharacteristicNotFound
        );
        assert_eq!(seq.state(), DiscoveryState::Idle);
    }

    #[test]
    fn discover_all_matches_target_uuid() {
        let requests = Requests::new();
        let mut stack = QueuedStack::new(requests.sender());
        let mut seq = DiscoverySequencer::new(DiscoveryMethod::All, SERVICE, CHAR);
        seq.start(&mut stack, CONN).unwrap();
        assert_eq!(
            requests.try_receive().unwrap(),
            StackRequest::DiscoverAllPrimaryServices(CONN)
        );

        let mut services = Vec::new();
        services
            .push(ServiceEntry {
                range: HandleRange::new(1, 7),
                uuid: Uuid::Uuid16(0x1800),
            })
            .unwrap();
        services
            .push(ServiceEntry {
                range: HandleRange::new(0x20, 0x30),
                uuid: SERVICE,
            })
            .unwrap();
        let rsp = GattMessage::ReadByGroupTypeRsp {
            services,
            status: ProcedureStatus::Complete,
        };
        assert_eq!(seq.on_message(&mut stack, CONN, &rsp), DiscoveryOutcome::Pending);
        assert_eq!(seq.service_range(), HandleRange::new(0x20, 0x30));
        assert_eq!(seq.state(), DiscoveryState::DiscoveringCharacteristic);
    }

    #[test]
    fn refused_phase_two_request_fails_the_run() {
        let requests: Channel<NoopRawMutex, StackRequest, 1> = Channel::new();
        let mut stack = QueuedStack::new(requests.sender());
        let mut seq = DiscoverySequencer::new(DiscoveryMethod::ByUuid, SERVICE, CHAR);
        seq.start(&mut stack, CONN).unwrap();
        // Queue still holds the phase 1 request.
        seq.on_message(&mut stack, CONN, &found_service(0x20, 0x30));
        assert_eq!(
            seq.on_message(&mut stack, CONN, &service_complete()),
            DiscoveryOutcome::Failed(StackError::NoResources)
        );
        assert_eq!(seq.state(), DiscoveryState::Idle);
    }

    #[test]
    fn unrelated_messages_are_ignored() {
        let requests = Requests::new();
        let mut stack = QueuedStack::new(requests.sender());
        let mut seq = DiscoverySequencer::new(DiscoveryMethod::ByUuid, SERVICE, CHAR);
        assert_eq!(
            seq.on_message(&mut stack, CONN, &service_complete()),
            DiscoveryOutcome::Ignored
        );
        seq.start(&mut stack, CONN).unwrap();
        assert_eq!(
            seq.on_message(&mut stack, CONN, &char_rsp(&[1])),
            DiscoveryOutcome::Ignored
        );
        assert_eq!(seq.state(), DiscoveryState::DiscoveringService);
    }
}
