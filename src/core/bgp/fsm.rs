// src/core/bgp/fsm.rs

//! The per-connection BGP-4 finite state machine (RFC 4271 §8). This is a
//! pure state machine: `handle_event` takes an event and returns the state
//! transition plus a list of actions for the owning connection actor
//! (`peering.rs`) to carry out -- arming timers, sending messages, opening
//! or closing the TCP connection. No I/O happens here.

use super::message::{Message, NotificationMessage, OpenMessage};
use crate::core::errors::BgpNotification;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

#[derive(Debug, Clone)]
pub enum FsmEvent {
    ManualStart,
    ManualStop,
    AutoStart { idle_hold: bool },
    ConnectRetryTimerExpires,
    HoldTimerExpires,
    KeepAliveTimerExpires,
    DelayOpenTimerExpires,
    IdleHoldTimerExpires,
    TcpConnectionConfirmed,
    TcpConnectionFails,
    BgpOpenReceived(OpenMessage),
    OpenCollisionDump,
    NotificationVersionError,
    NotificationReceived(NotificationMessage),
    KeepAliveMsgReceived,
    UpdateMsgReceived,
    UpdateMsgError(BgpNotification, Vec<u8>),
}

#[derive(Debug, Clone)]
pub enum FsmAction {
    ArmConnectRetry,
    CancelConnectRetry,
    ArmDelayOpen,
    CancelDelayOpen,
    ArmIdleHold,
    ArmKeepaliveAndHold { negotiated_hold: u16 },
    ArmLargeHold,
    ResetHoldTimer,
    SendKeepalive,
    SendOpen,
    SendNotification(NotificationMessage, Vec<u8>),
    InitiateTcp,
    CloseTcp,
    SignalEstablished,
    SignalUpdate(Message),
    IncrementConnectRetryCounter,
    RequestAutoStartWithoutIdleHold,
}

/// One connection's FSM instance. `local_id`/`peer_id` are used only for
/// collision comparisons; this struct carries no I/O handles.
pub struct Fsm {
    pub state: FsmState,
    pub local_bgp_id: Ipv4Addr,
    pub peer_bgp_id: Option<Ipv4Addr>,
    pub connect_retry_counter: u32,
    pub negotiated_hold_time: u16,
}

impl Fsm {
    /// `local_hold_time` seeds `negotiated_hold_time` before any OPEN is
    /// exchanged, so `negotiate_hold_time` compares this speaker's own
    /// configured hold time against the peer's advertised value instead of
    /// treating an un-negotiated `0` as "accept whatever the peer sends".
    pub fn new(local_bgp_id: Ipv4Addr, local_hold_time: u16) -> Self {
        Self {
            state: FsmState::Idle,
            local_bgp_id,
            peer_bgp_id: None,
            connect_retry_counter: 0,
            negotiated_hold_time: local_hold_time,
        }
    }

    pub fn handle_event(&mut self, event: FsmEvent) -> Vec<FsmAction> {
        use FsmEvent::*;
        use FsmState::*;

        match (&self.state, event) {
            (_, ManualStop) if self.state != Idle => {
                self.state = Idle;
                vec![
                    FsmAction::SendNotification(BgpNotification::new(BgpNotification::CEASE, 0).into(), vec![]),
                    FsmAction::CancelConnectRetry,
                    FsmAction::CloseTcp,
                ]
            }
            (Idle, ManualStart) => {
                self.connect_retry_counter = 0;
                self.state = Connect;
                vec![FsmAction::ArmConnectRetry, FsmAction::InitiateTcp]
            }
            (Idle, AutoStart { idle_hold: true }) => {
                self.state = Idle;
                vec![FsmAction::ArmIdleHold]
            }
            (Idle, AutoStart { idle_hold: false }) => {
                self.connect_retry_counter = 0;
                self.state = Connect;
                vec![FsmAction::ArmConnectRetry, FsmAction::InitiateTcp]
            }
            (Idle, IdleHoldTimerExpires) => vec![FsmAction::RequestAutoStartWithoutIdleHold],

            (Connect, ConnectRetryTimerExpires) | (Active, ConnectRetryTimerExpires) => {
                self.state = Connect;
                vec![
                    FsmAction::CloseTcp,
                    FsmAction::ArmConnectRetry,
                    FsmAction::CancelDelayOpen,
                    FsmAction::InitiateTcp,
                ]
            }
            (Idle, ConnectRetryTimerExpires) => vec![],

            (Connect, TcpConnectionConfirmed) | (Active, TcpConnectionConfirmed) => {
                self.state = OpenSent;
                vec![FsmAction::CancelConnectRetry, FsmAction::SendOpen, FsmAction::ArmLargeHold]
            }
            (Connect, TcpConnectionFails) => {
                self.state = Active;
                vec![FsmAction::ArmConnectRetry]
            }
            (Active, TcpConnectionFails) => {
                self.state = Idle;
                vec![FsmAction::ArmConnectRetry, FsmAction::IncrementConnectRetryCounter]
            }
            (Connect, DelayOpenTimerExpires) | (Active, DelayOpenTimerExpires) => {
                self.state = OpenSent;
                vec![FsmAction::SendOpen, FsmAction::ArmLargeHold]
            }

            (OpenSent, BgpOpenReceived(open)) | (OpenConfirm, BgpOpenReceived(open)) => {
                self.peer_bgp_id = Some(open.bgp_identifier);
                let negotiated = negotiate_hold_time(self.negotiated_hold_time, open.hold_time);
                if negotiated != 0 && negotiated < 3 {
                    self.state = Idle;
                    return vec![FsmAction::SendNotification(
                        BgpNotification::new(BgpNotification::OPEN_MESSAGE_ERROR, 6).into(),
                        vec![],
                    )];
                }
                self.negotiated_hold_time = negotiated;
                self.state = OpenConfirm;
                vec![
                    FsmAction::SendKeepalive,
                    FsmAction::ArmKeepaliveAndHold { negotiated_hold: negotiated },
                ]
            }

            (_, HoldTimerExpires) if matches!(self.state, OpenSent | OpenConfirm | Established) => {
                self.state = Idle;
                vec![
                    FsmAction::SendNotification(BgpNotification::new(BgpNotification::HOLD_TIMER_EXPIRED, 0).into(), vec![]),
                    FsmAction::CloseTcp,
                    FsmAction::IncrementConnectRetryCounter,
                ]
            }
            (_, KeepAliveTimerExpires) if matches!(self.state, OpenConfirm | Established) => {
                vec![FsmAction::SendKeepalive]
            }
            (OpenConfirm, KeepAliveMsgReceived) => {
                self.state = Established;
                vec![FsmAction::ResetHoldTimer, FsmAction::SignalEstablished]
            }
            (Established, KeepAliveMsgReceived) => vec![FsmAction::ResetHoldTimer],
            (Established, UpdateMsgReceived) => vec![FsmAction::ResetHoldTimer],
            (Established, UpdateMsgError(notif, data)) => {
                self.state = Idle;
                vec![FsmAction::SendNotification(notif.into(), data), FsmAction::CloseTcp]
            }

            (_, OpenCollisionDump) if matches!(self.state, OpenSent | OpenConfirm | Established) => {
                self.state = Idle;
                vec![
                    FsmAction::SendNotification(BgpNotification::new(BgpNotification::CEASE, 0).into(), vec![]),
                    FsmAction::CloseTcp,
                ]
            }
            (_, NotificationVersionError) if matches!(self.state, OpenSent | OpenConfirm) => {
                self.state = Idle;
                vec![FsmAction::CloseTcp]
            }
            (_, NotificationReceived(_)) if self.state != Idle => {
                self.state = Idle;
                vec![FsmAction::CloseTcp, FsmAction::IncrementConnectRetryCounter]
            }

            // Anything else in a non-Idle state is an FSM error: per RFC
            // 4271 this closes the connection and returns to Idle.
            (state, _) if *state != Idle => {
                self.state = Idle;
                vec![
                    FsmAction::SendNotification(BgpNotification::new(BgpNotification::FSM_ERROR, 0).into(), vec![]),
                    FsmAction::CloseTcp,
                ]
            }
            _ => vec![],
        }
    }
}

fn negotiate_hold_time(local: u16, peer: u16) -> u16 {
    match (local, peer) {
        (0, p) => p,
        (l, 0) => l,
        (l, p) => l.min(p),
    }
}

/// Collision resolution (RFC 4271 §6.8): if any sibling connection to the
/// same peer is Established, this one loses. Otherwise the connection whose
/// *local* identifier is numerically lower is the one that must close its
/// outbound attempt; the higher-identifier side closes its inbound accept.
/// Returns `true` if this side should close `role`'s connection.
pub fn should_close_on_collision(
    local_id: Ipv4Addr,
    peer_id: Ipv4Addr,
    sibling_established: bool,
    is_outbound: bool,
) -> bool {
    if sibling_established {
        return true;
    }
    let local_lower = u32::from(local_id) < u32::from(peer_id);
    // The lower-ID side closes its outbound connection; the higher-ID side
    // closes its inbound connection.
    (local_lower && is_outbound) || (!local_lower && !is_outbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bgp::message::OptionalParameter;

    fn open(bgp_id: Ipv4Addr, hold: u16) -> OpenMessage {
        OpenMessage {
            version: 4,
            my_asn: 65000,
            hold_time: hold,
            bgp_identifier: bgp_id,
            optional_parameters: vec![],
        }
    }

    #[test]
    fn manual_start_arms_connect_retry_and_initiates_tcp() {
        let mut fsm = Fsm::new(Ipv4Addr::new(1, 1, 1, 1), crate::core::bgp::timers::DEFAULT_HOLD_SECS as u16);
        let actions = fsm.handle_event(FsmEvent::ManualStart);
        assert_eq!(fsm.state, FsmState::Connect);
        assert!(actions.iter().any(|a| matches!(a, FsmAction::InitiateTcp)));
    }

    #[test]
    fn open_with_unacceptable_hold_time_errors_out() {
        let mut fsm = Fsm::new(Ipv4Addr::new(1, 1, 1, 1), crate::core::bgp::timers::DEFAULT_HOLD_SECS as u16);
        fsm.state = FsmState::OpenSent;
        let actions = fsm.handle_event(FsmEvent::BgpOpenReceived(open(Ipv4Addr::new(2, 2, 2, 2), 1)));
        assert_eq!(fsm.state, FsmState::Idle);
        assert!(actions.iter().any(|a| matches!(a, FsmAction::SendNotification(..))));
    }

    #[test]
    fn open_confirm_to_established_on_keepalive() {
        let mut fsm = Fsm::new(Ipv4Addr::new(1, 1, 1, 1), crate::core::bgp::timers::DEFAULT_HOLD_SECS as u16);
        fsm.state = FsmState::OpenConfirm;
        let actions = fsm.handle_event(FsmEvent::KeepAliveMsgReceived);
        assert_eq!(fsm.state, FsmState::Established);
        assert!(actions.iter().any(|a| matches!(a, FsmAction::SignalEstablished)));
    }

    #[test]
    fn hold_timer_expiry_is_fatal_in_established() {
        let mut fsm = Fsm::new(Ipv4Addr::new(1, 1, 1, 1), crate::core::bgp::timers::DEFAULT_HOLD_SECS as u16);
        fsm.state = FsmState::Established;
        let actions = fsm.handle_event(FsmEvent::HoldTimerExpires);
        assert_eq!(fsm.state, FsmState::Idle);
        assert!(actions.iter().any(|a| matches!(a, FsmAction::CloseTcp)));
    }

    #[test]
    fn collision_sibling_established_always_loses() {
        assert!(should_close_on_collision(
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(2, 2, 2, 2),
            true,
            true
        ));
    }

    #[test]
    fn collision_lower_id_closes_outbound() {
        let lower = Ipv4Addr::new(1, 1, 1, 1);
        let higher = Ipv4Addr::new(2, 2, 2, 2);
        assert!(should_close_on_collision(lower, higher, false, true));
        assert!(!should_close_on_collision(lower, higher, false, false));
        assert!(!should_close_on_collision(higher, lower, false, true));
        assert!(should_close_on_collision(higher, lower, false, false));
    }
}
