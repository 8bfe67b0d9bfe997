// src/core/bgp/peering.rs

//! Per-peer actor: owns the FSM-driven connection(s) to one peer, resolves
//! collisions between a concurrent inbound and outbound attempt, and runs
//! the UPDATE-batching announcement engine. Mirrors the single-writer actor
//! discipline used for coordinators (`coordinator.rs`) -- everything that
//! touches this peer's session state goes through one task's message loop.

use super::attribute::{Attribute, AttributeSet, NextHopValue};
use super::codec::BgpCodec;
use super::fsm::{should_close_on_collision, Fsm, FsmAction, FsmEvent, FsmState};
use super::message::{Message, NotificationMessage, OpenMessage, OptionalParameter, Prefix, UpdateMessage, BGP_PORT};
use super::timers::{self, TimerSet};
use crate::core::errors::ControlPlaneError;
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressFamily {
    pub afi: u16,
    pub safi: u8,
}

impl AddressFamily {
    pub const IPV4_UNICAST: AddressFamily = AddressFamily { afi: 1, safi: 1 };
    pub const IPV6_UNICAST: AddressFamily = AddressFamily { afi: 2, safi: 1 };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub family: AddressFamily,
    pub prefix: Prefix,
    pub attrs: AttributeSet,
}

/// Per-AF advertisement bookkeeping: maps each advertised prefix to the
/// attribute set it carries. Two snapshots' symmetric difference drives the
/// withdraw/update split in `build_update_messages`.
type FamilyState = HashMap<Prefix, AttributeSet>;

#[derive(Default)]
pub struct AnnouncementEngine {
    advertised: HashMap<AddressFamily, FamilyState>,
    to_advertise: HashMap<AddressFamily, FamilyState>,
}

impl AnnouncementEngine {
    pub fn set_advertisements(&mut self, desired: Vec<Advertisement>) {
        self.to_advertise.clear();
        for adv in desired {
            self.to_advertise.entry(adv.family).or_default().insert(adv.prefix, adv.attrs);
        }
    }

    /// Builds the UPDATE batch for the current `to_advertise` vs `advertised`
    /// diff. Does not mutate `advertised` -- the caller commits that only
    /// after a successful send, per the `setAdvertisements` contract.
    pub fn build_update_messages(&self, local_peer_addr: Ipv4Addr) -> Vec<Message> {
        let mut messages = Vec::new();
        let mut withdrawals_sent = false;

        let families: std::collections::HashSet<AddressFamily> =
            self.advertised.keys().chain(self.to_advertise.keys()).copied().collect();

        for family in families {
            let advertised = self.advertised.get(&family).cloned().unwrap_or_default();
            let desired = self.to_advertise.get(&family).cloned().unwrap_or_default();

            let withdrawals: Vec<Prefix> = advertised
                .keys()
                .filter(|p| !desired.contains_key(*p))
                .cloned()
                .collect();

            // Group new/changed prefixes by attribute-set identity so one
            // UPDATE carries every prefix sharing that exact set.
            let mut by_attrs: HashMap<AttributeSet, Vec<Prefix>> = HashMap::new();
            for (prefix, attrs) in &desired {
                if advertised.get(prefix) != Some(attrs) {
                    by_attrs.entry(attrs.clone()).or_default().push(prefix.clone());
                }
            }

            for (attrs, prefixes) in by_attrs {
                let resolved_attrs = substitute_any_next_hop(attrs, local_peer_addr);
                let message = if family == AddressFamily::IPV4_UNICAST {
                    let withdrawn_routes = if !withdrawals_sent {
                        withdrawals_sent = true;
                        withdrawals.clone()
                    } else {
                        vec![]
                    };
                    Message::Update(UpdateMessage {
                        withdrawn_routes,
                        path_attributes: resolved_attrs.attrs().to_vec(),
                        nlri: prefixes,
                    })
                } else {
                    let mut attrs_with_mp = resolved_attrs.attrs().to_vec();
                    attrs_with_mp.push(Attribute::MpReachNlri {
                        afi: family.afi,
                        safi: family.safi,
                        next_hop: local_peer_addr.octets().to_vec(),
                        nlri: prefixes,
                    });
                    if !withdrawals_sent && !withdrawals.is_empty() {
                        withdrawals_sent = true;
                        attrs_with_mp.push(Attribute::MpUnreachNlri {
                            afi: family.afi,
                            safi: family.safi,
                            withdrawn: withdrawals.clone(),
                        });
                    }
                    Message::Update(UpdateMessage {
                        withdrawn_routes: vec![],
                        path_attributes: attrs_with_mp,
                        nlri: vec![],
                    })
                };
                messages.push(message);
            }

            // Pure withdrawal with nothing to announce in this family.
            if !withdrawals.is_empty() && !withdrawals_sent {
                withdrawals_sent = true;
                let message = if family == AddressFamily::IPV4_UNICAST {
                    Message::Update(UpdateMessage {
                        withdrawn_routes: withdrawals,
                        path_attributes: vec![],
                        nlri: vec![],
                    })
                } else {
                    Message::Update(UpdateMessage {
                        withdrawn_routes: vec![],
                        path_attributes: vec![Attribute::MpUnreachNlri {
                            afi: family.afi,
                            safi: family.safi,
                            withdrawn: withdrawals,
                        }],
                        nlri: vec![],
                    })
                };
                messages.push(message);
            }
        }

        messages
    }

    pub fn commit(&mut self) {
        self.advertised = self.to_advertise.clone();
    }
}

fn substitute_any_next_hop(attrs: AttributeSet, local_addr: Ipv4Addr) -> AttributeSet {
    let resolved: Vec<Attribute> = attrs
        .attrs()
        .iter()
        .map(|a| match a {
            Attribute::NextHop(NextHopValue::Any) => Attribute::NextHop(NextHopValue::Explicit(local_addr)),
            other => other.clone(),
        })
        .collect();
    AttributeSet::new(resolved)
}

pub struct PeerConfig {
    pub peer_addr: IpAddr,
    pub local_asn: u16,
    pub local_bgp_id: Ipv4Addr,
    pub local_hold_time: u16,
}

pub enum PeerCommand {
    SetAdvertisements(Vec<Advertisement>),
    InboundConnection(TcpStream),
    Shutdown,
}

/// Runs one peer's session for its whole lifetime: connects, negotiates,
/// and re-establishes on failure, applying the outbound side of the FSM. An
/// inbound connection delivered via `PeerCommand::InboundConnection` is
/// compared against the active outbound attempt using the same collision
/// rule the FSM spec describes; losing side is closed immediately.
pub struct PeerActor {
    config: PeerConfig,
    fsm: Fsm,
    timers: TimerSet,
    engine: AnnouncementEngine,
    active_conn: Option<Framed<TcpStream, BgpCodec>>,
}

impl PeerActor {
    pub fn new(config: PeerConfig) -> Self {
        let fsm = Fsm::new(config.local_bgp_id, config.local_hold_time);
        let mut timers = TimerSet::with_defaults();
        timers.hold_time = Duration::from_secs(config.local_hold_time as u64);
        timers.keepalive_time = Duration::from_secs(config.local_hold_time as u64 / 3);
        Self {
            config,
            fsm,
            timers,
            engine: AnnouncementEngine::default(),
            active_conn: None,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<PeerCommand>) {
        let actions = self.fsm.handle_event(FsmEvent::AutoStart { idle_hold: false });
        self.apply_actions(actions).await;

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(PeerCommand::SetAdvertisements(desired)) => self.handle_set_advertisements(desired).await,
                        Some(PeerCommand::InboundConnection(stream)) => self.handle_inbound(stream).await,
                        Some(PeerCommand::Shutdown) | None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }
                frame = recv_frame(&mut self.active_conn) => {
                    self.handle_frame(frame).await;
                }
                _ = &mut self.timers.connect_retry => {
                    let actions = self.fsm.handle_event(FsmEvent::ConnectRetryTimerExpires);
                    self.apply_actions(actions).await;
                }
                _ = &mut self.timers.hold => {
                    let actions = self.fsm.handle_event(FsmEvent::HoldTimerExpires);
                    self.apply_actions(actions).await;
                }
                _ = &mut self.timers.keepalive => {
                    let actions = self.fsm.handle_event(FsmEvent::KeepAliveTimerExpires);
                    self.apply_actions(actions).await;
                }
                _ = &mut self.timers.delay_open => {
                    let actions = self.fsm.handle_event(FsmEvent::DelayOpenTimerExpires);
                    self.apply_actions(actions).await;
                }
                _ = &mut self.timers.idle_hold => {
                    let actions = self.fsm.handle_event(FsmEvent::IdleHoldTimerExpires);
                    self.apply_actions(actions).await;
                }
            }
        }
    }

    /// Attempts the outbound TCP connection and feeds the result back into
    /// the FSM as `TcpConnectionConfirmed`/`TcpConnectionFails`, applying
    /// whatever actions that produces (arming the OPEN-wait hold timer,
    /// sending OPEN) instead of short-circuiting them here.
    async fn try_connect(&mut self) {
        let addr = SocketAddr::new(self.config.peer_addr, BGP_PORT);
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                self.active_conn = Some(Framed::new(stream, BgpCodec));
                let actions = self.fsm.handle_event(FsmEvent::TcpConnectionConfirmed);
                self.apply_actions(actions).await;
            }
            Err(e) => {
                warn!(peer = %self.config.peer_addr, error = %e, "BGP outbound connect failed");
                let actions = self.fsm.handle_event(FsmEvent::TcpConnectionFails);
                self.apply_actions(actions).await;
            }
        }
    }

    async fn handle_inbound(&mut self, stream: TcpStream) {
        let is_collision = self.active_conn.is_some();
        if is_collision {
            let sibling_established = self.fsm.state == FsmState::Established;
            let should_close_inbound = !should_close_on_collision(
                self.config.local_bgp_id,
                self.fsm.peer_bgp_id.unwrap_or(Ipv4Addr::UNSPECIFIED),
                sibling_established,
                true,
            );
            if should_close_inbound {
                info!(peer = %self.config.peer_addr, "dropping inbound BGP connection: collision lost");
                return;
            }
            info!(peer = %self.config.peer_addr, "inbound BGP connection wins collision, replacing outbound");
            let actions = self.fsm.handle_event(FsmEvent::OpenCollisionDump);
            self.apply_actions(actions).await;
        }
        self.active_conn = Some(Framed::new(stream, BgpCodec));
        let actions = self.fsm.handle_event(FsmEvent::TcpConnectionConfirmed);
        self.apply_actions(actions).await;
    }

    async fn handle_frame(&mut self, frame: Option<Result<Message, ControlPlaneError>>) {
        let Some(result) = frame else { return };
        match result {
            Ok(Message::Open(open)) => {
                let actions = self.fsm.handle_event(FsmEvent::BgpOpenReceived(open));
                self.apply_actions(actions).await;
            }
            Ok(Message::Keepalive) => {
                let actions = self.fsm.handle_event(FsmEvent::KeepAliveMsgReceived);
                self.apply_actions(actions).await;
            }
            Ok(Message::Update(_)) => {
                let actions = self.fsm.handle_event(FsmEvent::UpdateMsgReceived);
                self.apply_actions(actions).await;
            }
            Ok(Message::Notification(n, _)) => {
                let actions = self.fsm.handle_event(FsmEvent::NotificationReceived(n));
                self.apply_actions(actions).await;
            }
            Err(e) => {
                warn!(peer = %self.config.peer_addr, error = %e, "BGP connection error, closing");
                self.active_conn = None;
                let actions = self.fsm.handle_event(FsmEvent::TcpConnectionFails);
                self.apply_actions(actions).await;
            }
        }
    }

    /// Applies FSM actions in order, including the timer arm/cancel actions
    /// that `TimerSet` backs. `RequestAutoStartWithoutIdleHold` re-enters the
    /// FSM and queues whatever actions that follow-up event produces, rather
    /// than recursing.
    async fn apply_actions(&mut self, actions: Vec<FsmAction>) {
        let mut queue: VecDeque<FsmAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                FsmAction::ArmConnectRetry => self.timers.connect_retry.arm(self.timers.connect_retry_time),
                FsmAction::CancelConnectRetry => self.timers.connect_retry.cancel(),
                FsmAction::ArmDelayOpen => self.timers.delay_open.arm(self.timers.delay_open_time),
                FsmAction::CancelDelayOpen => self.timers.delay_open.cancel(),
                FsmAction::ArmIdleHold => self.timers.idle_hold.arm(self.timers.idle_hold_time),
                FsmAction::ArmKeepaliveAndHold { negotiated_hold } => {
                    self.timers.negotiate_hold_time(negotiated_hold);
                }
                FsmAction::ArmLargeHold => {
                    self.timers.hold.arm(std::time::Duration::from_secs(timers::DEFAULT_LARGE_HOLD_SECS));
                }
                FsmAction::ResetHoldTimer => {
                    if !self.timers.hold_time.is_zero() {
                        self.timers.hold.arm(self.timers.hold_time);
                    }
                }
                FsmAction::SendKeepalive => {
                    self.send(Message::Keepalive).await;
                    if !self.timers.hold_time.is_zero() {
                        self.timers.keepalive.arm(self.timers.keepalive_time);
                    }
                }
                FsmAction::SendOpen => {
                    let open = self.build_open();
                    self.send(Message::Open(open)).await;
                }
                FsmAction::SendNotification(n, data) => {
                    self.send(Message::Notification(n, data)).await;
                    self.active_conn = None;
                    self.timers.cancel_all();
                }
                FsmAction::InitiateTcp => Box::pin(self.try_connect()).await,
                FsmAction::CloseTcp => self.active_conn = None,
                FsmAction::SignalEstablished => {
                    info!(peer = %self.config.peer_addr, "BGP session established");
                    self.flush_advertisements().await;
                }
                FsmAction::SignalUpdate(_) => {}
                FsmAction::IncrementConnectRetryCounter => self.fsm.connect_retry_counter += 1,
                FsmAction::RequestAutoStartWithoutIdleHold => {
                    let follow_up = self.fsm.handle_event(FsmEvent::AutoStart { idle_hold: false });
                    queue.extend(follow_up);
                }
            }
        }
    }

    async fn handle_set_advertisements(&mut self, desired: Vec<Advertisement>) {
        self.engine.set_advertisements(desired);
        if self.fsm.state == FsmState::Established {
            self.flush_advertisements().await;
        }
    }

    async fn flush_advertisements(&mut self) {
        let local_peer_addr = match self.config.peer_addr {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => self.config.local_bgp_id,
        };
        let messages = self.engine.build_update_messages(local_peer_addr);
        let mut all_sent = true;
        for message in messages {
            if !self.send(message).await {
                all_sent = false;
                break;
            }
        }
        if all_sent {
            self.engine.commit();
        }
    }

    async fn send(&mut self, message: Message) -> bool {
        match self.active_conn.as_mut() {
            Some(conn) => conn.send(message).await.is_ok(),
            None => false,
        }
    }

    fn build_open(&self) -> OpenMessage {
        OpenMessage {
            version: super::message::BGP_VERSION,
            my_asn: self.config.local_asn,
            hold_time: self.config.local_hold_time,
            bgp_identifier: self.config.local_bgp_id,
            optional_parameters: vec![
                OptionalParameter::multiprotocol(AddressFamily::IPV4_UNICAST.afi, AddressFamily::IPV4_UNICAST.safi),
                OptionalParameter::multiprotocol(AddressFamily::IPV6_UNICAST.afi, AddressFamily::IPV6_UNICAST.safi),
            ],
        }
    }

    async fn shutdown(&mut self) {
        self.engine.set_advertisements(vec![]);
        self.flush_advertisements().await;
        if self.active_conn.is_some() {
            self.send(Message::Notification(
                NotificationMessage { error: crate::core::errors::BgpNotification::CEASE, suberror: 0 },
                vec![],
            ))
            .await;
        }
        self.active_conn = None;
        self.timers.cancel_all();
    }
}

async fn recv_frame(conn: &mut Option<Framed<TcpStream, BgpCodec>>) -> Option<Result<Message, ControlPlaneError>> {
    match conn {
        Some(framed) => framed.next().await,
        None => std::future::pending().await,
    }
}

pub fn spawn(config: PeerConfig) -> mpsc::Sender<PeerCommand> {
    let (tx, rx) = mpsc::channel(64);
    let actor = PeerActor::new(config);
    tokio::spawn(actor.run(rx));
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bgp::attribute::Origin;
    use std::net::Ipv4Addr;

    fn prefix(a: u8, b: u8, c: u8, len: u8) -> Prefix {
        Prefix::from_ipv4(Ipv4Addr::new(a, b, c, 0), len)
    }

    fn basic_attrs() -> AttributeSet {
        AttributeSet::new(vec![
            Attribute::Origin(Origin::Igp),
            Attribute::AsPath(vec![]),
            Attribute::NextHop(NextHopValue::Any),
        ])
    }

    #[test]
    fn new_advertisement_produces_one_update_with_nlri() {
        let mut engine = AnnouncementEngine::default();
        engine.set_advertisements(vec![Advertisement {
            family: AddressFamily::IPV4_UNICAST,
            prefix: prefix(10, 0, 0, 24),
            attrs: basic_attrs(),
        }]);
        let messages = engine.build_update_messages(Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Message::Update(u) => {
                assert_eq!(u.nlri.len(), 1);
                assert!(u.withdrawn_routes.is_empty());
            }
            _ => panic!("expected UPDATE"),
        }
    }

    #[test]
    fn removed_prefix_produces_withdrawal() {
        let mut engine = AnnouncementEngine::default();
        engine.set_advertisements(vec![Advertisement {
            family: AddressFamily::IPV4_UNICAST,
            prefix: prefix(10, 0, 0, 24),
            attrs: basic_attrs(),
        }]);
        engine.commit();
        engine.set_advertisements(vec![]);
        let messages = engine.build_update_messages(Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Message::Update(u) => assert_eq!(u.withdrawn_routes.len(), 1),
            _ => panic!("expected UPDATE"),
        }
    }

    #[test]
    fn any_next_hop_is_substituted_with_local_peer_address() {
        let mut engine = AnnouncementEngine::default();
        engine.set_advertisements(vec![Advertisement {
            family: AddressFamily::IPV4_UNICAST,
            prefix: prefix(10, 0, 0, 24),
            attrs: basic_attrs(),
        }]);
        let local = Ipv4Addr::new(192, 0, 2, 1);
        let messages = engine.build_update_messages(local);
        match &messages[0] {
            Message::Update(u) => {
                let nh = u.path_attributes.iter().find_map(|a| match a {
                    Attribute::NextHop(NextHopValue::Explicit(ip)) => Some(*ip),
                    _ => None,
                });
                assert_eq!(nh, Some(local));
            }
            _ => panic!("expected UPDATE"),
        }
    }
}
