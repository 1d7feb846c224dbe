//! Per-session input arbitration.
//!
//! A state machine over client priorities that decides, synchronously, which
//! client's input reaches the PTY. Decisions never fail; rejections carry
//! explicit reason codes. All methods take `now_ms` so timer-driven
//! transitions (idle, grace, exclusive expiry) are deterministic under test.

mod priority;
mod rate;

use std::collections::HashMap;

use mconnect_protocol::{ClientType, Priority};
use tracing::debug;

use rate::RateWindow;

/// Arbitration tunables, a slice of the daemon configuration.
#[derive(Debug, Clone, Copy)]
pub struct ArbiterConfig {
    pub pc_idle_threshold_ms: u64,
    pub mobile_grace_period_ms: u64,
    pub exclusive_timeout_ms: u64,
    pub conflict_window_ms: u64,
    pub input_rate_limit_cps: usize,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            pc_idle_threshold_ms: 30_000,
            mobile_grace_period_ms: 5_000,
            exclusive_timeout_ms: 300_000,
            conflict_window_ms: 100,
            input_rate_limit_cps: 100,
        }
    }
}

/// Derived control state for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    PcDisconnected,
    PcActive,
    PcIdle,
    MobileExclusive,
}

impl ControlState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlState::PcDisconnected => "pc_disconnected",
            ControlState::PcActive => "pc_active",
            ControlState::PcIdle => "pc_idle",
            ControlState::MobileExclusive => "mobile_exclusive",
        }
    }
}

impl std::fmt::Display for ControlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason codes for rejected inputs, as sent to the submitting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    PcTyping,
    OtherExclusive,
    AlreadyExclusive,
    RateLimited,
    Observer,
    NotRegistered,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::PcTyping => "pc_typing",
            RejectReason::OtherExclusive => "other_exclusive",
            RejectReason::AlreadyExclusive => "already_exclusive",
            RejectReason::RateLimited => "rate_limited",
            RejectReason::Observer => "observer",
            RejectReason::NotRegistered => "not_registered",
        }
    }
}

/// Outcome of an input submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accepted,
    Rejected(RejectReason),
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Decision::Accepted)
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Decision::Accepted => None,
            Decision::Rejected(reason) => Some(*reason),
        }
    }
}

/// Snapshot of the derived control state, broadcast as `control_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlStatus {
    pub state: ControlState,
    pub active_client: Option<String>,
    pub exclusive_expires_ms: Option<u64>,
    pub last_pc_activity_ms: Option<u64>,
}

/// Events produced by state-affecting calls, for the hub to relay and audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    StateChanged { status: ControlStatus },
    Idle { client_id: String, client_type: ClientType },
    Active { client_id: String, client_type: ClientType },
    ExclusiveGranted { client_id: String, expires_at_ms: u64 },
    ExclusiveReleased { client_id: String, timed_out: bool },
}

/// Result of an exclusive-control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusiveOutcome {
    pub granted: bool,
    pub reason: Option<RejectReason>,
    pub expires_at_ms: Option<u64>,
}

/// A client as seen by the arbiter.
#[derive(Debug, Clone)]
pub struct ArbiterClient {
    pub id: String,
    pub client_type: ClientType,
    pub priority: Priority,
    pub joined_at_ms: u64,
    last_activity_ms: u64,
    last_accepted_ms: Option<u64>,
    idle: bool,
    grace_until_ms: Option<u64>,
    rate: RateWindow,
}

impl ArbiterClient {
    pub(crate) fn new(
        id: String,
        client_type: ClientType,
        priority: Priority,
        joined_at_ms: u64,
    ) -> Self {
        Self {
            id,
            client_type,
            priority,
            joined_at_ms,
            last_activity_ms: joined_at_ms,
            last_accepted_ms: None,
            idle: false,
            grace_until_ms: None,
            rate: RateWindow::new(),
        }
    }

    fn is_pc(&self) -> bool {
        self.client_type == ClientType::Pc
    }

    fn counts_for_presence(&self) -> bool {
        self.priority != Priority::Observer
    }
}

/// The per-session arbiter.
pub struct InputArbiter {
    session_id: String,
    config: ArbiterConfig,
    clients: HashMap<String, ArbiterClient>,
    state: ControlState,
    prev_state: ControlState,
    state_entered_ms: u64,
    exclusive_owner: Option<String>,
    exclusive_expires_ms: Option<u64>,
    last_pc_activity_ms: Option<u64>,
}

impl InputArbiter {
    pub fn new(session_id: String, config: ArbiterConfig, now_ms: u64) -> Self {
        Self {
            session_id,
            config,
            clients: HashMap::new(),
            state: ControlState::PcDisconnected,
            prev_state: ControlState::PcDisconnected,
            state_entered_ms: now_ms,
            exclusive_owner: None,
            exclusive_expires_ms: None,
            last_pc_activity_ms: None,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client_priority(&self, client_id: &str) -> Option<Priority> {
        self.clients.get(client_id).map(|c| c.priority)
    }

    /// Current derived status for `control_status` broadcasts.
    pub fn status(&self) -> ControlStatus {
        let active_client = match self.state {
            ControlState::MobileExclusive => self.exclusive_owner.clone(),
            _ => priority::active_owner(self.clients.values()).map(|c| c.id.clone()),
        };
        ControlStatus {
            state: self.state,
            active_client,
            exclusive_expires_ms: self.exclusive_expires_ms,
            last_pc_activity_ms: self.last_pc_activity_ms,
        }
    }

    /// Register a client. PC presence recomputes the state.
    pub fn register_client(
        &mut self,
        client_id: &str,
        client_type: ClientType,
        priority: Priority,
        now_ms: u64,
    ) -> Vec<ControlEvent> {
        let mut events = Vec::new();
        self.clients.insert(
            client_id.to_string(),
            ArbiterClient::new(client_id.to_string(), client_type, priority, now_ms),
        );
        debug!(
            event = "daemon.arbiter.client_registered",
            session_id = %self.session_id,
            client_id = client_id,
            client_type = %client_type,
            priority = %priority,
        );
        self.apply_state(now_ms, &mut events);
        events
    }

    /// Remove a client. Releases exclusive control if it held it.
    pub fn unregister_client(&mut self, client_id: &str, now_ms: u64) -> Vec<ControlEvent> {
        let mut events = Vec::new();
        if self.clients.remove(client_id).is_some() {
            debug!(
                event = "daemon.arbiter.client_unregistered",
                session_id = %self.session_id,
                client_id = client_id,
            );
        }
        if self.exclusive_owner.as_deref() == Some(client_id) {
            self.exclusive_owner = None;
            self.exclusive_expires_ms = None;
            events.push(ControlEvent::ExclusiveReleased {
                client_id: client_id.to_string(),
                timed_out: false,
            });
        }
        self.apply_state(now_ms, &mut events);
        events
    }

    /// Submit input of `len` bytes from a client. Synchronous; never fails.
    pub fn submit_input(
        &mut self,
        client_id: &str,
        len: usize,
        now_ms: u64,
    ) -> (Decision, Vec<ControlEvent>) {
        let mut events = self.tick(now_ms);

        let limit = self.config.input_rate_limit_cps;
        let Some(client) = self.clients.get_mut(client_id) else {
            return (Decision::Rejected(RejectReason::NotRegistered), events);
        };

        client.last_activity_ms = now_ms;
        if client.idle {
            client.idle = false;
            events.push(ControlEvent::Active {
                client_id: client.id.clone(),
                client_type: client.client_type,
            });
        }
        let is_pc = client.is_pc();
        if is_pc && client.counts_for_presence() {
            self.last_pc_activity_ms = Some(now_ms);
        }

        if client.priority == Priority::Observer {
            self.apply_state(now_ms, &mut events);
            return (Decision::Rejected(RejectReason::Observer), events);
        }

        if !client.rate.try_consume(len, limit, now_ms) {
            self.apply_state(now_ms, &mut events);
            return (Decision::Rejected(RejectReason::RateLimited), events);
        }

        let decision = match self.state {
            ControlState::MobileExclusive => {
                if self.exclusive_owner.as_deref() == Some(client_id) {
                    Decision::Accepted
                } else {
                    Decision::Rejected(RejectReason::OtherExclusive)
                }
            }
            ControlState::PcDisconnected | ControlState::PcIdle => Decision::Accepted,
            ControlState::PcActive => {
                if is_pc {
                    Decision::Accepted
                } else {
                    let client = &self.clients[client_id];
                    let in_grace = client.grace_until_ms.is_some_and(|g| g > now_ms);
                    // An input racing the PC keystroke that flipped the state
                    // is still honored within the conflict window.
                    let in_conflict_window = now_ms.saturating_sub(self.state_entered_ms)
                        <= self.config.conflict_window_ms
                        && matches!(
                            self.prev_state,
                            ControlState::PcIdle | ControlState::PcDisconnected
                        );
                    if in_grace || in_conflict_window {
                        Decision::Accepted
                    } else {
                        Decision::Rejected(RejectReason::PcTyping)
                    }
                }
            }
        };

        if decision.is_accepted() {
            if let Some(client) = self.clients.get_mut(client_id) {
                client.last_accepted_ms = Some(now_ms);
            }
        }

        self.apply_state(now_ms, &mut events);
        (decision, events)
    }

    /// Request exclusive control. Mobile clients only; time-bounded.
    pub fn request_exclusive(
        &mut self,
        client_id: &str,
        now_ms: u64,
    ) -> (ExclusiveOutcome, Vec<ControlEvent>) {
        let mut events = self.tick(now_ms);

        fn denied(reason: RejectReason) -> ExclusiveOutcome {
            ExclusiveOutcome {
                granted: false,
                reason: Some(reason),
                expires_at_ms: None,
            }
        }

        let Some(client) = self.clients.get(client_id) else {
            return (denied(RejectReason::NotRegistered), events);
        };
        if client.priority == Priority::Observer {
            return (denied(RejectReason::Observer), events);
        }
        if client.client_type != ClientType::Mobile {
            // Only mobile clients may take exclusive control.
            return (denied(RejectReason::OtherExclusive), events);
        }
        if self.state == ControlState::MobileExclusive {
            let reason = if self.exclusive_owner.as_deref() == Some(client_id) {
                RejectReason::AlreadyExclusive
            } else {
                RejectReason::OtherExclusive
            };
            return (denied(reason), events);
        }

        let expires = now_ms + self.config.exclusive_timeout_ms;
        self.exclusive_owner = Some(client_id.to_string());
        self.exclusive_expires_ms = Some(expires);
        if let Some(client) = self.clients.get_mut(client_id) {
            client.priority = Priority::Exclusive;
            client.last_activity_ms = now_ms;
        }
        events.push(ControlEvent::ExclusiveGranted {
            client_id: client_id.to_string(),
            expires_at_ms: expires,
        });
        self.apply_state(now_ms, &mut events);

        (
            ExclusiveOutcome {
                granted: true,
                reason: None,
                expires_at_ms: Some(expires),
            },
            events,
        )
    }

    /// Release exclusive control (or the keyboard, which cancels any grace
    /// window). Returns whether an exclusive grant was actually released.
    pub fn release_exclusive(
        &mut self,
        client_id: &str,
        now_ms: u64,
    ) -> (bool, Vec<ControlEvent>) {
        let mut events = self.tick(now_ms);

        if let Some(client) = self.clients.get_mut(client_id) {
            client.grace_until_ms = None;
        }

        if self.exclusive_owner.as_deref() != Some(client_id) {
            return (false, events);
        }

        self.exclusive_owner = None;
        self.exclusive_expires_ms = None;
        if let Some(client) = self.clients.get_mut(client_id) {
            client.priority = Priority::Normal;
        }
        events.push(ControlEvent::ExclusiveReleased {
            client_id: client_id.to_string(),
            timed_out: false,
        });
        self.apply_state(now_ms, &mut events);
        (true, events)
    }

    /// Advance timers: exclusive expiry, idle detection, grace expiry.
    ///
    /// Must be called on the session's serialization domain so transitions
    /// stay atomic with submissions.
    pub fn tick(&mut self, now_ms: u64) -> Vec<ControlEvent> {
        let mut events = Vec::new();

        if let (Some(owner), Some(expires)) =
            (self.exclusive_owner.clone(), self.exclusive_expires_ms)
        {
            if now_ms >= expires {
                self.exclusive_owner = None;
                self.exclusive_expires_ms = None;
                if let Some(client) = self.clients.get_mut(&owner) {
                    client.priority = Priority::Normal;
                }
                events.push(ControlEvent::ExclusiveReleased {
                    client_id: owner,
                    timed_out: true,
                });
            }
        }

        let threshold = self.config.pc_idle_threshold_ms;
        for client in self.clients.values_mut() {
            let idle_now = now_ms.saturating_sub(client.last_activity_ms) >= threshold;
            if idle_now != client.idle {
                client.idle = idle_now;
                if idle_now {
                    events.push(ControlEvent::Idle {
                        client_id: client.id.clone(),
                        client_type: client.client_type,
                    });
                } else {
                    events.push(ControlEvent::Active {
                        client_id: client.id.clone(),
                        client_type: client.client_type,
                    });
                }
            }
            if client.grace_until_ms.is_some_and(|g| g <= now_ms) {
                client.grace_until_ms = None;
            }
        }

        self.apply_state(now_ms, &mut events);
        events
    }

    fn desired_state(&self) -> ControlState {
        if self.exclusive_owner.is_some() {
            return ControlState::MobileExclusive;
        }
        let mut has_pc = false;
        let mut has_active_pc = false;
        for client in self.clients.values() {
            if client.is_pc() && client.counts_for_presence() {
                has_pc = true;
                if !client.idle {
                    has_active_pc = true;
                }
            }
        }
        if !has_pc {
            ControlState::PcDisconnected
        } else if has_active_pc {
            ControlState::PcActive
        } else {
            ControlState::PcIdle
        }
    }

    fn apply_state(&mut self, now_ms: u64, events: &mut Vec<ControlEvent>) {
        let desired = self.desired_state();
        if desired == self.state {
            return;
        }

        // Entering pc_active from a mobile-permissive state grants a grace
        // window to mobiles that were mid-burst.
        if desired == ControlState::PcActive
            && matches!(
                self.state,
                ControlState::PcIdle | ControlState::PcDisconnected
            )
        {
            let grace = self.config.mobile_grace_period_ms;
            for client in self.clients.values_mut() {
                if client.client_type == ClientType::Mobile
                    && client
                        .last_accepted_ms
                        .is_some_and(|t| now_ms.saturating_sub(t) <= grace)
                {
                    client.grace_until_ms = Some(now_ms + grace);
                }
            }
        }

        debug!(
            event = "daemon.arbiter.state_changed",
            session_id = %self.session_id,
            from = %self.state,
            to = %desired,
        );
        self.prev_state = self.state;
        self.state = desired;
        self.state_entered_ms = now_ms;
        events.push(ControlEvent::StateChanged {
            status: self.status(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_000_000;

    fn arbiter() -> InputArbiter {
        InputArbiter::new("s1".to_string(), ArbiterConfig::default(), T0)
    }

    fn register_pc(arb: &mut InputArbiter, id: &str, now: u64) -> Vec<ControlEvent> {
        arb.register_client(id, ClientType::Pc, Priority::High, now)
    }

    fn register_mobile(arb: &mut InputArbiter, id: &str, now: u64) -> Vec<ControlEvent> {
        arb.register_client(id, ClientType::Mobile, Priority::Normal, now)
    }

    fn state_changes(events: &[ControlEvent]) -> Vec<ControlState> {
        events
            .iter()
            .filter_map(|e| match e {
                ControlEvent::StateChanged { status } => Some(status.state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_starts_pc_disconnected() {
        let arb = arbiter();
        assert_eq!(arb.state(), ControlState::PcDisconnected);
    }

    #[test]
    fn test_pc_register_and_disconnect_toggle_state() {
        let mut arb = arbiter();
        let events = register_pc(&mut arb, "pc1", T0);
        assert_eq!(state_changes(&events), vec![ControlState::PcActive]);

        let events = arb.unregister_client("pc1", T0 + 10);
        assert_eq!(state_changes(&events), vec![ControlState::PcDisconnected]);
    }

    #[test]
    fn test_mobile_accepted_when_pc_disconnected() {
        let mut arb = arbiter();
        register_mobile(&mut arb, "m1", T0);
        let (decision, _) = arb.submit_input("m1", 1, T0 + 10);
        assert!(decision.is_accepted());
    }

    #[test]
    fn test_pc_mobile_arbitration_scenario() {
        // Register PC then mobile; PC accepted, mobile rejected pc_typing;
        // after 30s of PC silence the state is pc_idle and mobile is accepted.
        let mut arb = arbiter();
        register_pc(&mut arb, "pc1", T0);
        register_mobile(&mut arb, "m1", T0);

        let (decision, _) = arb.submit_input("pc1", 1, T0 + 100);
        assert!(decision.is_accepted());

        let (decision, _) = arb.submit_input("m1", 1, T0 + 200);
        assert_eq!(
            decision.reject_reason(),
            Some(RejectReason::PcTyping),
            "mobile must be rejected while the PC is typing"
        );

        // 30 s with no PC activity
        let events = arb.tick(T0 + 100 + 30_000);
        assert_eq!(state_changes(&events), vec![ControlState::PcIdle]);

        let (decision, _) = arb.submit_input("m1", 1, T0 + 100 + 30_001);
        assert!(decision.is_accepted());
    }

    #[test]
    fn test_idle_boundary() {
        let mut arb = arbiter();
        register_pc(&mut arb, "pc1", T0);
        arb.submit_input("pc1", 1, T0);

        // threshold - 1 ms: still pc_active, no idle event
        let events = arb.tick(T0 + 29_999);
        assert!(events.is_empty());
        assert_eq!(arb.state(), ControlState::PcActive);

        // threshold + 1 ms: idle event has fired
        let events = arb.tick(T0 + 30_001);
        assert!(events.iter().any(|e| matches!(
            e,
            ControlEvent::Idle { client_id, .. } if client_id == "pc1"
        )));
        assert_eq!(arb.state(), ControlState::PcIdle);
    }

    #[test]
    fn test_pc_input_wakes_from_idle() {
        let mut arb = arbiter();
        register_pc(&mut arb, "pc1", T0);
        arb.tick(T0 + 30_000);
        assert_eq!(arb.state(), ControlState::PcIdle);

        let (decision, events) = arb.submit_input("pc1", 1, T0 + 31_000);
        assert!(decision.is_accepted());
        assert!(state_changes(&events).contains(&ControlState::PcActive));
    }

    #[test]
    fn test_mobile_grace_after_pc_returns() {
        let mut arb = arbiter();
        register_pc(&mut arb, "pc1", T0);
        register_mobile(&mut arb, "m1", T0);

        // PC goes idle; mobile is mid-burst.
        arb.tick(T0 + 30_000);
        assert_eq!(arb.state(), ControlState::PcIdle);
        let (decision, _) = arb.submit_input("m1", 1, T0 + 31_000);
        assert!(decision.is_accepted());

        // PC types again: state flips to pc_active but the mobile keeps a
        // 5-second grace window.
        let (_, events) = arb.submit_input("pc1", 1, T0 + 32_000);
        assert!(state_changes(&events).contains(&ControlState::PcActive));

        let (decision, _) = arb.submit_input("m1", 1, T0 + 33_000);
        assert!(decision.is_accepted(), "grace window input must be accepted");

        // After the grace window the mobile is rejected again.
        let (decision, _) = arb.submit_input("m1", 1, T0 + 37_100);
        assert_eq!(decision.reject_reason(), Some(RejectReason::PcTyping));
    }

    #[test]
    fn test_grace_cancelled_by_keyboard_release() {
        let mut arb = arbiter();
        register_pc(&mut arb, "pc1", T0);
        register_mobile(&mut arb, "m1", T0);

        arb.tick(T0 + 30_000);
        arb.submit_input("m1", 1, T0 + 31_000);
        arb.submit_input("pc1", 1, T0 + 31_500);

        // Mobile releases the keyboard: grace is cancelled.
        arb.release_exclusive("m1", T0 + 31_600);
        let (decision, _) = arb.submit_input("m1", 1, T0 + 31_700);
        assert_eq!(decision.reject_reason(), Some(RejectReason::PcTyping));
    }

    #[test]
    fn test_exclusive_control_scenario() {
        let mut arb = arbiter();
        register_pc(&mut arb, "pc1", T0);
        register_mobile(&mut arb, "m1", T0);
        arb.submit_input("pc1", 1, T0);

        // Mobile requests exclusive control from pc_active.
        let (outcome, events) = arb.request_exclusive("m1", T0 + 100);
        assert!(outcome.granted);
        assert_eq!(outcome.expires_at_ms, Some(T0 + 100 + 300_000));
        assert!(state_changes(&events).contains(&ControlState::MobileExclusive));
        assert_eq!(arb.client_priority("m1"), Some(Priority::Exclusive));

        // PC input is rejected with other_exclusive.
        let (decision, _) = arb.submit_input("pc1", 1, T0 + 200);
        assert_eq!(decision.reject_reason(), Some(RejectReason::OtherExclusive));

        // Owner's input is accepted.
        let (decision, _) = arb.submit_input("m1", 1, T0 + 300);
        assert!(decision.is_accepted());

        // After the 5-minute timeout the grant auto-releases and the PC can
        // type again.
        let events = arb.tick(T0 + 100 + 300_000);
        assert!(events.iter().any(|e| matches!(
            e,
            ControlEvent::ExclusiveReleased { timed_out: true, .. }
        )));
        assert_ne!(arb.state(), ControlState::MobileExclusive);
        assert_eq!(arb.client_priority("m1"), Some(Priority::Normal));

        let (decision, _) = arb.submit_input("pc1", 1, T0 + 100 + 300_001);
        assert!(decision.is_accepted());
    }

    #[test]
    fn test_second_exclusive_request_denied() {
        let mut arb = arbiter();
        register_mobile(&mut arb, "m1", T0);
        register_mobile(&mut arb, "m2", T0);

        let (outcome, _) = arb.request_exclusive("m1", T0);
        assert!(outcome.granted);

        let (outcome, _) = arb.request_exclusive("m1", T0 + 10);
        assert_eq!(outcome.reason, Some(RejectReason::AlreadyExclusive));

        let (outcome, _) = arb.request_exclusive("m2", T0 + 20);
        assert_eq!(outcome.reason, Some(RejectReason::OtherExclusive));
    }

    #[test]
    fn test_pc_cannot_request_exclusive() {
        let mut arb = arbiter();
        register_pc(&mut arb, "pc1", T0);
        let (outcome, _) = arb.request_exclusive("pc1", T0);
        assert!(!outcome.granted);
    }

    #[test]
    fn test_exclusive_roundtrip_restores_state() {
        let mut arb = arbiter();
        register_pc(&mut arb, "pc1", T0);
        register_mobile(&mut arb, "m1", T0);
        arb.submit_input("pc1", 1, T0);
        let before = arb.state();

        let (outcome, _) = arb.request_exclusive("m1", T0 + 10);
        assert!(outcome.granted);
        let (released, _) = arb.release_exclusive("m1", T0 + 20);
        assert!(released);

        assert_eq!(arb.state(), before);
        assert_eq!(arb.client_priority("m1"), Some(Priority::Normal));
    }

    #[test]
    fn test_unregister_owner_releases_exclusive() {
        let mut arb = arbiter();
        register_pc(&mut arb, "pc1", T0);
        register_mobile(&mut arb, "m1", T0);
        arb.submit_input("pc1", 1, T0);

        arb.request_exclusive("m1", T0 + 10);
        let events = arb.unregister_client("m1", T0 + 20);
        assert!(events.iter().any(|e| matches!(
            e,
            ControlEvent::ExclusiveReleased { timed_out: false, .. }
        )));
        assert_eq!(arb.state(), ControlState::PcActive);
    }

    #[test]
    fn test_observer_never_accepted() {
        let mut arb = arbiter();
        arb.register_client("obs", ClientType::Mobile, Priority::Observer, T0);
        let (decision, _) = arb.submit_input("obs", 1, T0 + 10);
        assert_eq!(decision.reject_reason(), Some(RejectReason::Observer));

        // Observers don't create PC presence either.
        arb.register_client("pc-obs", ClientType::Pc, Priority::Observer, T0);
        assert_eq!(arb.state(), ControlState::PcDisconnected);
    }

    #[test]
    fn test_rate_limit_boundary() {
        let mut arb = arbiter();
        register_mobile(&mut arb, "m1", T0);

        // Exactly at the cap: accepted.
        let (decision, _) = arb.submit_input("m1", 100, T0);
        assert!(decision.is_accepted());

        // One byte above within the same window: rejected, not forwarded.
        let (decision, _) = arb.submit_input("m1", 1, T0 + 500);
        assert_eq!(decision.reject_reason(), Some(RejectReason::RateLimited));

        // Window rolls over.
        let (decision, _) = arb.submit_input("m1", 100, T0 + 1_501);
        assert!(decision.is_accepted());
    }

    #[test]
    fn test_unknown_client_rejected() {
        let mut arb = arbiter();
        let (decision, _) = arb.submit_input("ghost", 1, T0);
        assert_eq!(decision.reject_reason(), Some(RejectReason::NotRegistered));
    }

    #[test]
    fn test_status_reports_owner_and_expiry() {
        let mut arb = arbiter();
        register_pc(&mut arb, "pc1", T0);
        register_mobile(&mut arb, "m1", T0);

        let status = arb.status();
        assert_eq!(status.state, ControlState::PcActive);
        // PC outranks mobile at default priorities.
        assert_eq!(status.active_client.as_deref(), Some("pc1"));
        assert!(status.exclusive_expires_ms.is_none());

        arb.request_exclusive("m1", T0 + 10);
        let status = arb.status();
        assert_eq!(status.state, ControlState::MobileExclusive);
        assert_eq!(status.active_client.as_deref(), Some("m1"));
        assert_eq!(status.exclusive_expires_ms, Some(T0 + 10 + 300_000));
    }

    #[test]
    fn test_conflict_window_honors_racing_mobile() {
        let mut arb = arbiter();
        register_pc(&mut arb, "pc1", T0);
        register_mobile(&mut arb, "m1", T0);

        arb.tick(T0 + 30_000);
        assert_eq!(arb.state(), ControlState::PcIdle);

        // PC keystroke flips to pc_active...
        arb.submit_input("pc1", 1, T0 + 40_000);
        // ...and a mobile input that was already in flight lands 50 ms later.
        let (decision, _) = arb.submit_input("m1", 1, T0 + 40_050);
        assert!(
            decision.is_accepted(),
            "input within the conflict window is honored"
        );

        // Past the window (and with no grace from a recent burst) it is not.
        let (decision, _) = arb.submit_input("m1", 1, T0 + 40_500);
        assert_eq!(decision.reject_reason(), Some(RejectReason::PcTyping));
    }
}
