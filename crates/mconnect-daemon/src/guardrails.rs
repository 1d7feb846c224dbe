//! Pluggable command-content policy.
//!
//! The hub consults the policy before forwarding an input that ends in a
//! line terminator. A blocked command is dropped and announced to the
//! session; a command requiring approval is held until any authorized
//! client resolves it. The daemon ships a permissive default; real policies
//! plug in behind the trait.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Verdict for one command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyDecision {
    pub blocked: bool,
    pub requires_approval: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self::default()
    }
}

/// Command-content policy contract.
pub trait CommandPolicy: Send + Sync {
    fn check(&self, command: &str) -> PolicyDecision;
}

/// Default policy: everything passes.
pub struct AllowAllPolicy;

impl CommandPolicy for AllowAllPolicy {
    fn check(&self, _command: &str) -> PolicyDecision {
        PolicyDecision::allow()
    }
}

/// An input held pending approval.
#[derive(Debug, Clone)]
pub struct HeldInput {
    pub session_id: String,
    pub client_id: String,
    pub data: String,
}

/// Table of inputs awaiting an `approval_response`.
#[derive(Default)]
pub struct PendingApprovals {
    held: Mutex<HashMap<String, HeldInput>>,
}

impl PendingApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HeldInput>> {
        match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Hold an input; returns the approval id to broadcast.
    pub fn hold(&self, session_id: &str, client_id: &str, data: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.lock().insert(
            id.clone(),
            HeldInput {
                session_id: session_id.to_string(),
                client_id: client_id.to_string(),
                data: data.to_string(),
            },
        );
        id
    }

    /// Resolve a held input. Returns it for forwarding when approved; a
    /// denial just drops it. Unknown ids return `None`.
    pub fn resolve(&self, approval_id: &str, approved: bool) -> Option<HeldInput> {
        let held = self.lock().remove(approval_id)?;
        if approved { Some(held) } else { None }
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}
