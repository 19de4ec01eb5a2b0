//! Approval policy and decision brokering
//!
//! Holds the per-session auto-approval state (tools remembered as
//! "always allow" for this session, plus the static read-only
//! allowlist) and brokers the one asynchronous decision per request:
//! answer immediately from policy, or defer to an external decision
//! surface and await its single answer.
//!
//! The reply path is a one-shot channel with a consumed-on-resolve
//! sender, so "resolved twice" is unrepresentable and "never resolved"
//! (surface torn down) collapses into the denial default — the terminal
//! is never left silently stalled on a decision nobody will make.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::mpsc;

use crate::log::log_warn;
use crate::parse::ToolUseRequest;

/// Tools auto-approved when PTYGATE_AUTO_READONLY is enabled.
pub const READ_ONLY_TOOLS: &[&str] = &["Read", "Glob", "Grep", "WebSearch", "WebFetch"];

/// The human's (or policy's) answer to one ToolUseRequest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub remember: bool,
}

impl ApprovalDecision {
    pub fn approved() -> Self {
        Self {
            approved: true,
            remember: false,
        }
    }

    pub fn denied() -> Self {
        Self {
            approved: false,
            remember: false,
        }
    }

    /// The single byte injected into the agent's stdin. No trailing
    /// newline — the agent reads one raw character.
    pub fn reply_byte(&self) -> u8 {
        if self.approved { b'y' } else { b'n' }
    }
}

/// One-shot resolution handle for a pending decision.
///
/// Resolving consumes the sender, so at most one answer ever lands.
/// Dropping an unresolved reply disconnects the receiver, which the
/// awaiting side reads as denial.
pub struct DecisionReply {
    tx: Option<mpsc::SyncSender<ApprovalDecision>>,
}

impl DecisionReply {
    /// Create a reply handle and the receiver that awaits it.
    pub fn channel() -> (Self, mpsc::Receiver<ApprovalDecision>) {
        let (tx, rx) = mpsc::sync_channel(1);
        (Self { tx: Some(tx) }, rx)
    }

    /// Resolve the pending decision. Returns false if already resolved
    /// or if the awaiting side is gone.
    pub fn resolve(&mut self, decision: ApprovalDecision) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }
}

/// An external source of decisions. Receives the request and a reply
/// handle; answering later (or never) is the surface's business.
pub trait DecisionSurface {
    fn submit(&mut self, request: &ToolUseRequest, reply: DecisionReply);
}

/// Per-session approval state. Cleared on session restart; sessions
/// never share one.
pub struct ApprovalCoordinator {
    remembered: HashSet<String>,
    auto_approve_readonly: bool,
}

impl ApprovalCoordinator {
    pub fn new(auto_approve_readonly: bool) -> Self {
        Self {
            remembered: HashSet::new(),
            auto_approve_readonly,
        }
    }

    /// Policy-only check: remembered tools, then the read-only
    /// allowlist. None means the decision must come from outside.
    pub fn policy_decision(&self, request: &ToolUseRequest) -> Option<ApprovalDecision> {
        if self.remembered.contains(&request.tool_name) {
            return Some(ApprovalDecision::approved());
        }
        if self.auto_approve_readonly && READ_ONLY_TOOLS.contains(&request.tool_name.as_str()) {
            return Some(ApprovalDecision::approved());
        }
        None
    }

    /// Record a surface decision, updating the remembered set when the
    /// human asked not to be re-prompted this session.
    pub fn record(&mut self, request: &ToolUseRequest, decision: &ApprovalDecision) {
        if decision.remember {
            self.remembered.insert(request.tool_name.clone());
        }
    }

    /// Clear per-session state (new session / restart).
    pub fn reset_session(&mut self) {
        self.remembered.clear();
    }

    /// Obtain exactly one decision for the request: policy first, then
    /// the surface. Blocks until the surface answers; if the surface is
    /// torn down before answering, resolves with denial.
    pub fn decide(
        &mut self,
        request: &ToolUseRequest,
        surface: &mut dyn DecisionSurface,
    ) -> ApprovalDecision {
        if let Some(decision) = self.policy_decision(request) {
            return decision;
        }

        let (reply, rx) = DecisionReply::channel();
        surface.submit(request, reply);
        match rx.recv() {
            Ok(decision) => {
                self.record(request, &decision);
                decision
            }
            Err(mpsc::RecvError) => {
                log_warn(
                    "approval",
                    "surface.teardown",
                    &format!("decision surface closed; denying {}", request.summary),
                );
                ApprovalDecision::denied()
            }
        }
    }
}
