//! Role declarations and the authorization decision.
//!
//! `decide` is pure. Precedence is fixed: unknown role, unknown action,
//! prohibited, authorized, and finally the closed-world default deny.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, KernelError};

/// Static declaration of what a role may and may never do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub authority: BTreeSet<String>,
    pub prohibited: BTreeSet<String>,
}

impl Role {
    pub fn new(name: &str, authority: &[&str], prohibited: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            authority: authority.iter().map(|a| a.to_string()).collect(),
            prohibited: prohibited.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionCode {
    UnknownRole,
    UnknownAction,
    Prohibited,
    Authorized,
    NotAuthorized,
}

impl DecisionCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            DecisionCode::UnknownRole => "unknown_role",
            DecisionCode::UnknownAction => "unknown_action",
            DecisionCode::Prohibited => "prohibited",
            DecisionCode::Authorized => "authorized",
            DecisionCode::NotAuthorized => "not_authorized",
        }
    }
}

/// `{allow, reason}` as handed to downstream callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allow: bool,
    pub code: DecisionCode,
    pub reason: String,
}

impl Decision {
    fn allow(role: &str, action: &str) -> Self {
        Self {
            allow: true,
            code: DecisionCode::Authorized,
            reason: format!("allow:authorized:{role}:{action}"),
        }
    }

    fn deny(code: DecisionCode, detail: String) -> Self {
        Self {
            allow: false,
            code,
            reason: format!("deny:{}:{detail}", code.as_str()),
        }
    }

    /// Convert a denial into a kernel refusal; `None` when allowed.
    pub fn into_denial(self) -> Option<KernelError> {
        let kind = match self.code {
            DecisionCode::Authorized => return None,
            DecisionCode::UnknownRole => ErrorKind::UnknownRole,
            DecisionCode::UnknownAction => ErrorKind::UnknownAction,
            DecisionCode::Prohibited => ErrorKind::Prohibited,
            DecisionCode::NotAuthorized => ErrorKind::NotAuthorized,
        };
        Some(KernelError::PolicyDenied {
            kind,
            reason: self.reason,
        })
    }
}

/// The set of declared roles plus the action universe they imply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoleRegistry {
    roles: BTreeMap<String, Role>,
    actions: BTreeSet<String>,
}

impl RoleRegistry {
    pub fn new(roles: impl IntoIterator<Item = Role>) -> Self {
        let mut registry = Self::default();
        for role in roles {
            registry
                .actions
                .extend(role.authority.iter().chain(role.prohibited.iter()).cloned());
            registry.roles.insert(role.name.clone(), role);
        }
        registry
    }

    /// Built-in role set.
    pub fn canonical() -> Self {
        Self::new([
            Role::new(
                "morpheus",
                &["architecture", "verification", "protocol_enforcement"],
                &["code_execution", "network_calls", "state_mutation"],
            ),
            Role::new(
                "scout",
                &["external_research", "source_collection"],
                &["local_execution", "state_mutation", "unauthorized_actions"],
            ),
            Role::new(
                "recon",
                &["deterministic_local_execution", "evidence_capture"],
                &[
                    "internet_access",
                    "unauthorized_actions",
                    "capability_claims_without_proof",
                ],
            ),
            Role::new(
                "envoy",
                &["deterministic_local_execution", "evidence_capture"],
                &["internet_access", "state_mutation", "unauthorized_actions"],
            ),
        ])
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.get(name)
    }

    pub fn actions(&self) -> &BTreeSet<String> {
        &self.actions
    }

    pub fn decide(&self, role: &str, action: &str) -> Decision {
        let Some(declared) = self.roles.get(role) else {
            return Decision::deny(DecisionCode::UnknownRole, role.to_string());
        };
        if !self.actions.contains(action) {
            return Decision::deny(DecisionCode::UnknownAction, action.to_string());
        }
        if declared.prohibited.contains(action) {
            return Decision::deny(DecisionCode::Prohibited, format!("{role}:{action}"));
        }
        if declared.authority.contains(action) {
            return Decision::allow(role, action);
        }
        Decision::deny(DecisionCode::NotAuthorized, format!("{role}:{action}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorized_action_is_allowed() {
        let decision = RoleRegistry::canonical().decide("recon", "evidence_capture");
        assert!(decision.allow);
        assert_eq!(decision.reason, "allow:authorized:recon:evidence_capture");
        assert_eq!(decision.into_denial(), None);
    }

    #[test]
    fn prohibition_wins_over_authority() {
        let registry = RoleRegistry::new([Role::new(
            "split",
            &["state_mutation", "reporting"],
            &["state_mutation"],
        )]);
        let decision = registry.decide("split", "state_mutation");
        assert!(!decision.allow);
        assert_eq!(decision.code, DecisionCode::Prohibited);
        assert_eq!(decision.reason, "deny:prohibited:split:state_mutation");
    }

    #[test]
    fn unknown_role_always_denies() {
        let registry = RoleRegistry::canonical();
        for action in ["architecture", "evidence_capture", "anything"] {
            let decision = registry.decide("mallory", action);
            assert!(!decision.allow);
            assert_eq!(decision.code, DecisionCode::UnknownRole);
        }
    }

    #[test]
    fn unknown_action_checked_before_role_sets() {
        let decision = RoleRegistry::canonical().decide("recon", "launch_rockets");
        assert_eq!(decision.code, DecisionCode::UnknownAction);
        assert_eq!(decision.reason, "deny:unknown_action:launch_rockets");
    }

    #[test]
    fn known_but_unlisted_action_is_not_authorized() {
        let decision = RoleRegistry::canonical().decide("scout", "architecture");
        assert_eq!(decision.code, DecisionCode::NotAuthorized);
        let denial = decision.into_denial().expect("denial");
        assert_eq!(denial.kind(), ErrorKind::NotAuthorized);
    }
}
