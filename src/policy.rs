use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PolicyError, ValidationError};
use crate::maintenance::JobKind;

/// Identifier of an authenticated user in the identity store.
pub type ActorId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Moderator,
    User,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Moderator => "Moderator",
            Role::User => "User",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "Admin" => Ok(Role::Admin),
            "Moderator" => Ok(Role::Moderator),
            "User" => Ok(Role::User),
            other => Err(ValidationError::InvalidRole(other.to_string())),
        }
    }
}

/// The acting user with the role loaded for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Actor {
    pub id: ActorId,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ViewDashboard,
    ViewUsers,
    RunMaintenance(JobKind),
    ChangeRole { target: ActorId, new_role: Role },
    DeleteUser { target: ActorId },
}

/// Role-store facts the decision depends on, read in the same request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleFacts {
    pub admin_count: u64,
    /// Current role of the user being changed or deleted.
    pub target_role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: String,
}

impl AccessDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Stateless allow/deny rules. Nothing is cached between calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessGate;

impl AccessGate {
    pub fn decide(&self, actor: &Actor, action: &Action, facts: &RoleFacts) -> AccessDecision {
        let decision = match *action {
            Action::ViewDashboard => AccessDecision::allow("every role may view the dashboard"),
            Action::ViewUsers => match actor.role {
                Role::Admin | Role::Moderator => AccessDecision::allow("role may view users"),
                Role::User => AccessDecision::deny("viewing users requires Moderator or Admin"),
            },
            _ if actor.role != Role::Admin => {
                AccessDecision::deny(format!("{} may not perform this action", actor.role))
            }
            Action::RunMaintenance(kind) => {
                AccessDecision::allow(format!("Admin may run {}", kind.as_str()))
            }
            Action::ChangeRole { target, new_role } => {
                if target == actor.id && new_role != Role::Admin {
                    AccessDecision::deny("an Admin may not demote themselves")
                } else if removes_last_admin(facts, Some(new_role)) {
                    AccessDecision::deny("the last Admin cannot be demoted")
                } else {
                    AccessDecision::allow(format!("Admin may assign {new_role}"))
                }
            }
            Action::DeleteUser { target } => {
                if target == actor.id {
                    AccessDecision::deny("an Admin may not delete themselves")
                } else if removes_last_admin(facts, None) {
                    AccessDecision::deny("the last Admin cannot be removed")
                } else {
                    AccessDecision::allow("Admin may delete users")
                }
            }
        };
        debug!(
            actor = actor.id,
            role = actor.role.as_str(),
            ?action,
            allowed = decision.allowed,
            reason = %decision.reason,
            "access decision"
        );
        decision
    }

    pub fn check(
        &self,
        actor: &Actor,
        action: &Action,
        facts: &RoleFacts,
    ) -> Result<AccessDecision, PolicyError> {
        let decision = self.decide(actor, action, facts);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(PolicyError {
                reason: decision.reason,
            })
        }
    }
}

fn removes_last_admin(facts: &RoleFacts, new_role: Option<Role>) -> bool {
    facts.target_role == Some(Role::Admin)
        && new_role != Some(Role::Admin)
        && facts.admin_count <= 1
}
