//! Authorization of work item transitions.

use super::WorkItem;
use crate::error::{ProcessError, ProcessResult};

/// Caller identity and group membership.
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &str;
    fn roles(&self) -> &[String];

    fn has_role(&self, role: &str) -> bool {
        self.roles().iter().any(|r| r == role)
    }
}

#[derive(Clone, Debug, Default)]
pub struct StaticIdentity {
    name: String,
    roles: Vec<String>,
}

impl StaticIdentity {
    pub fn new(
        name: impl Into<String>,
        roles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn name(&self) -> &str {
        &self.name
    }

    fn roles(&self) -> &[String] {
        &self.roles
    }
}

pub trait Policy: Send + Sync {
    fn identity(&self) -> &str;

    /// `NotAuthorized` if `transition` may not be applied by this identity.
    fn enforce(&self, work_item: &WorkItem, transition: &str) -> ProcessResult<()>;
}

/// Owner-based rules:
/// - business administrators (user or group) may do anything
/// - excluded owners may do nothing
/// - once owned, only the owner may act
/// - unowned items with potential owners accept only those users or groups
#[derive(Clone, Debug)]
pub struct IdentityPolicy {
    user: String,
    groups: Vec<String>,
}

impl IdentityPolicy {
    pub fn new(
        user: impl Into<String>,
        groups: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            user: user.into(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_provider(provider: &dyn IdentityProvider) -> Self {
        Self::new(provider.name(), provider.roles().iter().cloned())
    }

    fn in_any(&self, groups: &[String]) -> bool {
        self.groups.iter().any(|g| groups.contains(g))
    }

    fn deny(&self, work_item: &WorkItem, transition: &str) -> ProcessError {
        tracing::debug!(
            work_item_id = %work_item.id,
            identity = %self.user,
            transition,
            "Work item transition denied"
        );
        ProcessError::NotAuthorized {
            work_item_id: work_item.id,
            transition: transition.to_string(),
            identity: self.user.clone(),
        }
    }
}

impl Policy for IdentityPolicy {
    fn identity(&self) -> &str {
        &self.user
    }

    fn enforce(&self, work_item: &WorkItem, transition: &str) -> ProcessResult<()> {
        if work_item.admin_users.contains(&self.user) || self.in_any(&work_item.admin_groups) {
            return Ok(());
        }
        if work_item.excluded_users.contains(&self.user) {
            return Err(self.deny(work_item, transition));
        }
        if let Some(owner) = &work_item.actual_owner {
            return if owner == &self.user {
                Ok(())
            } else {
                Err(self.deny(work_item, transition))
            };
        }
        let restricted =
            !work_item.potential_users.is_empty() || !work_item.potential_groups.is_empty();
        if restricted
            && !work_item.potential_users.contains(&self.user)
            && !self.in_any(&work_item.potential_groups)
        {
            return Err(self.deny(work_item, transition));
        }
        Ok(())
    }
}
