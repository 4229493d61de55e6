//! The authenticated caller on whose behalf core operations run.
//!
//! The core never performs authentication itself; it receives a `Principal`
//! already resolved by the (out-of-scope) transport layer and uses it only
//! for shared-memory ownership checks.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A principal's role tag. Only used for shared-memory access checks — the
/// core does not implement a general authorization policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// The authenticated user a request runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Uuid,
    pub role: Role,
}

impl Principal {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }

    /// Whether this principal may access a resource owned by `owner_id`.
    pub fn can_access(&self, owner_id: Uuid) -> bool {
        self.is_admin() || self.user_id == owner_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_can_access_own_resource() {
        let id = Uuid::new_v4();
        let p = Principal::new(id, Role::User);
        assert!(p.can_access(id));
    }

    #[test]
    fn non_owner_user_denied() {
        let p = Principal::new(Uuid::new_v4(), Role::User);
        assert!(!p.can_access(Uuid::new_v4()));
    }

    #[test]
    fn admin_can_access_any_resource() {
        let p = Principal::new(Uuid::new_v4(), Role::Admin);
        assert!(p.can_access(Uuid::new_v4()));
    }
}
