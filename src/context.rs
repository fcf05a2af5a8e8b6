//! Caller identity, threaded explicitly through every engine call.

use crate::db::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub role: Role,
}

/// Who is asking. Anonymous callers can still search with an access code.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext {
    pub identity: Option<Identity>,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self { identity: None }
    }

    pub fn user(user_id: i64, role: Role) -> Self {
        Self {
            identity: Some(Identity { user_id, role }),
        }
    }

    pub fn user_id(&self) -> Option<i64> {
        self.identity.map(|i| i.user_id)
    }

    /// The identity if it may own events.
    pub fn organizer(&self) -> Option<Identity> {
        self.identity.filter(|i| i.role.is_organizer())
    }
}
