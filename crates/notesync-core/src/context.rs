//! Who is asking: the principal behind an authenticated message.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationInfo {
    pub user: String,
    pub roles: Vec<String>,
    pub ticket: String,
}

impl AuthenticationInfo {
    pub fn new(user: impl Into<String>, roles: Vec<String>, ticket: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            roles,
            ticket: ticket.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS, Vec::new(), ANONYMOUS)
    }

    pub fn is_anonymous(&self) -> bool {
        self.user == ANONYMOUS
    }
}

/// Per-request context handed to every collaborator call
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub auth: AuthenticationInfo,
    /// The principal plus all of its roles
    pub user_and_roles: HashSet<String>,
}

impl ServiceContext {
    pub fn new(auth: AuthenticationInfo) -> Self {
        let mut user_and_roles: HashSet<String> = auth.roles.iter().cloned().collect();
        user_and_roles.insert(auth.user.clone());
        Self {
            auth,
            user_and_roles,
        }
    }

    /// Context for work that no client initiated, such as backend-requested runs
    pub fn system() -> Self {
        Self::new(AuthenticationInfo::anonymous())
    }

    pub fn user(&self) -> &str {
        &self.auth.user
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_and_roles_includes_principal() {
        let ctx = ServiceContext::new(AuthenticationInfo::new(
            "alice",
            vec!["admin".into(), "dev".into()],
            "t1",
        ));
        assert_eq!(ctx.user_and_roles.len(), 3);
        assert!(ctx.user_and_roles.contains("alice"));
        assert_eq!(ctx.user(), "alice");
    }
}
