use std::collections::HashSet;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::limits::MAX_USER_ID_LEN;
use crate::model::Caller;

/// One shared password for every login; the login name is the caller's identity.
#[derive(Debug)]
pub struct SeatdAuthSource {
    password: String,
}

impl SeatdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SeatdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if user.is_empty() || user.len() > MAX_USER_ID_LEN {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "user name missing or too long".into(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Which login names carry the admin role.
#[derive(Debug, Clone, Default)]
pub struct Roles {
    admins: HashSet<String>,
}

impl Roles {
    /// Parse a comma-separated admin list. Blank entries are ignored.
    pub fn from_list(list: &str) -> Self {
        Self {
            admins: list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        }
    }

    pub fn caller(&self, login: &str) -> Caller {
        if self.admins.contains(login) {
            Caller::admin(login)
        } else {
            Caller::user(login)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admins_from_list() {
        let roles = Roles::from_list(" admin, ops ,,");
        assert!(roles.caller("admin").is_admin());
        assert!(roles.caller("ops").is_admin());
        let guest = roles.caller("alice");
        assert!(!guest.is_admin());
        assert_eq!(guest.user_id, "alice");
    }

    #[test]
    fn empty_list_has_no_admins() {
        assert!(!Roles::from_list("").caller("admin").is_admin());
    }
}
