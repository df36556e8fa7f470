use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use tracing::warn;

use crate::campus::CampusManager;

/// Cleartext login: the user name must be a user of the requested campus,
/// and everyone shares the server password.
pub struct CampusAuthSource {
    campus_manager: Arc<CampusManager>,
    password: String,
}

impl CampusAuthSource {
    pub fn new(campus_manager: Arc<CampusManager>, password: String) -> Self {
        Self {
            campus_manager,
            password,
        }
    }
}

impl std::fmt::Debug for CampusAuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CampusAuthSource").finish_non_exhaustive()
    }
}

fn refuse(message: String) -> PgWireError {
    metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
    warn!("login refused: {message}");
    PgWireError::UserError(Box::new(ErrorInfo::new("FATAL".into(), "28000".into(), message)))
}

#[async_trait]
impl AuthSource for CampusAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        let campus = login.database().unwrap_or(user);
        let engine = self
            .campus_manager
            .get_or_create(campus)
            .await
            .map_err(|e| refuse(format!("campus {campus:?}: {e}")))?;
        if engine.lookup_user(user).is_none() {
            return Err(refuse(format!("no user {user:?} in campus {campus:?}")));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
