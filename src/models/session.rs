use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::user::Role;

/// A server-side session record.
///
/// The store holds these as JSON under `session:{session_id}`. Every read
/// and write goes through [`Session::check`] so a malformed record is never
/// trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Session {
    #[garde(skip)]
    pub session_id: Uuid,
    #[garde(skip)]
    pub user_id: Uuid,
    #[garde(email)]
    pub email: String,
    #[garde(skip)]
    pub role: Role,
    #[garde(skip)]
    pub mfa_enabled: bool,
    #[garde(skip)]
    pub mfa_verified: bool,
    #[garde(skip)]
    pub created_at: DateTime<Utc>,
    #[garde(custom(not_before(&self.created_at)))]
    pub last_accessed: DateTime<Utc>,
}

fn not_before(
    created_at: &DateTime<Utc>,
) -> impl FnOnce(&DateTime<Utc>, &()) -> garde::Result + '_ {
    move |last_accessed, _| {
        if last_accessed < created_at {
            return Err(garde::Error::new("last_accessed precedes created_at"));
        }
        Ok(())
    }
}

impl Session {
    /// Validates the record, mapping failures to a plain message.
    pub fn check(&self) -> Result<(), String> {
        self.validate().map_err(|report| report.to_string())
    }

    /// Whether the session has cleared its second factor, or never needed one.
    pub fn is_fully_authenticated(&self) -> bool {
        !self.mfa_enabled || self.mfa_verified
    }
}

/// The caller-supplied attributes of a new session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub email: String,
    pub role: Role,
    pub mfa_enabled: bool,
    pub mfa_verified: bool,
}

/// A partial update. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub email: Option<String>,
    pub role: Option<Role>,
    pub mfa_enabled: Option<bool>,
    pub mfa_verified: Option<bool>,
}

impl SessionPatch {
    /// Applies the patch in place.
    pub fn apply(self, session: &mut Session) {
        if let Some(email) = self.email {
            session.email = email;
        }
        if let Some(role) = self.role {
            session.role = role;
        }
        if let Some(mfa_enabled) = self.mfa_enabled {
            session.mfa_enabled = mfa_enabled;
        }
        if let Some(mfa_verified) = self.mfa_verified {
            session.mfa_verified = mfa_verified;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        let now = Utc::now();
        Session {
            session_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            email: "dev@example.com".to_string(),
            role: Role::Client,
            mfa_enabled: true,
            mfa_verified: false,
            created_at: now,
            last_accessed: now,
        }
    }

    #[test]
    fn valid_session_passes() {
        assert!(session().check().is_ok());
    }

    #[test]
    fn bad_email_is_rejected() {
        let mut s = session();
        s.email = "not-an-email".to_string();
        assert!(s.check().is_err());
    }

    #[test]
    fn access_before_creation_is_rejected() {
        let mut s = session();
        s.last_accessed = s.created_at - chrono::Duration::seconds(1);
        assert!(s.check().is_err());
    }

    #[test]
    fn patch_only_touches_given_fields() {
        let mut s = session();
        SessionPatch {
            mfa_verified: Some(true),
            ..Default::default()
        }
        .apply(&mut s);

        assert!(s.mfa_verified);
        assert_eq!(s.role, Role::Client);
        assert!(s.is_fully_authenticated());
    }
}
