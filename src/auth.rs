use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{PgWireError, PgWireResult};

/// Caller privilege. Ordered: a higher role may do everything a lower one can.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Guest,
    Staff,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "guest" | "customer" => Some(Role::Guest),
            "staff" | "instructor" | "clinician" => Some(Role::Staff),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }
}

/// Who is asking, on behalf of which team. Built once per query and passed
/// into every engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub caller_id: String,
    pub team_id: String,
    pub role: Role,
}

impl AuthContext {
    pub fn new(caller_id: impl Into<String>, team_id: impl Into<String>, role: Role) -> Self {
        Self {
            caller_id: caller_id.into(),
            team_id: team_id.into(),
            role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub password: String,
    /// `None` means the identity may act in any team.
    pub team: Option<String>,
    pub role: Role,
}

impl Identity {
    /// Context for a request against `database`. Team-bound identities keep
    /// their own team, so the engine can reject a cross-team request.
    pub fn context_for(&self, database: &str) -> AuthContext {
        let team = self.team.as_deref().unwrap_or(database);
        AuthContext::new(self.user.clone(), team, self.role)
    }
}

/// External source of caller identities.
pub trait IdentityProvider: Send + Sync {
    fn authenticate(&self, user: &str) -> Option<Identity>;
}

/// Fixed user table, typically from `SLOTWARD_USERS`.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    users: HashMap<String, Identity>,
}

impl StaticIdentity {
    pub fn new(identities: impl IntoIterator<Item = Identity>) -> Self {
        Self {
            users: identities
                .into_iter()
                .map(|id| (id.user.clone(), id))
                .collect(),
        }
    }

    /// Parse `user:password:team:role` entries separated by commas.
    /// Team `*` grants every team.
    pub fn parse(users: &str) -> Result<Self, String> {
        let mut identities = Vec::new();
        for entry in users.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parts: Vec<&str> = entry.split(':').collect();
            let [user, password, team, role] = parts.as_slice() else {
                return Err(format!("malformed user entry '{entry}'"));
            };
            if user.is_empty() {
                return Err(format!("empty user name in '{entry}'"));
            }
            let role = Role::parse(role).ok_or_else(|| format!("unknown role '{role}'"))?;
            let team = match *team {
                "*" => None,
                t => Some(t.to_string()),
            };
            identities.push(Identity {
                user: user.to_string(),
                password: password.to_string(),
                team,
                role,
            });
        }
        if identities.is_empty() {
            return Err("no users configured".into());
        }
        Ok(Self::new(identities))
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl IdentityProvider for StaticIdentity {
    fn authenticate(&self, user: &str) -> Option<Identity> {
        self.users.get(user).cloned()
    }
}

/// Feeds the pgwire cleartext startup handler from an identity provider.
pub struct SlotwardAuthSource {
    identities: Arc<dyn IdentityProvider>,
}

impl SlotwardAuthSource {
    pub fn new(identities: Arc<dyn IdentityProvider>) -> Self {
        Self { identities }
    }
}

// Passwords live behind the provider, so nothing of it is printed.
impl fmt::Debug for SlotwardAuthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotwardAuthSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthSource for SlotwardAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().ok_or(PgWireError::UserNameRequired)?;
        match self.identities.authenticate(user) {
            Some(identity) => Ok(Password::new(None, identity.password.into_bytes())),
            None => {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                Err(PgWireError::InvalidPassword(user.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_users() {
        let ids = StaticIdentity::parse("front:pw1:gym_a:staff, boss:pw2:*:admin").unwrap();
        assert_eq!(ids.len(), 2);

        let front = ids.authenticate("front").unwrap();
        assert_eq!(front.role, Role::Staff);
        assert_eq!(front.team.as_deref(), Some("gym_a"));

        let boss = ids.authenticate("boss").unwrap();
        assert_eq!(boss.team, None);
        assert!(ids.authenticate("nobody").is_none());
    }

    #[test]
    fn parse_rejects_bad_entries() {
        assert!(StaticIdentity::parse("a:b:c").is_err());
        assert!(StaticIdentity::parse("a:b:c:wizard").is_err());
        assert!(StaticIdentity::parse("").is_err());
    }

    #[test]
    fn wildcard_identity_takes_database_team() {
        let id = Identity {
            user: "boss".into(),
            password: "x".into(),
            team: None,
            role: Role::Admin,
        };
        assert_eq!(id.context_for("clinic_7").team_id, "clinic_7");

        let bound = Identity { team: Some("clinic_1".into()), ..id };
        assert_eq!(bound.context_for("clinic_7").team_id, "clinic_1");
    }

    fn assert_auth_source<T: AuthSource>() {}

    #[test]
    fn auth_source_debug_hides_passwords() {
        assert_auth_source::<SlotwardAuthSource>();
        let ids: Arc<dyn IdentityProvider> =
            Arc::new(StaticIdentity::parse("front:hunter2:gym_a:staff").unwrap());
        let rendered = format!("{:?}", SlotwardAuthSource::new(ids));
        assert!(rendered.starts_with("SlotwardAuthSource"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn roles_are_ordered() {
        assert!(Role::Admin > Role::Staff);
        assert!(Role::Staff > Role::Guest);
    }
}
