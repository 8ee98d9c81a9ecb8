//! Browser identity lookup.

use async_trait::async_trait;

use crate::config::{IdentityConfig, UserEntry};
use crate::types::Identity;

/// Resolves the user behind a browser connection.
///
/// Authentication and credential storage live outside the coordinator; it only
/// needs `(user_id, username, role)` for the connection's bearer token.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `None` means the connection is rejected.
    async fn identify(&self, token: Option<&str>) -> Option<Identity>;
}

/// Identity provider backed by the `identity.users` config table.
pub struct StaticIdentityProvider {
    users: Vec<UserEntry>,
    allow_anonymous: bool,
}

impl StaticIdentityProvider {
    pub fn new(config: &IdentityConfig) -> Self {
        Self {
            users: config.users.clone(),
            allow_anonymous: config.allow_anonymous,
        }
    }

    /// Accept every connection as the anonymous user.
    pub fn anonymous() -> Self {
        Self {
            users: Vec::new(),
            allow_anonymous: true,
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn identify(&self, token: Option<&str>) -> Option<Identity> {
        match token.filter(|t| !t.is_empty()) {
            Some(token) => self
                .users
                .iter()
                .find(|u| constant_time_eq(&u.token, token))
                .map(|u| Identity {
                    user_id: u.user_id.clone(),
                    username: u.username.clone(),
                    role: u.role,
                }),
            None if self.allow_anonymous => Some(Identity::anonymous()),
            None => None,
        }
    }
}

/// Constant-time string comparison to prevent timing attacks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    fn provider(allow_anonymous: bool) -> StaticIdentityProvider {
        StaticIdentityProvider::new(&IdentityConfig {
            users: vec![
                UserEntry {
                    token: "tok-alice".into(),
                    user_id: "u1".into(),
                    username: "alice".into(),
                    role: Role::Admin,
                },
                UserEntry {
                    token: "tok-bob".into(),
                    user_id: "u2".into(),
                    username: "bob".into(),
                    role: Role::User,
                },
            ],
            allow_anonymous,
        })
    }

    #[tokio::test]
    async fn test_known_token() {
        let identity = provider(false).identify(Some("tok-bob")).await.unwrap();
        assert_eq!(identity.user_id, "u2");
        assert_eq!(identity.username, "bob");
        assert!(!identity.is_admin());

        let admin = provider(false).identify(Some("tok-alice")).await.unwrap();
        assert!(admin.is_admin());
    }

    #[tokio::test]
    async fn test_unknown_token_rejected_even_with_anonymous() {
        assert!(provider(true).identify(Some("nope")).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_token() {
        assert!(provider(false).identify(None).await.is_none());
        let anon = provider(true).identify(Some("")).await.unwrap();
        assert_eq!(anon, Identity::anonymous());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("hello", "hello"));
        assert!(!constant_time_eq("hello", "world"));
        assert!(!constant_time_eq("hello", "hell"));
    }
}
