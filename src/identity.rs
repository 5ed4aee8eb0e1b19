use crate::api::models::{Identity, Session};
use crate::store::RoleDirectory;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::Arc;

/// Emails granted admin without a role lookup unless configured otherwise.
pub static DEFAULT_PRIVILEGED: Lazy<HashSet<String>> =
    Lazy::new(|| HashSet::from(["thepremanshu@gmail.com".to_string()]));

const ADMIN_ROLE: &str = "admin";

pub struct IdentityResolver {
    privileged: HashSet<String>,
    roles: Arc<dyn RoleDirectory>,
}

impl IdentityResolver {
    pub fn new(roles: Arc<dyn RoleDirectory>) -> Self {
        Self::with_privileged(roles, DEFAULT_PRIVILEGED.clone())
    }

    pub fn with_privileged(roles: Arc<dyn RoleDirectory>, privileged: HashSet<String>) -> Self {
        Self { privileged, roles }
    }

    /// Never fails: a broken role lookup resolves to a regular user.
    pub async fn resolve(&self, session: Option<&Session>) -> Option<Identity> {
        let session = session?;
        let email = session.email.as_deref();
        let is_admin = match email {
            Some(email) if self.privileged.contains(email) => true,
            _ => match self.roles.role_of(&session.uid).await {
                Ok(role) => role.as_deref() == Some(ADMIN_ROLE),
                Err(e) => {
                    log::warn!("role lookup for {} failed, continuing as non-admin: {e}", session.uid);
                    false
                }
            },
        };
        Some(Identity {
            id: session.uid.clone(),
            email: email.map(str::to_string),
            is_admin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ReadError, ResolutionError};
    use crate::storage::SqliteStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Unreachable(AtomicUsize);

    #[async_trait]
    impl RoleDirectory for Unreachable {
        async fn role_of(&self, _uid: &str) -> Result<Option<String>, ResolutionError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(ReadError::Unreachable("offline".into()).into())
        }
    }

    fn session(uid: &str, email: &str) -> Session {
        Session {
            uid: uid.into(),
            email: Some(email.into()),
            id_token: None,
        }
    }

    #[tokio::test]
    async fn no_session_resolves_to_nobody() {
        let resolver = IdentityResolver::new(Arc::new(SqliteStore::in_memory().unwrap()));
        assert_eq!(resolver.resolve(None).await, None);
    }

    #[tokio::test]
    async fn privileged_email_wins_over_stored_role() {
        let store = SqliteStore::in_memory().unwrap();
        store.set_role("p1", "user").unwrap();
        let resolver = IdentityResolver::new(Arc::new(store));
        let identity = resolver
            .resolve(Some(&session("p1", "thepremanshu@gmail.com")))
            .await
            .unwrap();
        assert!(identity.is_admin);
        assert_eq!(identity.id, "p1");
    }

    #[tokio::test]
    async fn privileged_email_skips_the_lookup() {
        let roles = Arc::new(Unreachable(AtomicUsize::new(0)));
        let resolver = IdentityResolver::new(roles.clone());
        let identity = resolver
            .resolve(Some(&session("p1", "thepremanshu@gmail.com")))
            .await
            .unwrap();
        assert!(identity.is_admin);
        assert_eq!(roles.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn role_record_decides_for_everyone_else() {
        let store = SqliteStore::in_memory().unwrap();
        store.set_role("boss", "admin").unwrap();
        store.set_role("pleb", "user").unwrap();
        let resolver = IdentityResolver::new(Arc::new(store));

        let boss = resolver.resolve(Some(&session("boss", "b@x.io"))).await.unwrap();
        let pleb = resolver.resolve(Some(&session("pleb", "p@x.io"))).await.unwrap();
        let ghost = resolver.resolve(Some(&session("ghost", "g@x.io"))).await.unwrap();
        assert!(boss.is_admin);
        assert!(!pleb.is_admin);
        assert!(!ghost.is_admin);
    }

    #[tokio::test]
    async fn lookup_failure_degrades_to_regular_user() {
        let resolver = IdentityResolver::new(Arc::new(Unreachable(AtomicUsize::new(0))));
        let identity = resolver.resolve(Some(&session("u1", "u@x.io"))).await.unwrap();
        assert!(!identity.is_admin);
    }

    #[tokio::test]
    async fn allow_list_is_injectable() {
        let resolver = IdentityResolver::with_privileged(
            Arc::new(Unreachable(AtomicUsize::new(0))),
            HashSet::from(["ops@adda.in".to_string()]),
        );
        let ops = resolver.resolve(Some(&session("o1", "ops@adda.in"))).await.unwrap();
        let old = resolver
            .resolve(Some(&session("p1", "thepremanshu@gmail.com")))
            .await
            .unwrap();
        assert!(ops.is_admin);
        assert!(!old.is_admin);
    }
}
