//! Credential resolution from explicit values or a credential store alias.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::secret::SecretString;

/// Values a credential store holds for one alias. Either part may be absent.
#[derive(Clone, Default)]
pub struct StoredCredentials {
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

impl fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("username", &self.username)
            .field("has_password", &self.password.is_some())
            .finish()
    }
}

/// External secret store consulted by alias.
pub trait CredentialStore: Send + Sync {
    /// Look up the credentials registered under `alias`.
    fn resolve_credentials(&self, alias: &str) -> Option<StoredCredentials>;
}

/// In-memory [`CredentialStore`].
///
/// Owned by the hosting process and injected into sessions; there is no global
/// instance.
#[derive(Default)]
pub struct CredentialRegistry {
    entries: RwLock<HashMap<String, StoredCredentials>>,
}

impl CredentialRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the credentials for `alias`.
    pub fn insert(
        &self,
        alias: impl Into<String>,
        username: Option<&str>,
        password: Option<SecretString>,
    ) {
        self.entries.write().insert(
            alias.into(),
            StoredCredentials {
                username: username.map(ToOwned::to_owned),
                password,
            },
        );
    }

    pub fn remove(&self, alias: &str) {
        self.entries.write().remove(alias);
    }
}

impl CredentialStore for CredentialRegistry {
    fn resolve_credentials(&self, alias: &str) -> Option<StoredCredentials> {
        self.entries.read().get(alias).cloned()
    }
}

/// Resolved principal and secret. Immutable once built.
#[derive(Clone, Default)]
pub struct Credentials {
    username: Option<String>,
    password: Option<SecretString>,
}

impl Credentials {
    #[must_use]
    pub fn new(username: Option<String>, password: Option<SecretString>) -> Self {
        Self {
            username: username.filter(|u| !u.is_empty()),
            password: password.filter(|p| !p.is_empty()),
        }
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    #[must_use]
    pub fn password(&self) -> Option<&SecretString> {
        self.password.as_ref()
    }

    /// True when a principal is present.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.username.is_some()
    }

    /// Prefix the principal with an authentication domain (`DOMAIN\user`).
    #[must_use]
    pub fn with_domain(self, domain: Option<&str>) -> Self {
        match (domain.filter(|d| !d.is_empty()), self.username) {
            (Some(domain), Some(user)) => Self {
                username: Some(format!("{domain}\\{user}")),
                password: self.password,
            },
            (_, username) => Self {
                username,
                password: self.password,
            },
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("has_password", &self.password.is_some())
            .finish()
    }
}

/// Resolves credentials against an optional store.
#[derive(Clone, Default)]
pub struct CredentialResolver {
    store: Option<Arc<dyn CredentialStore>>,
}

impl CredentialResolver {
    #[must_use]
    pub fn new(store: Option<Arc<dyn CredentialStore>>) -> Self {
        Self { store }
    }

    /// Resolve `(principal, secret)`.
    ///
    /// With an alias the store wins and the explicit values fill whatever the
    /// alias lacks. Without an alias the explicit values are used verbatim.
    /// An alias unknown to the store (or no store at all) falls back to the
    /// explicit values.
    #[must_use]
    pub fn resolve(
        &self,
        alias: Option<&str>,
        explicit_principal: Option<&str>,
        explicit_secret: Option<&SecretString>,
    ) -> Credentials {
        let stored = alias
            .filter(|a| !a.is_empty())
            .and_then(|a| {
                let found = self.store.as_ref().and_then(|s| s.resolve_credentials(a));
                if found.is_none() {
                    tracing::debug!(alias = a, "no credentials registered under alias, using explicit values");
                }
                found
            })
            .unwrap_or_default();

        let username = stored
            .username
            .or_else(|| explicit_principal.map(ToOwned::to_owned));
        let password = stored.password.or_else(|| explicit_secret.cloned());

        let credentials = Credentials::new(username, password);
        tracing::debug!(
            alias = alias.unwrap_or_default(),
            username = credentials.username().unwrap_or_default(),
            has_password = credentials.password().is_some(),
            "resolved credentials"
        );
        credentials
    }
}

impl fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("has_store", &self.store.is_some())
            .finish()
    }
}
