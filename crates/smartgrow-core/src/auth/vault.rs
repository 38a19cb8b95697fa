use std::sync::{Arc, Mutex, MutexGuard};

use super::credentials::{CredentialStore, StoreError};

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const USER_EMAIL_KEY: &str = "userEmail";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

/// Both token slots as seen at one instant. Either slot may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSnapshot {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Pair-level view over a [`CredentialStore`].
///
/// Reads and writes that touch both slots hold one lock for their whole
/// duration, so a reader going through the vault never sees a new access
/// token next to an old refresh token.
pub struct CredentialVault {
    store: Arc<dyn CredentialStore>,
    lock: Mutex<()>,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.lock.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn snapshot(&self) -> Result<CredentialSnapshot, StoreError> {
        let _guard = self.guard()?;
        let mut slots = self.store.get_many(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY])?.into_iter();
        Ok(CredentialSnapshot {
            access_token: slots.next().flatten(),
            refresh_token: slots.next().flatten(),
        })
    }

    pub fn access_token(&self) -> Result<Option<String>, StoreError> {
        let _guard = self.guard()?;
        self.store.get(ACCESS_TOKEN_KEY)
    }

    pub fn refresh_token(&self) -> Result<Option<String>, StoreError> {
        let _guard = self.guard()?;
        self.store.get(REFRESH_TOKEN_KEY)
    }

    /// Overwrite both tokens in one store write. Stores that write key by
    /// key may fail halfway; the access token is then rolled back so the
    /// slots still hold a matching pair.
    pub fn replace(&self, pair: &CredentialPair) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        let previous = self.store.get(ACCESS_TOKEN_KEY)?;
        let entries = [
            (ACCESS_TOKEN_KEY, pair.access_token.as_str()),
            (REFRESH_TOKEN_KEY, pair.refresh_token.as_str()),
        ];
        if let Err(e) = self.store.set_many(&entries) {
            let _ = match previous {
                Some(ref token) => self.store.set(ACCESS_TOKEN_KEY, token),
                None => self.store.remove(ACCESS_TOKEN_KEY),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Remove both tokens. Both removals are attempted even if one fails.
    pub fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        self.store.remove_many(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY])
    }

    pub fn user_email(&self) -> Result<Option<String>, StoreError> {
        self.store.get(USER_EMAIL_KEY)
    }

    pub fn set_user_email(&self, email: &str) -> Result<(), StoreError> {
        self.store.set(USER_EMAIL_KEY, email)
    }

    pub fn clear_user_email(&self) -> Result<(), StoreError> {
        self.store.remove(USER_EMAIL_KEY)
    }
}
