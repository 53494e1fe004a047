//
// Copyright 2026 Moltz Project. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Token storage.
//!
//! The connect sequence needs a bearer token. [`TokenStore`] abstracts where
//! it lives: [`KeyringStore`] uses the platform credential store (Keychain,
//! Secret Service, Credential Manager) and [`MemoryStore`] holds one in
//! process for tests and short-lived tools. Platform keyring calls can block
//! on user interaction, so they run on the blocking thread pool.

use async_trait::async_trait;
use thiserror::Error;

/// Errors from the token store.
#[derive(Debug, Error)]
pub enum SecretError {
    /// The platform credential backend failed.
    #[error("credential store error: {0}")]
    Backend(String),

    /// The blocking keyring task panicked or was cancelled.
    #[error("credential store task failed: {0}")]
    Task(String),
}

/// Where the gateway bearer token is kept.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Fetch the stored token, if any.
    async fn get_token(&self) -> Result<Option<String>, SecretError>;

    /// Store or replace the token.
    async fn set_token(&self, token: &str) -> Result<(), SecretError>;

    /// Remove the token.
    async fn delete_token(&self) -> Result<(), SecretError>;
}

/// Token storage in the platform credential store.
pub struct KeyringStore {
    service: String,
    account: String,
}

impl KeyringStore {
    /// Create a store addressing `service`/`account` in the platform
    /// credential store.
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, SecretError> {
        keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| SecretError::Backend(e.to_string()))
    }
}

#[async_trait]
impl TokenStore for KeyringStore {
    async fn get_token(&self) -> Result<Option<String>, SecretError> {
        let entry = self.entry()?;
        tokio::task::spawn_blocking(move || match entry.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(SecretError::Backend(e.to_string())),
        })
        .await
        .map_err(|e| SecretError::Task(e.to_string()))?
    }

    async fn set_token(&self, token: &str) -> Result<(), SecretError> {
        let entry = self.entry()?;
        let token = token.to_string();
        tokio::task::spawn_blocking(move || {
            entry
                .set_password(&token)
                .map_err(|e| SecretError::Backend(e.to_string()))
        })
        .await
        .map_err(|e| SecretError::Task(e.to_string()))?
    }

    async fn delete_token(&self) -> Result<(), SecretError> {
        let entry = self.entry()?;
        tokio::task::spawn_blocking(move || match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(SecretError::Backend(e.to_string())),
        })
        .await
        .map_err(|e| SecretError::Task(e.to_string()))?
    }
}

/// In-process token storage.
#[derive(Default)]
pub struct MemoryStore {
    token: std::sync::Mutex<Option<String>>,
}

impl MemoryStore {
    /// Create a store pre-loaded with `token`.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: std::sync::Mutex::new(Some(token.into())),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn get_token(&self) -> Result<Option<String>, SecretError> {
        Ok(self.token.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn set_token(&self, token: &str) -> Result<(), SecretError> {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.to_string());
        Ok(())
    }

    async fn delete_token(&self) -> Result<(), SecretError> {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::default();
        assert_eq!(store.get_token().await.unwrap(), None);

        store.set_token("tok-1").await.unwrap();
        assert_eq!(store.get_token().await.unwrap(), Some("tok-1".to_string()));

        store.set_token("tok-2").await.unwrap();
        assert_eq!(store.get_token().await.unwrap(), Some("tok-2".to_string()));

        store.delete_token().await.unwrap();
        assert_eq!(store.get_token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn preloaded_store_returns_its_token() {
        let store = MemoryStore::with_token("seeded");
        assert_eq!(store.get_token().await.unwrap(), Some("seeded".to_string()));
    }
}
