// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Secret store contract.
//!
//! Executions carry only an opaque reference to their credential. The value
//! is fetched right before dispatch and never written to the registry or logs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors from the secret store.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum SecretError {
    /// No secret exists under the reference.
    #[error("Secret not found: {0}")]
    NotFound(String),

    /// The backing store failed.
    #[error("Secret store unavailable: {0}")]
    Unavailable(String),
}

/// A secret value. `Debug` and `Display` never print the contents.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    /// Wrap a value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the plaintext. Callers must not log it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue([redacted])")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

/// Secret store.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the secret stored under `reference`.
    async fn get(&self, reference: &str) -> Result<SecretValue, SecretError>;
}

/// In-process secret store for tests and local runs.
#[derive(Clone, Default)]
pub struct MemorySecretStore {
    secrets: Arc<RwLock<HashMap<String, SecretValue>>>,
}

impl MemorySecretStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a secret.
    pub async fn put(&self, reference: impl Into<String>, value: impl Into<String>) {
        self.secrets
            .write()
            .await
            .insert(reference.into(), SecretValue::new(value));
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, reference: &str) -> Result<SecretValue, SecretError> {
        self.secrets
            .read()
            .await
            .get(reference)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(reference.to_string()))
    }
}
