//! Authoritative Store Interfaces
//!
//! The gateway never owns persistence. These traits describe the reads the
//! cache falls back to and the quota debit the billing consumer performs.
//! [`InMemoryStore`] implements all of them for tests and single-node setups.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GatewayError, Result};

// ============================================================================
// Records
// ============================================================================

/// Account state of a user or API token
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Usable
    Enabled,
    /// Administratively disabled
    Disabled,
}

/// A user row as held by the authoritative store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Primary key
    pub id: i64,
    /// Login name
    pub username: String,
    /// Contact address
    pub email: String,
    /// Remaining quota in billing units
    pub quota: i64,
    /// Account status
    pub status: AccountStatus,
    /// Channel group the user is entitled to
    pub group: String,
}

impl UserRecord {
    /// Enabled user in the `default` group
    pub fn new(id: i64, username: impl Into<String>, quota: i64) -> Self {
        let username = username.into();
        Self {
            id,
            email: format!("{username}@localhost"),
            username,
            quota,
            status: AccountStatus::Enabled,
            group: "default".to_string(),
        }
    }
}

/// An API token row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Primary key
    pub id: i64,
    /// The secret presented by clients (without any `sk-` prefix)
    pub key: String,
    /// Owning user
    pub user_id: i64,
    /// Display name
    pub name: String,
    /// Token status
    pub status: AccountStatus,
    /// Remaining token-level quota
    pub remain_quota: i64,
    /// Ignore `remain_quota` entirely
    pub unlimited_quota: bool,
    /// Hard expiry, if any
    pub expires_at: Option<DateTime<Utc>>,
    /// Models this token may call; empty means all
    pub models: Vec<String>,
}

impl TokenRecord {
    /// Unlimited, non-expiring token for `user_id`
    pub fn new(id: i64, key: impl Into<String>, user_id: i64) -> Self {
        Self {
            id,
            key: key.into(),
            user_id,
            name: format!("token-{id}"),
            status: AccountStatus::Enabled,
            remain_quota: 0,
            unlimited_quota: true,
            expires_at: None,
            models: Vec::new(),
        }
    }

    /// Whether the token may call `model`
    pub fn allows_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }
}

// ============================================================================
// Store Traits
// ============================================================================

/// Read access to users
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Load a user; `NotFound` if no such id
    async fn get_user(&self, user_id: i64) -> Result<UserRecord>;

    /// All user ids, used to warm the bloom filter
    async fn list_user_ids(&self) -> Result<Vec<i64>>;
}

/// Read access to API tokens
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Resolve a token by its secret key
    async fn get_token(&self, key: &str) -> Result<TokenRecord>;
}

/// Atomic quota debit against the authoritative balance
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Subtract `amount` from the user's quota and return the new balance.
    ///
    /// Fails with `QuotaExhausted` when the balance cannot cover `amount`;
    /// the balance is left untouched in that case. `debit_id` identifies the
    /// debit across retries: a repeated id must not be charged again and
    /// returns the current balance.
    async fn deduct(&self, debit_id: Uuid, user_id: i64, amount: i64) -> Result<i64>;
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// Map-backed store implementing every store trait
#[derive(Debug, Default)]
pub struct InMemoryStore {
    users: DashMap<i64, UserRecord>,
    tokens: DashMap<String, TokenRecord>,
    settled: DashMap<Uuid, i64>,
    user_fetches: AtomicU64,
    token_fetches: AtomicU64,
}

impl InMemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user
    pub fn put_user(&self, user: UserRecord) {
        self.users.insert(user.id, user);
    }

    /// Insert or replace a token
    pub fn put_token(&self, token: TokenRecord) {
        self.tokens.insert(token.key.clone(), token);
    }

    /// Current quota of a user
    pub fn quota(&self, user_id: i64) -> Option<i64> {
        self.users.get(&user_id).map(|u| u.quota)
    }

    /// How many times `get_user` was called
    pub fn user_fetches(&self) -> u64 {
        self.user_fetches.load(Ordering::SeqCst)
    }

    /// How many times `get_token` was called
    pub fn token_fetches(&self) -> u64 {
        self.token_fetches.load(Ordering::SeqCst)
    }

    /// Number of distinct debits applied
    pub fn settled_debits(&self) -> usize {
        self.settled.len()
    }
}

#[async_trait]
impl UserStore for InMemoryStore {
    async fn get_user(&self, user_id: i64) -> Result<UserRecord> {
        self.user_fetches.fetch_add(1, Ordering::SeqCst);
        self.users
            .get(&user_id)
            .map(|u| u.clone())
            .ok_or_else(|| GatewayError::NotFound(format!("user {user_id}")))
    }

    async fn list_user_ids(&self) -> Result<Vec<i64>> {
        Ok(self.users.iter().map(|u| *u.key()).collect())
    }
}

#[async_trait]
impl TokenStore for InMemoryStore {
    async fn get_token(&self, key: &str) -> Result<TokenRecord> {
        self.token_fetches.fetch_add(1, Ordering::SeqCst);
        self.tokens
            .get(key)
            .map(|t| t.clone())
            .ok_or_else(|| GatewayError::NotFound("api token".to_string()))
    }
}

#[async_trait]
impl QuotaLedger for InMemoryStore {
    async fn deduct(&self, debit_id: Uuid, user_id: i64, amount: i64) -> Result<i64> {
        // the user entry lock serializes debits of one user, including replays
        let mut user = self
            .users
            .get_mut(&user_id)
            .ok_or_else(|| GatewayError::NotFound(format!("user {user_id}")))?;
        if self.settled.contains_key(&debit_id) {
            tracing::debug!(%debit_id, user_id, "debit already applied");
            return Ok(user.quota);
        }
        if user.quota < amount {
            return Err(GatewayError::QuotaExhausted {
                user_id,
                remaining: user.quota,
                required: amount,
            });
        }
        user.quota -= amount;
        self.settled.insert(debit_id, amount);
        Ok(user.quota)
    }
}
