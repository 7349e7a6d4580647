//! Account directory abstractions.
//!
//! The application account store, the verification-code sender and the
//! messaging platform's user directory are all out-of-process. These traits
//! describe the narrow surface the identity linker needs from them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Lifecycle status of an application account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Active,
    /// Created from a verified email with no matching authentication identity.
    PendingVerification,
}

/// An application account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub status: AccountStatus,
    /// Pre-existing authentication identity attached at creation time.
    pub auth_identity_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields for creating an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
    pub email: String,
    pub display_name: Option<String>,
    pub status: AccountStatus,
    pub auth_identity_id: Option<String>,
}

/// Display metadata reported by the messaging platform for one of its users.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformProfile {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub locale: Option<String>,
}

/// Persisted platform user -> application account mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformMapping {
    pub platform_user_id: String,
    pub account_id: String,
    pub display_name: Option<String>,
    pub locale: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ── AccountDirectory ─────────────────────────────────────────────────

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Find an account by email. Matching is case-insensitive.
    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>>;

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>>;

    /// Create an account. Returns `CollaboratorError::Conflict` when an
    /// account for the same email already exists.
    async fn create_account(&self, account: NewAccount) -> Result<Account>;

    /// Look up a pre-existing authentication identity for an email.
    async fn find_auth_identity(&self, email: &str) -> Result<Option<String>>;

    /// Generate and deliver a one-time code out-of-band.
    async fn send_verification_code(&self, email: &str) -> Result<()>;

    /// Check a one-time code. `Rejected` when the code is wrong or stale.
    async fn verify_code(&self, email: &str, code: &str) -> Result<()>;

    async fn find_platform_mapping(&self, platform_user_id: &str) -> Result<Option<String>>;

    async fn upsert_platform_mapping(&self, mapping: PlatformMapping) -> Result<()>;
}

// ── PlatformDirectory ────────────────────────────────────────────────

#[async_trait]
pub trait PlatformDirectory: Send + Sync {
    /// Ask the messaging platform about one of its users.
    async fn lookup_user(
        &self,
        platform_user_id: &str,
        workspace_id: &str,
    ) -> Result<Option<PlatformProfile>>;
}
