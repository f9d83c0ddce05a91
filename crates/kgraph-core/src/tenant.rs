//! Tenant identity and isolation modes.
//!
//! A [`TenantContext`] is owned by the caller and passed explicitly into every
//! engine call. There is no ambient "current tenant".

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{KgError, Result};

/// Identifiers allowed to become part of a namespace name.
static NAMESPACE_SAFE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9_]{0,62}$").expect("static regex is valid")
});

const MAX_SHARED_ID_LEN: usize = 128;

/// How a tenant's rows are separated from other tenants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationMode {
    /// One set of tables; every predicate and insert carries `tenant_id`.
    #[default]
    SharedSchema,
    /// A namespace of tables per tenant, provisioned on first write.
    SeparateSchema,
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SharedSchema => f.write_str("SHARED_SCHEMA"),
            Self::SeparateSchema => f.write_str("SEPARATE_SCHEMA"),
        }
    }
}

/// Caller-supplied tenant identity scoping one operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
    #[serde(default)]
    pub isolation_mode: IsolationMode,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>, isolation_mode: IsolationMode) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            isolation_mode,
        }
    }

    pub fn shared(tenant_id: impl Into<String>) -> Self {
        Self::new(tenant_id, IsolationMode::SharedSchema)
    }

    pub fn separate(tenant_id: impl Into<String>) -> Self {
        Self::new(tenant_id, IsolationMode::SeparateSchema)
    }

    /// Validate the tenant identifier for this context's isolation mode.
    ///
    /// Separate-schema ids end up in table names, so they must match a strict
    /// lowercase allow-list. Shared-schema ids are only ever bound as
    /// parameters and just need to be non-empty printable text.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Validation`] on field `tenant_id`.
    pub fn validate(&self) -> Result<()> {
        match self.isolation_mode {
            IsolationMode::SeparateSchema => {
                if !NAMESPACE_SAFE_ID.is_match(&self.tenant_id) {
                    return Err(KgError::validation(
                        "tenant_id",
                        format!(
                            "'{}' is not a valid namespace tenant id (allowed: [a-z0-9][a-z0-9_]{{0,62}})",
                            self.tenant_id.escape_debug()
                        ),
                    ));
                }
            }
            IsolationMode::SharedSchema => {
                if self.tenant_id.trim().is_empty() {
                    return Err(KgError::validation("tenant_id", "tenant id must not be empty"));
                }
                if self.tenant_id.len() > MAX_SHARED_ID_LEN
                    || self.tenant_id.chars().any(char::is_control)
                {
                    return Err(KgError::validation(
                        "tenant_id",
                        format!(
                            "tenant id must be at most {MAX_SHARED_ID_LEN} printable characters"
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Namespace name for separate-schema tenants.
    #[must_use]
    pub fn namespace(&self) -> Option<String> {
        match self.isolation_mode {
            IsolationMode::SeparateSchema => Some(format!("tenant_{}", self.tenant_id)),
            IsolationMode::SharedSchema => None,
        }
    }

    /// Stable label distinguishing the same tenant id under different modes.
    #[must_use]
    pub fn scope_label(&self) -> String {
        match self.isolation_mode {
            IsolationMode::SharedSchema => format!("shared/{}", self.tenant_id),
            IsolationMode::SeparateSchema => format!("separate/{}", self.tenant_id),
        }
    }
}

impl fmt::Display for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.tenant_id, self.isolation_mode)
    }
}
