//! Tenant isolation: every backend call goes through here.
//!
//! [`TenantIsolation`] validates the caller's [`TenantContext`], turns it into a
//! [`Scope`], provisions separate-schema namespaces on first write, bounds
//! each backend call with a timeout and tags errors with operation and tenant.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use kgraph_core::{IsolationMode, KgError, Result, TenantContext};

use crate::backend::{Scope, StorageBackend};

pub struct TenantIsolation {
    backend: Arc<dyn StorageBackend>,
    call_timeout: Duration,
    /// Namespaces known to exist.
    provisioned: DashSet<String>,
    /// Serializes provisioning so concurrent first writes create tables once.
    provisioning: AsyncMutex<()>,
}

impl TenantIsolation {
    pub fn new(backend: Arc<dyn StorageBackend>, call_timeout: Duration) -> Self {
        Self {
            backend,
            call_timeout,
            provisioned: DashSet::new(),
            provisioning: AsyncMutex::new(()),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Scope for a write. Provisions the tenant's namespace if needed.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Validation`] for a bad tenant id and
    /// [`KgError::Provisioning`] if the namespace cannot be created.
    pub async fn write_scope(&self, ctx: &TenantContext) -> Result<Scope> {
        ctx.validate()?;
        match ctx.isolation_mode {
            IsolationMode::SharedSchema => Ok(Scope::shared(&ctx.tenant_id)),
            IsolationMode::SeparateSchema => {
                let ns = namespace_of(ctx)?;
                self.ensure_namespace(&ns).await?;
                Ok(Scope::namespaced(&ctx.tenant_id, ns))
            }
        }
    }

    /// Scope for a read, or `None` when the tenant's namespace was never
    /// provisioned. Reads never provision.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Validation`] for a bad tenant id.
    pub async fn read_scope(&self, ctx: &TenantContext) -> Result<Option<Scope>> {
        ctx.validate()?;
        match ctx.isolation_mode {
            IsolationMode::SharedSchema => Ok(Some(Scope::shared(&ctx.tenant_id))),
            IsolationMode::SeparateSchema => {
                let ns = namespace_of(ctx)?;
                if self.provisioned.contains(&ns) {
                    return Ok(Some(Scope::namespaced(&ctx.tenant_id, ns)));
                }
                let exists = self.bounded(self.backend.namespace_exists(&ns)).await?;
                if exists {
                    self.provisioned.insert(ns.clone());
                    Ok(Some(Scope::namespaced(&ctx.tenant_id, ns)))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn ensure_namespace(&self, ns: &str) -> Result<()> {
        if self.provisioned.contains(ns) {
            return Ok(());
        }
        let _guard = self.provisioning.lock().await;
        if self.provisioned.contains(ns) {
            return Ok(());
        }
        if !self.bounded(self.backend.namespace_exists(ns)).await? {
            self.bounded(self.backend.provision_namespace(ns))
                .await
                .map_err(|e| match e {
                    err @ KgError::Provisioning { .. } => err,
                    other => KgError::Provisioning {
                        namespace: ns.to_string(),
                        message: other.to_string(),
                    },
                })?;
            info!(namespace = ns, "auto-provisioned tenant namespace");
        }
        self.provisioned.insert(ns.to_string());
        Ok(())
    }

    /// Apply the per-call timeout to one backend future.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::TransientBackend`] when the deadline passes.
    pub async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                debug!(timeout_ms = self.call_timeout.as_millis() as u64, "backend call timed out");
                Err(KgError::TransientBackend(format!(
                    "backend call exceeded {} ms",
                    self.call_timeout.as_millis()
                )))
            }
        }
    }

    /// Run a write against the tenant's scope.
    ///
    /// # Errors
    ///
    /// Any error from validation, provisioning or the backend, wrapped with
    /// `operation` and the tenant id.
    pub async fn write<T, F, Fut>(&self, operation: &str, ctx: &TenantContext, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn StorageBackend>, Scope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let run = async {
            let scope = self.write_scope(ctx).await?;
            debug!(operation, scope = %scope.partition_key(), "backend write");
            self.bounded(f(Arc::clone(&self.backend), scope)).await
        };
        run.await.map_err(|e| e.with_context(operation, &ctx.tenant_id))
    }

    /// Run a read against the tenant's scope; `empty` answers for a tenant
    /// whose namespace does not exist yet.
    ///
    /// # Errors
    ///
    /// As [`TenantIsolation::write`], minus provisioning.
    pub async fn read<T, F, Fut>(
        &self,
        operation: &str,
        ctx: &TenantContext,
        empty: impl FnOnce() -> Result<T>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn StorageBackend>, Scope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.on_existing(operation, "backend read", ctx, empty, f).await
    }

    /// Run a write that only touches existing data (deletes). An
    /// unprovisioned namespace answers with `missing` and stays unprovisioned.
    ///
    /// # Errors
    ///
    /// As [`TenantIsolation::write`], minus provisioning.
    pub async fn existing<T, F, Fut>(
        &self,
        operation: &str,
        ctx: &TenantContext,
        missing: impl FnOnce() -> Result<T>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn StorageBackend>, Scope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.on_existing(operation, "backend write", ctx, missing, f).await
    }

    async fn on_existing<T, F, Fut>(
        &self,
        operation: &str,
        kind: &str,
        ctx: &TenantContext,
        empty: impl FnOnce() -> Result<T>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn StorageBackend>, Scope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let run = async {
            match self.read_scope(ctx).await? {
                Some(scope) => {
                    debug!(operation, scope = %scope.partition_key(), "{kind}");
                    self.bounded(f(Arc::clone(&self.backend), scope)).await
                }
                None => empty(),
            }
        };
        run.await.map_err(|e| e.with_context(operation, &ctx.tenant_id))
    }
}

fn namespace_of(ctx: &TenantContext) -> Result<String> {
    ctx.namespace()
        .ok_or_else(|| KgError::validation("isolation_mode", "shared-schema tenants have no namespace"))
}
