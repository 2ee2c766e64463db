//! Entry point for executing a last-value query plan.

use crate::assembler::{assemble, LastQueryDataSet};
use crate::cache::LastCache;
use crate::context::QueryContext;
use crate::error::Result;
use crate::plan::LastQueryPlan;
use crate::resolver::{LastValueResolver, ResolverConfig};
use crate::snapshot::SnapshotCoordinator;
use std::sync::Arc;

/// Executes [`LastQueryPlan`]s: resolve, then assemble rows.
pub struct LastQueryExecutor<S: SnapshotCoordinator> {
    resolver: LastValueResolver<S>,
}

impl<S: SnapshotCoordinator> LastQueryExecutor<S> {
    /// Creates an executor over the given cache and storage coordinator.
    pub fn new(cache: Arc<dyn LastCache>, coordinator: Arc<S>, config: ResolverConfig) -> Self {
        Self {
            resolver: LastValueResolver::new(cache, coordinator, config),
        }
    }

    /// Returns the underlying resolver.
    pub fn resolver(&self) -> &LastValueResolver<S> {
        &self.resolver
    }

    /// Runs the plan and returns its rows.
    ///
    /// # Errors
    ///
    /// Propagates any batch-level failure of [`LastValueResolver::resolve`].
    pub fn execute(&self, ctx: &QueryContext, plan: &LastQueryPlan) -> Result<LastQueryDataSet> {
        let slots = self.resolver.resolve(ctx, plan)?;
        let rows = assemble(plan.series(), slots, plan.is_ascending());
        Ok(LastQueryDataSet::new(rows))
    }
}
