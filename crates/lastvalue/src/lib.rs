//! Alopex LastValue - last observed value resolution for time series
//!
//! This crate answers `SELECT LAST` queries: for each requested series it
//! finds the point with the greatest timestamp, consulting a last-value
//! cache first and scanning storage only for the series the cache misses.
//!
//! # Components
//!
//! - [`LastValueResolver`]: cache lookup, snapshot pinning, scan and write-back
//! - [`InMemoryLastCache`]: sharded last-point cache
//! - [`StorageEngine`]: storage groups of segments implementing [`SnapshotCoordinator`]
//! - [`assemble`]: conversion of resolved slots into output rows
//! - [`LastQueryExecutor`]: resolve and assemble in one call
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_lastvalue::{
//!     DataType, EngineConfig, InMemoryLastCache, LastQueryExecutor, LastQueryPlan,
//!     QueryContext, ResolverConfig, SeriesKey, StorageEngine, TimeValuePair, TypedValue,
//! };
//! use std::sync::Arc;
//!
//! let cache = Arc::new(InMemoryLastCache::default());
//! let engine = Arc::new(
//!     StorageEngine::open(EngineConfig::new("/data/lastvalue"))?.with_last_cache(cache.clone()),
//! );
//! engine.set_storage_group("root.sg")?;
//!
//! let s1 = SeriesKey::parse("root.sg.d1.s1")?;
//! engine.insert(&s1, DataType::Int32, TimeValuePair::new(100, TypedValue::Int32(5)))?;
//!
//! let executor = LastQueryExecutor::new(cache, engine, ResolverConfig::default());
//! let plan = LastQueryPlan::new(vec![s1], vec![DataType::Int32]);
//! let result = executor.execute(&QueryContext::new(), &plan)?;
//! assert_eq!(result.rows[0].value.as_deref(), Some("5"));
//! ```

#![deny(missing_docs)]

pub mod assembler;
pub mod cache;
pub mod context;
pub mod error;
pub mod executor;
pub mod filter;
pub mod plan;
pub mod resolver;
pub mod series;
pub mod snapshot;
pub mod storage;

pub use assembler::{assemble, display_label, LastQueryDataSet, Row};
pub use cache::{CacheLookup, InMemoryLastCache, LastCache, LastCacheConfig};
pub use context::QueryContext;
pub use error::{LastQueryError, Result};
pub use executor::LastQueryExecutor;
pub use filter::{satisfy, CompareOp, Filter};
pub use plan::LastQueryPlan;
pub use resolver::{LastValueResolver, ResolverConfig};
pub use series::{DataType, LastSlot, SeriesKey, TimeValuePair, Timestamp, TypedValue};
pub use snapshot::{LastPointReader, ReaderRequest, SnapshotCoordinator, SnapshotStrategy};
pub use storage::{EngineConfig, StorageEngine};
