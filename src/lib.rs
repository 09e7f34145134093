//! keyspan: partition lifecycle management for a range-partitioned,
//! scale-out index store.
//!
//! Writes land in a node-wide mutable journal; sealing the journal triggers
//! an overflow cycle that rewrites every locally hosted partition into
//! immutable segments, splitting the overgrown ones, joining the
//! undersized ones with their right siblings, and relocating warm
//! partitions off highly utilized nodes.
//!
//! The [`controller::OverflowController`] drives cycles; [`store`] provides
//! an in-memory store implementing the service traits the controller
//! depends on.

pub mod clock;
pub mod config;
pub mod controller;
mod error;
pub mod partition;
pub mod policy;
pub mod scoring;
pub mod services;
pub mod store;
pub mod tasks;
pub mod telemetry;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::config::ControllerConfig;
    pub use crate::controller::{CycleReport, OverflowController};
    pub use crate::partition::{IndexPartition, JournalSeal, PartitionCatalog};
    pub use crate::policy::IndexPolicy;
    pub use crate::services::{
        ConcurrencyManager, LoadBalancerService, LocalConcurrencyManager, LocalLoadBalancer,
        MetadataLookupService, PartitionStore,
    };
    pub use crate::store::MemoryIndexStore;
    pub use crate::{Error, Result};
}
