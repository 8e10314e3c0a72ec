// Copyright (c) 2024 Botho Foundation

//! Topology event admission, reordering and graph application.
//!
//! Controller instances in a cluster each observe part of the physical
//! network and publish what they see as topology events. This crate turns
//! that stream into one consistent graph:
//!
//! - **Admission**: an event about an element is applied only if its origin
//!   is the confirmed master of the switch that owns the element, or the
//!   element was administratively configured
//! - **Deduplication**: a batch nets to at most one ADD or REMOVE per element
//!   identity, regardless of which instance sent it
//! - **Causal ordering**: removals run children first, additions parents
//!   first; children whose parents are missing wait in a postponement cache
//! - **Application**: idempotent graph mutation with cascading removals and
//!   one notification batch per cycle
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        TopologyManager                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  TopologyHandle ──► queue ──► worker thread (TopologyEngine)     │
//! │                               Preprocessor ─► classify ─►        │
//! │                               Scheduler ─► GraphApplier          │
//! │                                     │                            │
//! │  SnapshotReader ◄── Arc<TopologySnapshot>    Listeners ◄─┘       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use ntc_topology::{StaticRegistry, TopologyConfig, TopologyManager};
//! use std::sync::Arc;
//!
//! let manager = TopologyManager::builder(Arc::new(StaticRegistry::new()))
//!     .config(TopologyConfig::load("topology.toml")?)
//!     .start()?;
//!
//! let handle = manager.handle();
//! handle.entry_added(event)?;
//! handle.flush().await?;
//!
//! let snapshot = manager.reader().current();
//! for switch in snapshot.graph().switches() {
//!     println!("{}", switch.dpid);
//! }
//! ```

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

pub mod applier;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod graph;
pub mod ids;
pub mod listener;
pub mod manager;
pub mod metrics;
pub mod preprocessor;
pub mod registry;
pub mod replay;
pub mod scheduler;

// Re-export main types for convenience
pub use applier::{ApplyOutcome, GraphApplier};
pub use classifier::{classify, ClassifiedBatch};
pub use config::{TopologyConfig, TopologyConfigBuilder};
pub use engine::TopologyEngine;
pub use error::{RegistryError, TopologyError, TopologyResult};
pub use event::{
    Attributes, ConfigState, ElementKind, EventAction, EventEntry, HostData, LinkData,
    MastershipData, MastershipRole, PortData, SwitchData, SwitchState, TopologyData,
    TopologyEvent,
};
pub use graph::{
    HostEntry, LinkEntry, MastershipRecord, PortEntry, SnapshotReader, SwitchEntry,
    TopologyGraph, TopologySnapshot,
};
pub use ids::{
    Dpid, ElementKey, HostId, IdParseError, InstanceId, LinkId, MacAddress, PortId, PortNumber,
    SwitchPort,
};
pub use listener::{Listeners, TopologyEvents, TopologyListener};
pub use manager::{TopologyCommand, TopologyHandle, TopologyManager, TopologyManagerBuilder};
pub use metrics::TopologyMetrics;
pub use preprocessor::{Admission, Preprocessor, RejectReason};
pub use registry::{MastershipRegistry, StaticRegistry};
pub use replay::{cold_start, MemoryStore, TopologyStore};
pub use scheduler::{ScheduleReport, Scheduler};
