// Copyright (c) 2024 Botho Foundation

//! Error types for the topology module.

use crate::ids::{Dpid, IdParseError};
use displaydoc::Display;
use thiserror::Error;

/// Errors that can occur in the topology module.
#[derive(Debug, Display, Error)]
pub enum TopologyError {
    /// Invalid topology event: {0}
    InvalidEvent(String),

    /// Invalid identity: {0}
    InvalidId(#[from] IdParseError),

    /// Registry error: {0}
    Registry(#[from] RegistryError),

    /// Failed to read configuration: {0}
    ConfigIo(#[from] std::io::Error),

    /// Failed to parse configuration: {0}
    ConfigParse(#[from] toml::de::Error),

    /// Metrics error: {0}
    Metrics(#[from] prometheus::Error),

    /// Cold start failed: {0}
    ColdStart(String),

    /// Topology worker is not running
    WorkerStopped,

    /// Failed to spawn topology worker: {0}
    WorkerSpawn(String),
}

/// Errors reported by the mastership registry.
#[derive(Clone, Debug, Display, Eq, Error, PartialEq)]
pub enum RegistryError {
    /// Registry unavailable: {0}
    Unavailable(String),

    /// Timed out asking for the master of {0}
    Timeout(Dpid),

    /// Mastership of {0} is ambiguous
    Ambiguous(Dpid),
}

/// Result type for topology operations.
pub type TopologyResult<T> = Result<T, TopologyError>;
