// Copyright (c) 2024 Botho Foundation

//! The mastership registry seam.
//!
//! The registry is the authority on which instance controls a switch. The
//! admission filter only consults it to confirm a mastership claim before
//! trusting it.

use crate::{
    error::RegistryError,
    ids::{Dpid, InstanceId},
};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Lookup of the instance currently controlling a switch.
pub trait MastershipRegistry: Send + Sync {
    /// Return the controller of `dpid`, or `None` if nobody controls it.
    ///
    /// Implementations must give up after `timeout` and report
    /// [`RegistryError::Timeout`].
    fn controller_for_switch(
        &self,
        dpid: Dpid,
        timeout: Duration,
    ) -> Result<Option<InstanceId>, RegistryError>;
}

impl<R: MastershipRegistry + ?Sized> MastershipRegistry for Arc<R> {
    fn controller_for_switch(
        &self,
        dpid: Dpid,
        timeout: Duration,
    ) -> Result<Option<InstanceId>, RegistryError> {
        (**self).controller_for_switch(dpid, timeout)
    }
}

/// A registry backed by an in-memory table.
///
/// Useful for single-instance deployments where the local instance controls
/// every switch it is told about.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    controllers: RwLock<HashMap<Dpid, InstanceId>>,
}

impl StaticRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `instance` as the controller of `dpid`.
    pub fn set_controller(&self, dpid: Dpid, instance: InstanceId) {
        self.controllers.write().insert(dpid, instance);
    }

    /// Forget the controller of `dpid`.
    pub fn clear_controller(&self, dpid: Dpid) {
        self.controllers.write().remove(&dpid);
    }
}

impl MastershipRegistry for StaticRegistry {
    fn controller_for_switch(
        &self,
        dpid: Dpid,
        _timeout: Duration,
    ) -> Result<Option<InstanceId>, RegistryError> {
        Ok(self.controllers.read().get(&dpid).cloned())
    }
}
