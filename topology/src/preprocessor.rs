// Copyright (c) 2024 Botho Foundation

//! The admission filter.
//!
//! Every instance publishes what it sees, but only the master of a switch is
//! authoritative for the elements that switch owns. The filter remembers the
//! latest ADD each instance sent for every identity ("live ADDs"), even when
//! the ADD is not admitted, so that once the instance is confirmed as master
//! its earlier view of the switch can be replayed into the batch.

use crate::{
    error::RegistryError,
    event::{
        ElementKind, EventAction, EventEntry, MastershipData, MastershipRole, TopologyData,
        TopologyEvent,
    },
    ids::{Dpid, ElementKey, InstanceId},
    registry::MastershipRegistry,
};
use displaydoc::Display;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, warn};

/// Why an event was not admitted.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum RejectReason {
    /// origin is not the master of the owning switch
    NotMaster,
    /// no prior ADD from the same origin
    Untracked,
    /// mastership claim not confirmed by the registry
    Unconfirmed,
    /// registry failure: {0}
    RegistryFailure(RegistryError),
}

impl RejectReason {
    /// Label used in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NotMaster => "not_master",
            RejectReason::Untracked => "untracked",
            RejectReason::Unconfirmed => "unconfirmed",
            RejectReason::RegistryFailure(_) => "registry_failure",
        }
    }
}

/// Verdict of the admission filter for one event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Admission {
    /// Apply the event
    Admitted,
    /// Drop the event
    Rejected(RejectReason),
}

impl Admission {
    /// Whether the event should be applied.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Live ADDs of one instance, indexed by owning switch.
#[derive(Debug, Default)]
struct InstanceState {
    live_adds: HashMap<ElementKey, TopologyEvent>,
    by_dpid: HashMap<Dpid, BTreeSet<ElementKey>>,
}

impl InstanceState {
    fn record(&mut self, event: TopologyEvent) {
        let key = event.key();
        let owner = event.data.owner_dpid();
        if let Some(previous) = self.live_adds.insert(key.clone(), event) {
            match previous.data.owner_dpid() {
                Some(old) if Some(old) != owner => self.unindex(old, &key),
                _ => {}
            }
        }
        if let Some(dpid) = owner {
            self.by_dpid.entry(dpid).or_default().insert(key);
        }
    }

    fn forget(&mut self, key: &ElementKey) -> Option<TopologyEvent> {
        let event = self.live_adds.remove(key)?;
        if let Some(dpid) = event.data.owner_dpid() {
            self.unindex(dpid, key);
        }
        Some(event)
    }

    fn unindex(&mut self, dpid: Dpid, key: &ElementKey) {
        if let Some(keys) = self.by_dpid.get_mut(&dpid) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_dpid.remove(&dpid);
            }
        }
    }

    fn owned_by(&self, dpid: Dpid) -> impl Iterator<Item = &TopologyEvent> {
        self.by_dpid
            .get(&dpid)
            .into_iter()
            .flat_map(|keys| keys.iter())
            .filter_map(|key| self.live_adds.get(key))
    }
}

enum MastershipChange {
    /// Origin confirmed as master of the switch
    Promoted,
    /// Origin was master and no longer is
    Demoted,
    /// Nothing changed
    Unchanged,
}

/// Decides which events are applied and surfaces events a new master
/// published before it was confirmed.
pub struct Preprocessor {
    registry: Arc<dyn MastershipRegistry>,
    registry_timeout: Duration,
    instances: HashMap<InstanceId, InstanceState>,
    masters: HashMap<Dpid, InstanceId>,
}

impl Preprocessor {
    /// Create a filter that confirms mastership claims with `registry`,
    /// giving up after `registry_timeout`.
    pub fn new(registry: Arc<dyn MastershipRegistry>, registry_timeout: Duration) -> Self {
        Self {
            registry,
            registry_timeout,
            instances: HashMap::new(),
            masters: HashMap::new(),
        }
    }

    /// Run one entry through the filter.
    ///
    /// When the entry confirms a new master, the live ADDs that instance sent
    /// for the switch are appended to `pending`; they belong in the same
    /// batch, after the entry itself.
    pub fn admit(&mut self, entry: &EventEntry, pending: &mut Vec<EventEntry>) -> Admission {
        let event = &entry.event;
        debug!(action = %entry.action, event = %event, "Topology event");

        let mut change = MastershipChange::Unchanged;
        if let TopologyData::Mastership(mastership) = &event.data {
            change = match self.process_mastership(entry.action, event, mastership) {
                Ok(change) => change,
                Err(reason) => return Admission::Rejected(reason),
            };
        }

        let is_master = self.is_admissible(event);
        let instance = self.instances.entry(event.origin.clone()).or_default();

        let admission = match entry.action {
            EventAction::Add => {
                instance.record(event.clone());
                let demotes = matches!(change, MastershipChange::Demoted)
                    && matches!(&event.data, TopologyData::Mastership(m) if m.role != MastershipRole::Master);
                if is_master || demotes {
                    Admission::Admitted
                } else {
                    Admission::Rejected(RejectReason::NotMaster)
                }
            }
            EventAction::Remove => {
                // The switch that owned the retracted ADD decides; a REMOVE
                // payload may list other points or none at all.
                let Some(retracted) = instance.forget(&event.key()) else {
                    warn!(event = %event, "REMOVE without a prior ADD from the same origin, ignoring");
                    return Admission::Rejected(RejectReason::Untracked);
                };
                let owner = retracted.data.owner_dpid();
                if owner.and_then(|dpid| self.masters.get(&dpid)).is_none() {
                    debug!(event = %event, "No known master, admitting REMOVE");
                    Admission::Admitted
                } else if self.is_admissible_for(event, owner) {
                    Admission::Admitted
                } else {
                    Admission::Rejected(RejectReason::NotMaster)
                }
            }
        };

        if let (MastershipChange::Promoted, TopologyData::Mastership(m)) = (&change, &event.data) {
            let before = pending.len();
            if let Some(instance) = self.instances.get(&event.origin) {
                pending.extend(
                    instance
                        .owned_by(m.dpid)
                        .filter(|e| e.kind() != ElementKind::Mastership)
                        .cloned()
                        .map(EventEntry::add),
                );
            }
            if pending.len() > before {
                debug!(
                    dpid = %m.dpid,
                    origin = %event.origin,
                    replayed = pending.len() - before,
                    "Releasing events from new master"
                );
            }
        }
        admission
    }

    fn process_mastership(
        &mut self,
        action: EventAction,
        event: &TopologyEvent,
        data: &MastershipData,
    ) -> Result<MastershipChange, RejectReason> {
        let origin = &event.origin;
        let claims_master = action == EventAction::Add && data.role == MastershipRole::Master;

        if claims_master {
            let confirmed = event.is_configured() || self.confirm(data.dpid, origin)?;
            if confirmed {
                if self.masters.get(&data.dpid) != Some(origin) {
                    info!(dpid = %data.dpid, master = %origin, "New switch master");
                }
                self.masters.insert(data.dpid, origin.clone());
                return Ok(MastershipChange::Promoted);
            }
        }

        if self.masters.get(&data.dpid) == Some(origin) {
            info!(dpid = %data.dpid, former = %origin, "Switch master stepped down");
            self.masters.remove(&data.dpid);
            return Ok(MastershipChange::Demoted);
        }
        Ok(MastershipChange::Unchanged)
    }

    fn confirm(&self, dpid: Dpid, origin: &InstanceId) -> Result<bool, RejectReason> {
        match self
            .registry
            .controller_for_switch(dpid, self.registry_timeout)
        {
            Ok(Some(controller)) if controller == *origin => Ok(true),
            Ok(controller) => {
                debug!(
                    dpid = %dpid,
                    origin = %origin,
                    registry = ?controller,
                    "Mastership claim not confirmed by registry"
                );
                Ok(false)
            }
            Err(err) => {
                warn!(dpid = %dpid, origin = %origin, error = %err, "Registry failure while confirming mastership");
                Err(RejectReason::RegistryFailure(err))
            }
        }
    }

    /// Whether `event` would be admitted by the current mastership state.
    pub fn is_admissible(&self, event: &TopologyEvent) -> bool {
        self.is_admissible_for(event, event.data.owner_dpid())
    }

    /// Whether `event` would be admitted if `owner` is the switch that owns
    /// it. Parked remainders of a host keep the owner they were admitted
    /// under, which may differ from the switch of their first point.
    pub fn is_admissible_for(&self, event: &TopologyEvent, owner: Option<Dpid>) -> bool {
        event.is_configured()
            || owner.and_then(|dpid| self.masters.get(&dpid)) == Some(&event.origin)
    }

    /// Recorded master of `dpid`.
    pub fn master_of(&self, dpid: Dpid) -> Option<&InstanceId> {
        self.masters.get(&dpid)
    }

    /// Number of switches with a recorded master.
    pub fn known_masters(&self) -> usize {
        self.masters.len()
    }

    /// Number of live ADDs remembered for `instance`.
    pub fn live_add_count(&self, instance: &InstanceId) -> usize {
        self.instances
            .get(instance)
            .map_or(0, |state| state.live_adds.len())
    }

    /// Instances that have sent at least one event.
    pub fn instances(&self) -> impl Iterator<Item = &InstanceId> {
        self.instances.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{Attributes, HostData, PortData, SwitchData, SwitchState},
        ids::{HostId, MacAddress, SwitchPort},
        registry::StaticRegistry,
    };

    const TIMEOUT: Duration = Duration::from_millis(10);

    struct FailingRegistry;

    impl MastershipRegistry for FailingRegistry {
        fn controller_for_switch(
            &self,
            dpid: Dpid,
            _timeout: Duration,
        ) -> Result<Option<InstanceId>, RegistryError> {
            Err(RegistryError::Timeout(dpid))
        }
    }

    fn node(id: &str) -> InstanceId {
        InstanceId::from(id)
    }

    fn mastership(dpid: u64, role: MastershipRole, origin: &str) -> TopologyEvent {
        TopologyEvent::new(
            TopologyData::Mastership(MastershipData {
                dpid: Dpid(dpid),
                role,
            }),
            node(origin),
        )
    }

    fn switch(dpid: u64, origin: &str) -> TopologyEvent {
        TopologyEvent::new(
            TopologyData::Switch(SwitchData {
                dpid: Dpid(dpid),
                state: SwitchState::Active,
                attributes: Attributes::new(),
            }),
            node(origin),
        )
    }

    fn port(dpid: u64, number: u32, origin: &str) -> TopologyEvent {
        TopologyEvent::new(
            TopologyData::Port(PortData {
                port: SwitchPort::new(dpid, number),
                attributes: Attributes::new(),
            }),
            node(origin),
        )
    }

    fn host(mac: u64, points: &[(u64, u32)], origin: &str) -> TopologyEvent {
        TopologyEvent::new(
            TopologyData::Host(HostData {
                id: HostId::new(MacAddress::from_u64(mac)),
                attachment_points: points.iter().map(|(d, n)| SwitchPort::new(*d, *n)).collect(),
                ip_addresses: Default::default(),
                attributes: Attributes::new(),
            }),
            node(origin),
        )
    }

    fn make_test_preprocessor(controllers: &[(u64, &str)]) -> Preprocessor {
        let registry = StaticRegistry::new();
        for (dpid, instance) in controllers {
            registry.set_controller(Dpid(*dpid), node(instance));
        }
        Preprocessor::new(Arc::new(registry), TIMEOUT)
    }

    fn admit(pre: &mut Preprocessor, entry: EventEntry) -> (Admission, Vec<EventEntry>) {
        let mut pending = Vec::new();
        let admission = pre.admit(&entry, &mut pending);
        (admission, pending)
    }

    #[test]
    fn test_add_from_non_master_is_rejected_but_remembered() {
        let mut pre = make_test_preprocessor(&[]);
        let (admission, _) = admit(&mut pre, EventEntry::add(switch(1, "node-1")));
        assert_eq!(admission, Admission::Rejected(RejectReason::NotMaster));
        assert_eq!(pre.live_add_count(&node("node-1")), 1);
    }

    #[test]
    fn test_confirmed_master_releases_live_adds() {
        let mut pre = make_test_preprocessor(&[(1, "node-1")]);
        admit(&mut pre, EventEntry::add(switch(1, "node-1")));
        admit(&mut pre, EventEntry::add(port(1, 1, "node-1")));
        admit(&mut pre, EventEntry::add(port(2, 1, "node-1")));

        let (admission, pending) = admit(
            &mut pre,
            EventEntry::add(mastership(1, MastershipRole::Master, "node-1")),
        );
        assert!(admission.is_admitted());
        assert_eq!(pre.master_of(Dpid(1)), Some(&node("node-1")));
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|e| e.is_add()));
        assert!(pending
            .iter()
            .all(|e| e.event.data.owner_dpid() == Some(Dpid(1))));

        let (admission, _) = admit(&mut pre, EventEntry::add(port(1, 2, "node-1")));
        assert!(admission.is_admitted());
    }

    #[test]
    fn test_unconfirmed_claim_is_not_promoted() {
        let mut pre = make_test_preprocessor(&[(1, "node-2")]);
        let (admission, pending) = admit(
            &mut pre,
            EventEntry::add(mastership(1, MastershipRole::Master, "node-1")),
        );
        assert_eq!(admission, Admission::Rejected(RejectReason::NotMaster));
        assert!(pending.is_empty());
        assert_eq!(pre.master_of(Dpid(1)), None);
    }

    #[test]
    fn test_configured_claim_skips_registry() {
        let mut pre = Preprocessor::new(Arc::new(FailingRegistry), TIMEOUT);
        let mut claim = mastership(1, MastershipRole::Master, "node-1");
        claim.config_state = crate::event::ConfigState::Configured;
        let (admission, _) = admit(&mut pre, EventEntry::add(claim));
        assert!(admission.is_admitted());
        assert_eq!(pre.known_masters(), 1);
    }

    #[test]
    fn test_registry_failure_leaves_state_unchanged() {
        let mut pre = Preprocessor::new(Arc::new(FailingRegistry), TIMEOUT);
        let (admission, _) = admit(
            &mut pre,
            EventEntry::add(mastership(1, MastershipRole::Master, "node-1")),
        );
        assert_eq!(
            admission,
            Admission::Rejected(RejectReason::RegistryFailure(RegistryError::Timeout(Dpid(1))))
        );
        assert_eq!(pre.known_masters(), 0);
        assert_eq!(pre.live_add_count(&node("node-1")), 0);
    }

    #[test]
    fn test_remove_requires_prior_add() {
        let mut pre = make_test_preprocessor(&[]);
        let (admission, _) = admit(&mut pre, EventEntry::remove(switch(1, "node-1")));
        assert_eq!(admission, Admission::Rejected(RejectReason::Untracked));

        admit(&mut pre, EventEntry::add(switch(1, "node-1")));
        let (admission, _) = admit(&mut pre, EventEntry::remove(switch(1, "node-1")));
        assert!(admission.is_admitted(), "no master known, REMOVE fails open");
        assert_eq!(pre.live_add_count(&node("node-1")), 0);
    }

    #[test]
    fn test_remove_from_non_master_is_rejected() {
        let mut pre = make_test_preprocessor(&[(1, "node-1")]);
        admit(
            &mut pre,
            EventEntry::add(mastership(1, MastershipRole::Master, "node-1")),
        );
        admit(&mut pre, EventEntry::add(switch(1, "node-2")));
        let (admission, _) = admit(&mut pre, EventEntry::remove(switch(1, "node-2")));
        assert_eq!(admission, Admission::Rejected(RejectReason::NotMaster));
    }

    #[test]
    fn test_demotion_clears_master() {
        let mut pre = make_test_preprocessor(&[(1, "node-1")]);
        admit(
            &mut pre,
            EventEntry::add(mastership(1, MastershipRole::Master, "node-1")),
        );
        let (admission, _) = admit(
            &mut pre,
            EventEntry::add(mastership(1, MastershipRole::Slave, "node-1")),
        );
        assert!(admission.is_admitted());
        assert_eq!(pre.master_of(Dpid(1)), None);
        assert!(!pre.is_admissible(&switch(1, "node-1")));
    }

    #[test]
    fn test_owner_change_moves_index_entry() {
        let mut state = InstanceState::default();
        state.record(host(1, &[(1, 1)], "node-1"));
        state.record(host(1, &[(2, 1)], "node-1"));
        assert_eq!(state.owned_by(Dpid(1)).count(), 0);
        assert_eq!(state.owned_by(Dpid(2)).count(), 1);

        assert!(state.forget(&host(1, &[], "node-1").key()).is_some());
        assert!(state.by_dpid.is_empty());
    }

    #[test]
    fn test_remove_checks_switch_of_retracted_add() {
        let mut pre = make_test_preprocessor(&[(1, "node-1")]);
        admit(&mut pre, EventEntry::add(mastership(1, MastershipRole::Master, "node-1")));
        admit(&mut pre, EventEntry::add(host(5, &[(1, 1)], "node-2")));

        let (admission, _) = admit(&mut pre, EventEntry::remove(host(5, &[], "node-2")));
        assert_eq!(admission, Admission::Rejected(RejectReason::NotMaster));

        // With no master on the owning switch the REMOVE fails open.
        admit(&mut pre, EventEntry::add(host(6, &[(3, 1)], "node-2")));
        let (admission, _) = admit(&mut pre, EventEntry::remove(host(6, &[(1, 1)], "node-2")));
        assert!(admission.is_admitted());
    }
}
