// Copyright (c) 2024 Botho Foundation

//! Causal scheduling of a classified batch.
//!
//! Removals run first, children before parents (Host, Link, Port, Switch,
//! Mastership). Additions follow, parents before children (Mastership,
//! Switch, Port, Link, Host). An addition whose parent is still missing is
//! parked in a per-kind postponement cache and retried after a later batch
//! adds a switch or a port.

use crate::{
    applier::{ApplyOutcome, GraphApplier},
    classifier::ClassifiedBatch,
    event::{ElementKind, TopologyEvent},
    ids::{Dpid, ElementKey},
    listener::TopologyEvents,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Kinds that can wait for a missing parent.
pub const POSTPONABLE_KINDS: [ElementKind; 3] =
    [ElementKind::Port, ElementKind::Link, ElementKind::Host];

/// What one scheduling pass did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScheduleReport {
    /// Net events that changed the graph
    pub applied: usize,
    /// Net events parked for later
    pub postponed: usize,
    /// Net events that had no effect
    pub ignored: usize,
    /// Postponed events released by a retry sweep
    pub replayed: usize,
}

/// A parked event and the switch it was admitted under.
#[derive(Debug)]
struct Parked {
    owner: Option<Dpid>,
    event: TopologyEvent,
}

#[derive(Debug)]
struct PostponementCache {
    kind: ElementKind,
    events: BTreeMap<ElementKey, Parked>,
    over_threshold: bool,
}

impl PostponementCache {
    fn new(kind: ElementKind) -> Self {
        Self {
            kind,
            events: BTreeMap::new(),
            over_threshold: false,
        }
    }

    fn check_threshold(&mut self, threshold: usize) {
        if threshold == 0 {
            return;
        }
        let over = self.events.len() > threshold;
        if over && !self.over_threshold {
            warn!(
                kind = %self.kind,
                postponed = self.events.len(),
                threshold,
                "Postponed events exceed threshold; parents may never arrive"
            );
        }
        self.over_threshold = over;
    }
}

/// Orders net events and owns the postponement caches.
#[derive(Debug)]
pub struct Scheduler {
    ports: PostponementCache,
    links: PostponementCache,
    hosts: PostponementCache,
    warn_threshold: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Scheduler {
    /// Create a scheduler that warns once a cache holds more than
    /// `warn_threshold` events (0 disables the warning).
    pub fn new(warn_threshold: usize) -> Self {
        Self {
            ports: PostponementCache::new(ElementKind::Port),
            links: PostponementCache::new(ElementKind::Link),
            hosts: PostponementCache::new(ElementKind::Host),
            warn_threshold,
        }
    }

    /// Apply `batch` in causal order, then retry postponed events whose
    /// parents may now exist.
    ///
    /// Retried events are only replayed while `is_admissible` holds for
    /// them and the switch they were admitted under; the rest stay cached.
    pub fn schedule<F>(
        &mut self,
        batch: &ClassifiedBatch,
        applier: &mut GraphApplier,
        is_admissible: F,
        out: &mut TopologyEvents,
    ) -> ScheduleReport
    where
        F: Fn(&TopologyEvent, Option<Dpid>) -> bool,
    {
        let mut report = ScheduleReport::default();

        // A fresher event for the same identity supersedes the parked one.
        for key in batch.keys() {
            self.evict(key);
        }

        for kind in ElementKind::REMOVE_ORDER {
            for event in batch.removed(kind) {
                let outcome = applier.apply_remove(event, out);
                self.tally(event, outcome, &mut report);
            }
        }

        let mut switch_added = false;
        let mut port_added = false;
        for kind in ElementKind::ADD_ORDER {
            for event in batch.added(kind) {
                let outcome = applier.apply_add(event, out);
                if outcome.is_applied() {
                    switch_added |= kind == ElementKind::Switch;
                    port_added |= kind == ElementKind::Port;
                }
                self.tally(event, outcome, &mut report);
            }
        }

        if switch_added {
            port_added |= self.retry(ElementKind::Port, applier, &is_admissible, out, &mut report);
        }
        if switch_added || port_added {
            self.retry(ElementKind::Link, applier, &is_admissible, out, &mut report);
            self.retry(ElementKind::Host, applier, &is_admissible, out, &mut report);
        }

        for kind in POSTPONABLE_KINDS {
            let threshold = self.warn_threshold;
            if let Some(cache) = self.cache_mut(kind) {
                cache.check_threshold(threshold);
            }
        }
        report
    }

    /// Number of events parked for `kind`.
    pub fn postponed_len(&self, kind: ElementKind) -> usize {
        self.cache(kind).map_or(0, |c| c.events.len())
    }

    /// Events parked for `kind`, ordered by identity.
    pub fn postponed(&self, kind: ElementKind) -> impl Iterator<Item = &TopologyEvent> {
        self.cache(kind).into_iter().flat_map(|c| c.events.values().map(|parked| &parked.event))
    }

    /// Whether an event with `key` is parked.
    pub fn is_postponed(&self, key: &ElementKey) -> bool {
        POSTPONABLE_KINDS
            .iter()
            .filter_map(|kind| self.cache(*kind))
            .any(|c| c.events.contains_key(key))
    }

    /// Drop the parked event with `key`, if any.
    pub fn evict(&mut self, key: &ElementKey) -> Option<TopologyEvent> {
        [&mut self.ports, &mut self.links, &mut self.hosts]
            .into_iter()
            .find_map(|cache| cache.events.remove(key))
            .map(|parked| parked.event)
    }

    fn tally(
        &mut self,
        event: &TopologyEvent,
        outcome: ApplyOutcome,
        report: &mut ScheduleReport,
    ) {
        match outcome {
            ApplyOutcome::Applied => report.applied += 1,
            ApplyOutcome::Ignored => report.ignored += 1,
            ApplyOutcome::Postponed(rest) => {
                report.postponed += 1;
                // The remainder of a host may start on another switch.
                self.postpone(event.data.owner_dpid(), rest);
            }
        }
    }

    fn postpone(&mut self, owner: Option<Dpid>, event: TopologyEvent) {
        let kind = event.kind();
        match self.cache_mut(kind) {
            Some(cache) => {
                debug!(event = %event, "Postponing event");
                cache.events.insert(event.key(), Parked { owner, event });
            }
            None => warn!(kind = %kind, event = %event, "Event kind cannot be postponed, dropping"),
        }
    }

    /// Re-apply every admissible parked event of `kind`. Returns whether any
    /// of them was applied.
    fn retry<F>(
        &mut self,
        kind: ElementKind,
        applier: &mut GraphApplier,
        is_admissible: &F,
        out: &mut TopologyEvents,
        report: &mut ScheduleReport,
    ) -> bool
    where
        F: Fn(&TopologyEvent, Option<Dpid>) -> bool,
    {
        let Some(cache) = self.cache_mut(kind) else {
            return false;
        };
        let parked = std::mem::take(&mut cache.events);
        let mut any_applied = false;

        for (key, Parked { owner, event }) in parked {
            if !is_admissible(&event, owner) {
                self.keep(kind, key, Parked { owner, event });
                continue;
            }
            let notified = out.len();
            match applier.apply_add(&event, out) {
                ApplyOutcome::Applied => {
                    any_applied = true;
                    report.replayed += 1;
                }
                ApplyOutcome::Postponed(rest) => {
                    // A host may have been applied on some of its ports.
                    if out.len() > notified {
                        any_applied = true;
                        report.replayed += 1;
                    }
                    self.keep(kind, key, Parked { owner, event: rest });
                }
                ApplyOutcome::Ignored => {
                    debug!(event = %event, "Postponed event no longer applies, dropping");
                }
            }
        }
        any_applied
    }

    fn keep(&mut self, kind: ElementKind, key: ElementKey, parked: Parked) {
        if let Some(cache) = self.cache_mut(kind) {
            cache.events.insert(key, parked);
        }
    }

    fn cache(&self, kind: ElementKind) -> Option<&PostponementCache> {
        match kind {
            ElementKind::Port => Some(&self.ports),
            ElementKind::Link => Some(&self.links),
            ElementKind::Host => Some(&self.hosts),
            ElementKind::Mastership | ElementKind::Switch => None,
        }
    }

    fn cache_mut(&mut self, kind: ElementKind) -> Option<&mut PostponementCache> {
        match kind {
            ElementKind::Port => Some(&mut self.ports),
            ElementKind::Link => Some(&mut self.links),
            ElementKind::Host => Some(&mut self.hosts),
            ElementKind::Mastership | ElementKind::Switch => None,
        }
    }
}
