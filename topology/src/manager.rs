// Copyright (c) 2024 Botho Foundation

//! The topology manager: a dedicated worker thread fed by a command queue.
//!
//! Producers talk to the worker through a cloneable [`TopologyHandle`].
//! The worker blocks for one command, drains everything else already
//! queued, runs the batch through the [`TopologyEngine`] and notifies
//! listeners once. Readers use the [`SnapshotReader`] and never touch the
//! worker's state.

use crate::{
    config::TopologyConfig,
    engine::TopologyEngine,
    error::{TopologyError, TopologyResult},
    event::{EventEntry, TopologyEvent},
    graph::SnapshotReader,
    listener::{Listeners, TopologyListener},
    metrics::TopologyMetrics,
    registry::MastershipRegistry,
    replay::{cold_start, TopologyStore},
};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

/// Commands understood by the worker.
#[derive(Debug)]
pub enum TopologyCommand {
    /// Process an event channel entry
    Event(EventEntry),
    /// Signal once everything queued before this command was processed
    Flush(oneshot::Sender<()>),
    /// Finish the batch being built and exit
    Shutdown,
}

/// Cloneable handle for feeding the worker.
#[derive(Clone)]
pub struct TopologyHandle {
    command_tx: mpsc::UnboundedSender<TopologyCommand>,
    listeners: Arc<Listeners>,
}

impl TopologyHandle {
    fn send(&self, command: TopologyCommand) -> TopologyResult<()> {
        self.command_tx
            .send(command)
            .map_err(|_| TopologyError::WorkerStopped)
    }

    /// Queue an entry.
    pub fn submit(&self, entry: EventEntry) -> TopologyResult<()> {
        self.send(TopologyCommand::Event(entry))
    }

    /// An element was added to the event channel.
    pub fn entry_added(&self, event: TopologyEvent) -> TopologyResult<()> {
        self.submit(EventEntry::add(event))
    }

    /// An element was updated in the event channel; handled as an ADD.
    pub fn entry_updated(&self, event: TopologyEvent) -> TopologyResult<()> {
        self.submit(EventEntry::add(event))
    }

    /// An element was removed from the event channel.
    pub fn entry_removed(&self, event: TopologyEvent) -> TopologyResult<()> {
        self.submit(EventEntry::remove(event))
    }

    /// Wait until every event queued before this call has been processed.
    pub async fn flush(&self) -> TopologyResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(TopologyCommand::Flush(done_tx))?;
        done_rx.await.map_err(|_| TopologyError::WorkerStopped)
    }

    /// Ask the worker to stop after the batch it is building.
    pub fn shutdown(&self) -> TopologyResult<()> {
        self.send(TopologyCommand::Shutdown)
    }

    /// Register a listener for subsequent batches.
    pub fn add_listener(&self, listener: Arc<dyn TopologyListener>) {
        self.listeners.add(listener);
    }

    /// Deregister a listener.
    pub fn remove_listener(&self, listener: &Arc<dyn TopologyListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Whether the worker has exited.
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

/// Builder for a [`TopologyManager`].
pub struct TopologyManagerBuilder {
    config: TopologyConfig,
    registry: Arc<dyn MastershipRegistry>,
    store: Option<Arc<dyn TopologyStore>>,
    listeners: Vec<Arc<dyn TopologyListener>>,
}

impl TopologyManagerBuilder {
    /// Set the configuration.
    pub fn config(mut self, config: TopologyConfig) -> Self {
        self.config = config;
        self
    }

    /// Replay `store` before accepting live events.
    pub fn store(mut self, store: Arc<dyn TopologyStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a listener before the cold start, so it sees the replay.
    pub fn listener(mut self, listener: Arc<dyn TopologyListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Replay the store (if any) and spawn the worker.
    pub fn start(self) -> TopologyResult<TopologyManager> {
        let config = self.config;
        let metrics = TopologyMetrics::new(&config.metrics_namespace)?;
        let mut engine = TopologyEngine::new(&config, self.registry, metrics.clone());

        let listeners = Arc::new(Listeners::new());
        for listener in self.listeners {
            listeners.add(listener);
        }

        if let Some(store) = &self.store {
            let changes = cold_start(&mut engine, store.as_ref())?;
            listeners.dispatch(&changes);
        }

        let reader = engine.reader();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let worker_listeners = Arc::clone(&listeners);
        let batch_limit = config.batch_limit();
        let worker = thread::Builder::new()
            .name(config.worker_thread_name.clone())
            .spawn(move || run_worker(engine, command_rx, worker_listeners, batch_limit))
            .map_err(|err| TopologyError::WorkerSpawn(err.to_string()))?;

        info!(thread = %config.worker_thread_name, "Topology manager started");

        Ok(TopologyManager {
            handle: TopologyHandle {
                command_tx,
                listeners,
            },
            reader,
            metrics,
            worker: Some(worker),
        })
    }
}

/// Owner of the worker thread.
pub struct TopologyManager {
    handle: TopologyHandle,
    reader: SnapshotReader,
    metrics: TopologyMetrics,
    worker: Option<JoinHandle<()>>,
}

impl TopologyManager {
    /// Start building a manager that confirms mastership with `registry`.
    pub fn builder(registry: Arc<dyn MastershipRegistry>) -> TopologyManagerBuilder {
        TopologyManagerBuilder {
            config: TopologyConfig::default(),
            registry,
            store: None,
            listeners: Vec::new(),
        }
    }

    /// A handle for producers.
    pub fn handle(&self) -> TopologyHandle {
        self.handle.clone()
    }

    /// A reader for consumers.
    pub fn reader(&self) -> SnapshotReader {
        self.reader.clone()
    }

    /// Metrics exported by the worker.
    pub fn metrics(&self) -> &TopologyMetrics {
        &self.metrics
    }

    /// Stop the worker and wait for it to exit.
    pub fn shutdown(mut self) -> TopologyResult<()> {
        // The worker may already be gone; joining still tells us how it ended.
        let _ = self.handle.shutdown();
        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| {
                error!("Topology worker panicked");
                TopologyError::WorkerStopped
            }),
            None => Ok(()),
        }
    }
}

fn run_worker(
    mut engine: TopologyEngine,
    mut command_rx: mpsc::UnboundedReceiver<TopologyCommand>,
    listeners: Arc<Listeners>,
    batch_limit: Option<usize>,
) {
    info!("Topology worker running");

    while let Some(first) = command_rx.blocking_recv() {
        let mut batch = Vec::new();
        let mut flushes = Vec::new();
        let mut stop = false;

        let mut next = Some(first);
        while let Some(command) = next.take() {
            match command {
                TopologyCommand::Event(entry) => batch.push(entry),
                TopologyCommand::Flush(done) => flushes.push(done),
                TopologyCommand::Shutdown => {
                    stop = true;
                    break;
                }
            }
            if batch_limit.is_some_and(|limit| batch.len() >= limit) {
                break;
            }
            next = command_rx.try_recv().ok();
        }

        if !batch.is_empty() {
            let changes = engine.process_batch(batch);
            listeners.dispatch(&changes);
        }
        for done in flushes {
            let _ = done.send(());
        }
        if stop {
            break;
        }
    }

    info!("Topology worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{Attributes, SwitchData, SwitchState, TopologyData},
        ids::{Dpid, InstanceId},
        registry::StaticRegistry,
    };

    fn configured_switch(dpid: u64) -> TopologyEvent {
        TopologyEvent::configured(
            TopologyData::Switch(SwitchData {
                dpid: Dpid(dpid),
                state: SwitchState::Active,
                attributes: Attributes::new(),
            }),
            InstanceId::from("node-1"),
        )
    }

    #[tokio::test]
    async fn test_flush_observes_prior_events() {
        let manager = TopologyManager::builder(Arc::new(StaticRegistry::new()))
            .start()
            .unwrap();
        let handle = manager.handle();

        handle.entry_added(configured_switch(1)).unwrap();
        handle.entry_updated(configured_switch(2)).unwrap();
        handle.flush().await.unwrap();
        assert_eq!(manager.reader().current().graph().switches().count(), 2);

        handle.entry_removed(configured_switch(1)).unwrap();
        handle.flush().await.unwrap();
        assert_eq!(manager.reader().current().graph().switches().count(), 1);

        manager.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_handle_fails_after_shutdown() {
        let manager = TopologyManager::builder(Arc::new(StaticRegistry::new()))
            .config(
                crate::config::TopologyConfigBuilder::new()
                    .worker_thread_name("topology-test")
                    .max_batch_size(1)
                    .build(),
            )
            .start()
            .unwrap();
        let handle = manager.handle();
        manager.shutdown().unwrap();

        assert!(handle.is_closed());
        assert!(matches!(
            handle.entry_added(configured_switch(1)),
            Err(TopologyError::WorkerStopped)
        ));
        assert!(matches!(
            handle.flush().await,
            Err(TopologyError::WorkerStopped)
        ));
    }
}
