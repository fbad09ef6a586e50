//! Existence-sync controller: debounced identity checks and the delete gate.
//!
//! All state lives on the UI task. Network calls run on spawned tasks and report back through
//! [`ControlEvent`]s, which the owner feeds into [`ExistenceSync::handle`].

use crate::debounce::{Debouncer, Settled, IDENTITY_DEBOUNCE};
use stalk_client::Collector;
use stalk_core::prefs::{PrefKey, PrefStore};
use stalk_core::DeleteGate;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Settled(Settled<String>),
    CheckCompleted { identity: String, exists: bool },
    DeleteCompleted { identity: String, deleted: bool },
}

/// User-visible outcome; only deletes surface anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Deleted { identity: String },
    DeleteFailed { identity: String },
}

pub struct ExistenceSync {
    store: Arc<dyn PrefStore>,
    collector: Arc<dyn Collector>,
    events: mpsc::UnboundedSender<ControlEvent>,
    debouncer: Debouncer<String>,
    identity: String,
    delete_in_flight: bool,
    delete_enabled: bool,
}

impl ExistenceSync {
    pub fn new(
        store: Arc<dyn PrefStore>,
        collector: Arc<dyn Collector>,
    ) -> (Self, mpsc::UnboundedReceiver<ControlEvent>) {
        Self::with_debounce(store, collector, IDENTITY_DEBOUNCE)
    }

    pub fn with_debounce(
        store: Arc<dyn PrefStore>,
        collector: Arc<dyn Collector>,
        delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ControlEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let sync = Self {
            store,
            collector,
            events,
            debouncer: Debouncer::new(delay),
            identity: String::new(),
            delete_in_flight: false,
            delete_enabled: false,
        };
        (sync, rx)
    }

    /// Restores the saved identity and derives enablement without a remote check.
    pub fn load(&mut self) {
        self.identity = self.store.identity().unwrap_or_else(|err| {
            warn!(event = "control_identity_read_error", error = %err);
            String::new()
        });
        self.recompute();
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn delete_enabled(&self) -> bool {
        self.delete_enabled
    }

    pub fn delete_in_flight(&self) -> bool {
        self.delete_in_flight
    }

    pub fn check_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    /// Persists the edit at once; the remote check waits for the debounce to settle.
    pub fn edit_identity(&mut self, identity: impl Into<String>) {
        let identity = identity.into();
        if identity == self.identity {
            return;
        }
        self.identity = identity;
        if let Err(err) = self.store.set_string(PrefKey::UserName, &self.identity) {
            warn!(event = "control_identity_write_error", error = %err);
        }
        let events = self.events.clone();
        self.debouncer.schedule(self.identity.clone(), move |settled| {
            let _ = events.send(ControlEvent::Settled(settled));
        });
        self.recompute();
    }

    /// Re-derives enablement from the store; picks up tracker-driven changes.
    pub fn refresh(&mut self) {
        self.recompute();
    }

    pub fn handle(&mut self, event: ControlEvent) -> Option<Notice> {
        match event {
            ControlEvent::Settled(settled) => {
                if !self.debouncer.accept(settled.generation) {
                    debug!(event = "control_check_superseded", identity = %settled.value);
                    return None;
                }
                self.settle(settled.value);
                None
            }
            ControlEvent::CheckCompleted { identity, exists } => {
                if identity != self.identity {
                    debug!(event = "control_check_superseded", identity = %identity, exists);
                    return None;
                }
                info!(event = "control_check_completed", identity = %identity, exists);
                if let Err(err) = self.store.record_existence(&identity, exists) {
                    warn!(event = "control_existence_write_error", error = %err);
                }
                self.recompute();
                None
            }
            ControlEvent::DeleteCompleted { identity, deleted } => {
                self.delete_in_flight = false;
                let notice = if deleted {
                    info!(event = "control_delete_succeeded", identity = %identity);
                    if let Err(err) = self.store.record_existence(&identity, false) {
                        warn!(event = "control_existence_write_error", error = %err);
                    }
                    Notice::Deleted { identity }
                } else {
                    warn!(event = "control_delete_failed", identity = %identity);
                    Notice::DeleteFailed { identity }
                };
                self.recompute();
                Some(notice)
            }
        }
    }

    /// Starts a delete for the displayed identity. Returns false when the gate is closed.
    pub fn request_delete(&mut self) -> bool {
        self.recompute();
        if !self.delete_enabled {
            return false;
        }
        self.delete_in_flight = true;
        self.delete_enabled = false;

        let identity = self.identity.clone();
        let collector = self.collector.clone();
        let events = self.events.clone();
        info!(event = "control_delete_requested", identity = %identity);
        tokio::spawn(async move {
            let deleted = collector.delete_data(&identity).await;
            let _ = events.send(ControlEvent::DeleteCompleted { identity, deleted });
        });
        true
    }

    fn settle(&mut self, identity: String) {
        let running = self.store.is_running().unwrap_or_else(|err| {
            warn!(event = "control_running_read_error", error = %err);
            true
        });
        if identity.is_empty() || running {
            debug!(event = "control_check_skipped", identity = %identity, running);
            self.recompute();
            return;
        }

        let collector = self.collector.clone();
        let events = self.events.clone();
        debug!(event = "control_check_started", identity = %identity);
        tokio::spawn(async move {
            let exists = collector.check_exists(&identity).await;
            let _ = events.send(ControlEvent::CheckCompleted { identity, exists });
        });
    }

    fn recompute(&mut self) {
        let gate_open = match DeleteGate::read(self.store.as_ref(), &self.identity) {
            Ok(gate) => gate.delete_enabled(),
            Err(err) => {
                warn!(event = "control_gate_read_error", error = %err);
                false
            }
        };
        self.delete_enabled = gate_open && !self.delete_in_flight;
    }
}
