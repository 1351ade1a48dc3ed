//! Start/stop lifecycle of one trace.
//!
//! A tracer owns a latency correlator, an optional kernel map garbage
//! collector and, when it traces packets, the rules installed for it.
//! Start brings them up in that order; Stop tears them down in reverse.

use std::sync::Arc;

use thiserror::Error;

use gadget_common::config::GadgetConfig;
use gadget_common::error::GadgetError;
use gadget_common::types::{ContainerFilter, TraceName, TraceState};
use gadget_core::namespace::NamespaceEntry;
use gadget_core::netfilter::PacketFilter;
use gadget_ebpf::gc::{GarbageCollector, MapSweeper};
use gadget_ebpf::latency::LatencyCorrelator;

use crate::rules::{InstalledRule, NetworkRuleManager, RuleError};
use crate::selector::ContainerSelector;

/// Errors returned by [`TracerLifecycle`] and the trace registry.
#[derive(Debug, Error)]
pub enum TracerError {
    /// Stop was requested for a tracer that is not running.
    #[error("not started")]
    NotStarted,

    /// A resource needed to run the tracer could not be created.
    #[error("initializing {resource}: {message}")]
    ResourceInit {
        /// What could not be created.
        resource: &'static str,
        /// Underlying failure.
        message: String,
    },

    /// Packet-trace rules could not be installed or removed.
    #[error(transparent)]
    Rules(#[from] RuleError),

    /// No gadget of this kind is registered.
    #[error("unknown gadget {0:?}")]
    UnknownGadget(String),
}

/// Opens a packet-filter handle when a tracer starts.
pub type PacketFilterFactory = Arc<dyn Fn() -> Result<Arc<dyn PacketFilter>, GadgetError> + Send + Sync>;

struct RuleSetup {
    filter: PacketFilterFactory,
    netns: Arc<dyn NamespaceEntry>,
}

struct Running {
    correlator: Arc<LatencyCorrelator>,
    gc: Option<GarbageCollector>,
    rules: Option<NetworkRuleManager>,
    installed: Vec<InstalledRule>,
}

/// Drives one trace through `Stopped → Starting → Started → Stopping`.
///
/// Callers serialize start and stop; the tracer itself is not meant to be
/// shared between threads while changing state.
pub struct TracerLifecycle {
    name: TraceName,
    config: GadgetConfig,
    rule_setup: Option<RuleSetup>,
    sweeper: Option<Arc<dyn MapSweeper>>,
    state: TraceState,
    running: Option<Running>,
}

impl TracerLifecycle {
    /// Creates a stopped tracer with neither rules nor a kernel map.
    #[must_use]
    pub fn new(name: TraceName, config: GadgetConfig) -> Self {
        Self {
            name,
            config,
            rule_setup: None,
            sweeper: None,
            state: TraceState::Stopped,
            running: None,
        }
    }

    /// Installs packet-trace rules on start, through a filter opened by
    /// `filter` and namespaces entered by `netns`.
    #[must_use]
    pub fn with_packet_filter(mut self, filter: PacketFilterFactory, netns: Arc<dyn NamespaceEntry>) -> Self {
        self.rule_setup = Some(RuleSetup { filter, netns });
        self
    }

    /// Garbage-collects a kernel map while started.
    #[must_use]
    pub fn with_kernel_map(mut self, sweeper: Arc<dyn MapSweeper>) -> Self {
        self.sweeper = Some(sweeper);
        self
    }

    /// Name of the trace.
    #[must_use]
    pub const fn name(&self) -> &TraceName {
        &self.name
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> TraceState {
        self.state
    }

    /// Rules installed by the last successful start.
    #[must_use]
    pub fn installed_rules(&self) -> &[InstalledRule] {
        self.running
            .as_ref()
            .map(|r| r.installed.as_slice())
            .unwrap_or_default()
    }

    /// Correlator of the running tracer.
    #[must_use]
    pub fn correlator(&self) -> Option<Arc<LatencyCorrelator>> {
        self.running.as_ref().map(|r| Arc::clone(&r.correlator))
    }

    /// Starts the tracer for the containers `selector` returns for `filter`.
    ///
    /// Does nothing if already started. On failure everything set up by
    /// this call is undone, including rules installed for containers that
    /// did succeed, and the tracer is left stopped.
    ///
    /// # Errors
    ///
    /// Returns [`TracerError::ResourceInit`] if the packet filter or the
    /// collector cannot be brought up and [`TracerError::Rules`] if any
    /// container's rules fail to install.
    pub fn start(&mut self, selector: &dyn ContainerSelector, filter: &ContainerFilter) -> Result<(), TracerError> {
        if self.state == TraceState::Started {
            return Ok(());
        }

        self.state = TraceState::Starting;
        tracing::info!(trace = %self.name, "starting tracer");

        let result = self.bring_up(selector, filter);
        match result {
            Ok(running) => {
                self.running = Some(running);
                self.state = TraceState::Started;
                tracing::info!(trace = %self.name, rules = self.installed_rules().len(), "tracer started");
                Ok(())
            }
            Err(e) => {
                self.state = TraceState::Stopped;
                tracing::error!(trace = %self.name, error = %e, "tracer failed to start");
                Err(e)
            }
        }
    }

    fn bring_up(&self, selector: &dyn ContainerSelector, filter: &ContainerFilter) -> Result<Running, TracerError> {
        let correlator = Arc::new(LatencyCorrelator::new(self.config.correlator));
        let mut gc = self
            .sweeper
            .as_ref()
            .map(|s| GarbageCollector::new(Arc::clone(s), self.config.gc.interval));

        let rules = match &self.rule_setup {
            None => None,
            Some(setup) => {
                let packet_filter = (setup.filter)().map_err(|e| TracerError::ResourceInit {
                    resource: "packet filter",
                    message: e.to_string(),
                })?;
                Some(NetworkRuleManager::new(
                    packet_filter,
                    Arc::clone(&setup.netns),
                    self.config.rules.clone(),
                ))
            }
        };

        let installed = match &rules {
            None => Vec::new(),
            Some(manager) => match manager.install(selector, filter, &self.name) {
                Ok(installed) => installed,
                Err(e) => {
                    if let RuleError::PartialInstall { installed, .. } = &e {
                        self.unwind(manager, installed);
                    }
                    return Err(e.into());
                }
            },
        };

        if let Some(gc) = gc.as_mut() {
            if let Err(e) = gc.start() {
                if let Some(manager) = &rules {
                    self.unwind(manager, &installed);
                }
                return Err(TracerError::ResourceInit {
                    resource: "kernel map garbage collector",
                    message: e.to_string(),
                });
            }
        }

        Ok(Running {
            correlator,
            gc,
            rules,
            installed,
        })
    }

    fn unwind(&self, manager: &NetworkRuleManager, installed: &[InstalledRule]) {
        if installed.is_empty() {
            return;
        }
        tracing::warn!(trace = %self.name, rules = installed.len(), "removing rules of the failed start");
        if let Err(e) = manager.remove(installed) {
            tracing::error!(trace = %self.name, error = %e, "rules of the failed start remain installed");
        }
    }

    /// Stops the tracer.
    ///
    /// The collector is stopped and the correlator released even if some
    /// rules cannot be removed; the tracer always ends up stopped.
    ///
    /// # Errors
    ///
    /// Returns [`TracerError::NotStarted`] if the tracer is not running and
    /// [`TracerError::Rules`] listing the rules left in the kernel.
    pub fn stop(&mut self) -> Result<(), TracerError> {
        if self.state != TraceState::Started {
            return Err(TracerError::NotStarted);
        }
        let Some(running) = self.running.take() else {
            self.state = TraceState::Stopped;
            return Err(TracerError::NotStarted);
        };

        self.state = TraceState::Stopping;
        tracing::info!(trace = %self.name, "stopping tracer");

        let Running {
            correlator,
            gc,
            rules,
            installed,
        } = running;

        if let Some(mut gc) = gc {
            gc.stop();
        }

        let result = match &rules {
            Some(manager) => manager.remove(&installed).map_err(TracerError::from),
            None => Ok(()),
        };

        drop(correlator);
        self.state = TraceState::Stopped;

        match &result {
            Ok(()) => tracing::info!(trace = %self.name, "tracer stopped"),
            Err(e) => tracing::error!(trace = %self.name, error = %e, "tracer stopped with rule residue"),
        }
        result
    }
}

impl Drop for TracerLifecycle {
    fn drop(&mut self) {
        if self.state == TraceState::Started {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use gadget_ebpf::gc::SweepReport;

    use super::*;
    use crate::rules::tests::{FakeFilter, FakeNetns, container, fakes};
    use crate::selector::StaticSelector;

    #[derive(Default)]
    struct CountingSweeper {
        sweeps: AtomicUsize,
    }

    impl MapSweeper for CountingSweeper {
        fn sweep(&self) -> SweepReport {
            let _ = self.sweeps.fetch_add(1, Ordering::SeqCst);
            SweepReport {
                complete: true,
                ..SweepReport::default()
            }
        }
    }

    fn tracer(filter: &Arc<FakeFilter>, netns: &Arc<FakeNetns>) -> TracerLifecycle {
        let filter = Arc::clone(filter);
        let factory: PacketFilterFactory = Arc::new(move || -> Result<Arc<dyn PacketFilter>, GadgetError> {
            Ok(Arc::clone(&filter) as Arc<dyn PacketFilter>)
        });
        TracerLifecycle::new(TraceName::new("default", "t"), GadgetConfig::default())
            .with_packet_filter(factory, Arc::clone(netns) as Arc<dyn NamespaceEntry>)
    }

    fn two_containers() -> StaticSelector {
        StaticSelector::new(vec![
            container("c1", 100, Some("veth1")),
            container("c2", 200, Some("veth2")),
        ])
    }

    #[test]
    fn start_then_stop() {
        let (filter, netns) = fakes();
        let mut t = tracer(&filter, &netns);
        assert_eq!(t.state(), TraceState::Stopped);

        t.start(&two_containers(), &ContainerFilter::default()).unwrap();
        assert_eq!(t.state(), TraceState::Started);
        assert_eq!(t.installed_rules().len(), 4);
        assert!(t.correlator().is_some());

        t.stop().unwrap();
        assert_eq!(t.state(), TraceState::Stopped);
        assert!(t.installed_rules().is_empty());
        assert!(t.correlator().is_none());
        assert_eq!(filter.count(), 0);
    }

    #[test]
    fn start_twice_is_noop() {
        let (filter, netns) = fakes();
        let mut t = tracer(&filter, &netns);
        t.start(&two_containers(), &ContainerFilter::default()).unwrap();
        let correlator = t.correlator().unwrap();

        t.start(&StaticSelector::default(), &ContainerFilter::default()).unwrap();
        assert!(Arc::ptr_eq(&correlator, &t.correlator().unwrap()));
        assert_eq!(t.installed_rules().len(), 4);
    }

    #[test]
    fn stop_when_not_started() {
        let (filter, netns) = fakes();
        let mut t = tracer(&filter, &netns);
        assert!(matches!(t.stop(), Err(TracerError::NotStarted)));
        assert_eq!(t.state(), TraceState::Stopped);
    }

    #[test]
    fn install_failure_unwinds_everything() {
        let (filter, netns) = fakes();
        let _ = filter.fail_in.lock().unwrap().insert(200);
        let mut t = tracer(&filter, &netns);

        let err = t.start(&two_containers(), &ContainerFilter::default()).unwrap_err();
        assert!(matches!(err, TracerError::Rules(RuleError::PartialInstall { .. })));
        assert_eq!(t.state(), TraceState::Stopped);
        assert!(t.correlator().is_none());
        assert_eq!(filter.count(), 0);
    }

    #[test]
    fn packet_filter_init_failure() {
        let (_, netns) = fakes();
        let factory: PacketFilterFactory = Arc::new(|| -> Result<Arc<dyn PacketFilter>, GadgetError> {
            Err(GadgetError::NotFound {
                kind: "packet filter binary",
                id: "iptables".into(),
            })
        });
        let mut t = TracerLifecycle::new(TraceName::new("default", "t"), GadgetConfig::default())
            .with_packet_filter(factory, netns);

        let err = t.start(&two_containers(), &ContainerFilter::default()).unwrap_err();
        assert!(matches!(err, TracerError::ResourceInit { resource: "packet filter", .. }));
        assert_eq!(t.state(), TraceState::Stopped);
    }

    #[test]
    fn collector_runs_only_while_started() {
        let sweeper = Arc::new(CountingSweeper::default());
        let mut config = GadgetConfig::default();
        config.gc.interval = std::time::Duration::from_millis(2);
        let mut t = TracerLifecycle::new(TraceName::new("default", "dns"), config)
            .with_kernel_map(Arc::clone(&sweeper) as Arc<dyn MapSweeper>);

        t.start(&StaticSelector::default(), &ContainerFilter::default()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        t.stop().unwrap();

        let sweeps = sweeper.sweeps.load(Ordering::SeqCst);
        assert!(sweeps >= 1);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(sweeper.sweeps.load(Ordering::SeqCst), sweeps);
    }

    #[test]
    fn stop_reports_residue_but_still_stops() {
        let (filter, netns) = fakes();
        let mut t = tracer(&filter, &netns);
        t.start(&two_containers(), &ContainerFilter::default()).unwrap();

        let _ = netns.gone.lock().unwrap().insert(0);
        let err = t.stop().unwrap_err();
        assert!(matches!(err, TracerError::Rules(RuleError::Remove { .. })));
        assert_eq!(t.state(), TraceState::Stopped);
        assert!(t.correlator().is_none());
    }
}
