//! Gadget kinds and the traces running them.
//!
//! Each gadget kind is registered once with a constructor. The manager
//! creates one state object per trace on first use and reports the outcome
//! of every operation through the trace's status.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use gadget_common::config::GadgetConfig;
use gadget_common::types::{Operation, OutputMode, Trace, TraceName, TraceState};
use gadget_core::namespace::NamespaceEntry;
use gadget_ebpf::gc::MapSweeper;

use crate::dns::{DnsEnricher, DnsPacket};
use crate::selector::ContainerSelector;
use crate::sink::EventSink;
use crate::tracer::{PacketFilterFactory, TracerError, TracerLifecycle};

/// Collaborators shared by every trace of a manager.
#[derive(Clone)]
pub struct GadgetContext {
    /// Tracer settings.
    pub config: GadgetConfig,
    /// Container inventory.
    pub selector: Arc<dyn ContainerSelector>,
    /// Network namespace entry.
    pub netns: Arc<dyn NamespaceEntry>,
    /// Opens the packet filter when a trace starts.
    pub packet_filter: PacketFilterFactory,
    /// Destination of trace events.
    pub sink: Arc<dyn EventSink>,
    /// Kernel map written by the DNS probe, when one is loaded.
    pub query_map: Option<Arc<dyn MapSweeper>>,
}

/// Per-trace state of one gadget kind.
pub trait GadgetTrace: Send {
    /// Starts the gadget for `trace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the gadget cannot start; it is then stopped.
    fn start(&mut self, trace: &Trace) -> Result<(), TracerError>;

    /// Stops the gadget.
    ///
    /// # Errors
    ///
    /// Returns an error if the gadget was not started or left residue.
    fn stop(&mut self) -> Result<(), TracerError>;

    /// Current state.
    fn state(&self) -> TraceState;

    /// Something the operator should know about the last start.
    fn warning(&self) -> Option<String> {
        None
    }

    /// Delivers a decoded DNS packet to the gadget.
    ///
    /// Returns `false` when the gadget does not consume DNS packets or is
    /// not started; the packet is dropped.
    fn handle_dns(&self, _packet: &DnsPacket) -> bool {
        false
    }
}

/// Builds the state of a new trace.
pub type GadgetConstructor = fn(&TraceName, &GadgetContext) -> Box<dyn GadgetTrace>;

/// A registered gadget kind.
#[derive(Clone)]
pub struct GadgetKind {
    /// Name used in `TraceSpec::gadget`.
    pub name: &'static str,
    /// One-line description.
    pub description: &'static str,
    /// Output modes the gadget can produce.
    pub output_modes: &'static [OutputMode],
    /// Constructor of per-trace state.
    pub constructor: GadgetConstructor,
}

/// Gadget kinds by name.
#[derive(Clone, Default)]
pub struct GadgetRegistry {
    kinds: BTreeMap<&'static str, GadgetKind>,
}

impl GadgetRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in gadgets.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(GadgetKind {
            name: "iptables",
            description: "iptables traces which iptables rules are processed for packets",
            output_modes: &[OutputMode::Stream],
            constructor: IptablesTrace::create,
        });
        registry.register(GadgetKind {
            name: "dns",
            description: "dns traces DNS requests and responses and their latency",
            output_modes: &[OutputMode::Stream],
            constructor: DnsTrace::create,
        });
        registry
    }

    /// Adds or replaces a gadget kind.
    pub fn register(&mut self, kind: GadgetKind) {
        tracing::debug!(gadget = kind.name, "registered gadget");
        let _ = self.kinds.insert(kind.name, kind);
    }

    /// `(name, description)` of every registered kind, sorted by name.
    #[must_use]
    pub fn descriptions(&self) -> Vec<(&'static str, &'static str)> {
        self.kinds.values().map(|k| (k.name, k.description)).collect()
    }

    /// Looks up a kind.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&GadgetKind> {
        self.kinds.get(name)
    }

    /// Builds the state of trace `name` running gadget `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`TracerError::UnknownGadget`] if `kind` is not registered.
    pub fn create(
        &self,
        kind: &str,
        name: &TraceName,
        context: &GadgetContext,
    ) -> Result<Box<dyn GadgetTrace>, TracerError> {
        let entry = self
            .get(kind)
            .ok_or_else(|| TracerError::UnknownGadget(kind.to_owned()))?;
        Ok((entry.constructor)(name, context))
    }
}

/// Applies operations to traces and records their outcome in the trace
/// status.
pub struct TraceManager {
    registry: GadgetRegistry,
    context: GadgetContext,
    traces: HashMap<TraceName, Box<dyn GadgetTrace>>,
}

impl TraceManager {
    /// Creates a manager with no traces.
    pub fn new(registry: GadgetRegistry, context: GadgetContext) -> Self {
        Self {
            registry,
            context,
            traces: HashMap::new(),
        }
    }

    /// Runs `operation` on `trace`, creating its state on first use.
    ///
    /// Failures are reported in `trace.status.operation_error`, never
    /// returned.
    pub fn operate(&mut self, trace: &mut Trace, operation: Operation) {
        trace.status.operation_error = None;
        trace.status.operation_warning = None;

        let Some(kind) = self.registry.get(&trace.spec.gadget) else {
            trace.status.operation_error = Some(TracerError::UnknownGadget(trace.spec.gadget.clone()).to_string());
            return;
        };
        if !kind.output_modes.contains(&trace.spec.output_mode) {
            trace.status.operation_error = Some(format!(
                "gadget {} does not support output mode {:?}",
                kind.name, trace.spec.output_mode
            ));
            return;
        }

        if !self.traces.contains_key(&trace.name) {
            match self.registry.create(&trace.spec.gadget, &trace.name, &self.context) {
                Ok(state) => {
                    let _ = self.traces.insert(trace.name.clone(), state);
                }
                Err(e) => {
                    trace.status.operation_error = Some(e.to_string());
                    return;
                }
            }
        }
        let Some(state) = self.traces.get_mut(&trace.name) else {
            return;
        };

        tracing::info!(trace = %trace.name, gadget = %trace.spec.gadget, %operation, "trace operation");
        let result = match operation {
            Operation::Start => state.start(trace),
            Operation::Stop => state.stop(),
        };
        match result {
            Ok(()) => trace.status.operation_warning = state.warning(),
            Err(e) => trace.status.operation_error = Some(e.to_string()),
        }
        trace.status.state = state.state();
    }

    /// Stops trace `name` if needed and forgets its state.
    pub fn delete(&mut self, name: &TraceName) {
        let Some(mut state) = self.traces.remove(name) else {
            return;
        };
        if state.state() == TraceState::Started {
            if let Err(e) = state.stop() {
                tracing::warn!(trace = %name, error = %e, "stopping deleted trace");
            }
        }
        tracing::debug!(trace = %name, "trace deleted");
    }

    /// Hands a decoded DNS packet to trace `name`.
    ///
    /// Returns `false` if no such trace exists or it did not consume the
    /// packet.
    pub fn publish_dns(&self, name: &TraceName, packet: &DnsPacket) -> bool {
        let delivered = self.traces.get(name).is_some_and(|t| t.handle_dns(packet));
        if !delivered {
            tracing::debug!(trace = %name, id = packet.id, "dns packet dropped");
        }
        delivered
    }

    /// State of trace `name`, if it has been operated on.
    #[must_use]
    pub fn state_of(&self, name: &TraceName) -> Option<TraceState> {
        self.traces.get(name).map(|t| t.state())
    }
}

/// Packet-trace rules for the selected containers.
pub struct IptablesTrace {
    tracer: TracerLifecycle,
    selector: Arc<dyn ContainerSelector>,
}

impl IptablesTrace {
    fn create(name: &TraceName, context: &GadgetContext) -> Box<dyn GadgetTrace> {
        let tracer = TracerLifecycle::new(name.clone(), context.config.clone())
            .with_packet_filter(Arc::clone(&context.packet_filter), Arc::clone(&context.netns));
        Box::new(Self {
            tracer,
            selector: Arc::clone(&context.selector),
        })
    }
}

impl GadgetTrace for IptablesTrace {
    fn start(&mut self, trace: &Trace) -> Result<(), TracerError> {
        self.tracer.start(self.selector.as_ref(), &trace.spec.filter)
    }

    fn stop(&mut self) -> Result<(), TracerError> {
        self.tracer.stop()
    }

    fn state(&self) -> TraceState {
        self.tracer.state()
    }

    fn warning(&self) -> Option<String> {
        (self.tracer.state() == TraceState::Started && self.tracer.installed_rules().is_empty())
            .then(|| "no selected container has a veth peer; nothing is traced".to_owned())
    }
}

/// DNS latency tracing over the probe's query map.
pub struct DnsTrace {
    tracer: TracerLifecycle,
    selector: Arc<dyn ContainerSelector>,
    sink: Arc<dyn EventSink>,
    enricher: Option<DnsEnricher>,
}

impl DnsTrace {
    fn create(name: &TraceName, context: &GadgetContext) -> Box<dyn GadgetTrace> {
        let mut tracer = TracerLifecycle::new(name.clone(), context.config.clone());
        if let Some(map) = &context.query_map {
            tracer = tracer.with_kernel_map(Arc::clone(map));
        }
        Box::new(Self {
            tracer,
            selector: Arc::clone(&context.selector),
            sink: Arc::clone(&context.sink),
            enricher: None,
        })
    }
}

impl GadgetTrace for DnsTrace {
    fn start(&mut self, trace: &Trace) -> Result<(), TracerError> {
        self.tracer.start(self.selector.as_ref(), &trace.spec.filter)?;
        if self.enricher.is_none() {
            if let Some(correlator) = self.tracer.correlator() {
                self.enricher = Some(DnsEnricher::new(
                    self.tracer.name().clone(),
                    correlator,
                    Arc::clone(&self.sink),
                ));
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TracerError> {
        self.enricher = None;
        self.tracer.stop()
    }

    fn state(&self) -> TraceState {
        self.tracer.state()
    }

    fn warning(&self) -> Option<String> {
        (self.tracer.state() == TraceState::Started && self.enricher.is_none())
            .then(|| "no event enricher attached".to_owned())
    }

    fn handle_dns(&self, packet: &DnsPacket) -> bool {
        let Some(enricher) = &self.enricher else {
            return false;
        };
        enricher.handle(packet);
        true
    }
}
