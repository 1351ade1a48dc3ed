//! Domain primitive types used across the gadget workspace.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Namespaced name of a trace resource, rendered as `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceName {
    /// Namespace the trace resource lives in.
    pub namespace: String,
    /// Name of the trace resource.
    pub name: String,
}

impl TraceName {
    /// Creates a trace name from its two parts.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TraceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A container as reported by the discovery layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Runtime container identifier.
    pub id: String,
    /// PID of a process inside the container, used to reach its namespaces.
    pub pid: u32,
    /// Host-side veth interface paired with the container's network device.
    pub veth_peer: Option<String>,
    /// Kubernetes namespace of the owning pod.
    pub namespace: String,
    /// Owning pod name.
    pub pod: String,
    /// Container name within the pod.
    pub name: String,
    /// Pod labels.
    pub labels: BTreeMap<String, String>,
}

/// Selects containers by namespace, pod, container name and labels.
///
/// Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerFilter {
    /// Required namespace.
    pub namespace: Option<String>,
    /// Required pod name.
    pub pod: Option<String>,
    /// Required container name.
    pub container_name: Option<String>,
    /// Labels that must all be present with equal values.
    pub labels: BTreeMap<String, String>,
}

impl ContainerFilter {
    /// Returns `true` if `container` satisfies every populated criterion.
    #[must_use]
    pub fn matches(&self, container: &ContainerInfo) -> bool {
        let field_ok = |want: &Option<String>, have: &str| want.as_deref().is_none_or(|w| w == have);
        field_ok(&self.namespace, &container.namespace)
            && field_ok(&self.pod, &container.pod)
            && field_ok(&self.container_name, &container.name)
            && self
                .labels
                .iter()
                .all(|(k, v)| container.labels.get(k) == Some(v))
    }
}

/// Lifecycle state of a trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceState {
    /// No kernel resources are held.
    #[default]
    Stopped,
    /// Resources are being acquired.
    Starting,
    /// The tracer is active.
    Started,
    /// Resources are being released.
    Stopping,
}

impl fmt::Display for TraceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Starting => write!(f, "Starting"),
            Self::Started => write!(f, "Started"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Operation requested on a trace by the orchestration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Start the gadget.
    Start,
    /// Stop the gadget.
    Stop,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// How a gadget delivers its events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputMode {
    /// Events are streamed as they are produced.
    #[default]
    Stream,
}

/// Desired configuration of a trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSpec {
    /// Gadget kind, e.g. `iptables` or `dns`.
    pub gadget: String,
    /// Node the trace runs on.
    pub node: Option<String>,
    /// Containers the trace applies to.
    pub filter: ContainerFilter,
    /// Requested output mode.
    pub output_mode: OutputMode,
}

/// Observed state of a trace, written back by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStatus {
    /// Current lifecycle state.
    pub state: TraceState,
    /// Error of the last operation, if it failed.
    pub operation_error: Option<String>,
    /// Non-fatal warning of the last operation.
    pub operation_warning: Option<String>,
}

/// A trace resource: identity, desired spec and observed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    /// Namespaced name of the trace.
    pub name: TraceName,
    /// Desired configuration.
    pub spec: TraceSpec,
    /// Observed status.
    pub status: TraceStatus,
}

impl Trace {
    /// Creates a trace with a default status.
    #[must_use]
    pub fn new(name: TraceName, spec: TraceSpec) -> Self {
        Self {
            name,
            spec,
            status: TraceStatus::default(),
        }
    }
}
