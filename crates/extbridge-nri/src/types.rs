//! NRI message records.
//!
//! These are the request and response bodies carried by the plugin bridge.
//! The bridge never inspects them beyond what it needs for logging and
//! registration metadata; Linux-specific sections (resources, namespaces,
//! devices) travel as opaque JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Lifecycle events
// ---------------------------------------------------------------------------

/// Pod and container lifecycle events a plugin may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Unknown,
    RunPodSandbox,
    StopPodSandbox,
    RemovePodSandbox,
    CreateContainer,
    PostCreateContainer,
    StartContainer,
    PostStartContainer,
    UpdateContainer,
    PostUpdateContainer,
    StopContainer,
    RemoveContainer,
}

impl Event {
    /// Every subscribable event, in protocol order.
    pub const ALL: [Event; 11] = [
        Event::RunPodSandbox,
        Event::StopPodSandbox,
        Event::RemovePodSandbox,
        Event::CreateContainer,
        Event::PostCreateContainer,
        Event::StartContainer,
        Event::PostStartContainer,
        Event::UpdateContainer,
        Event::PostUpdateContainer,
        Event::StopContainer,
        Event::RemoveContainer,
    ];

    /// Protocol number of the event (`Unknown` is 0).
    pub fn number(self) -> u32 {
        match self {
            Event::Unknown => 0,
            other => Event::ALL.iter().position(|e| *e == other).map_or(0, |i| i as u32 + 1),
        }
    }
}

/// Set of subscribed events, encoded as bit `n - 1` for event number `n`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMask(pub i32);

impl EventMask {
    /// A mask with every event set.
    pub fn all() -> Self {
        Event::ALL.iter().fold(Self::default(), |mask, e| mask.with(*e))
    }

    pub fn with(self, event: Event) -> Self {
        match event.number() {
            0 => self,
            n => Self(self.0 | (1 << (n - 1))),
        }
    }

    pub fn is_set(self, event: Event) -> bool {
        match event.number() {
            0 => false,
            n => self.0 & (1 << (n - 1)) != 0,
        }
    }
}

/// Container state as reported to plugins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    #[default]
    Unknown,
    Created,
    Paused,
    Running,
    Stopped,
}

// ---------------------------------------------------------------------------
// Pods and containers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodSandbox {
    pub id: String,
    pub name: String,
    pub uid: String,
    pub namespace: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub runtime_handler: String,
    pub linux: Option<Value>,
    pub pid: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hook {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub timeout: Option<i64>,
}

/// OCI hooks grouped by the point at which they run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hooks {
    pub prestart: Vec<Hook>,
    pub create_runtime: Vec<Hook>,
    pub create_container: Vec<Hook>,
    pub start_container: Vec<Hook>,
    pub poststart: Vec<Hook>,
    pub poststop: Vec<Hook>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PosixRlimit {
    #[serde(rename = "type")]
    pub kind: String,
    pub hard: u64,
    pub soft: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Container {
    pub id: String,
    pub pod_sandbox_id: String,
    pub name: String,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    pub hooks: Option<Hooks>,
    pub linux: Option<Value>,
    pub pid: u32,
    pub rlimits: Vec<PosixRlimit>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// A plugin's request to change an existing container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerUpdate {
    pub container_id: String,
    pub linux: Option<Value>,
    /// Apply the update best-effort; a failure does not fail the batch.
    pub ignore_failure: bool,
}

/// A plugin's changes to a container that is being created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerAdjustment {
    pub annotations: HashMap<String, String>,
    pub mounts: Vec<Mount>,
    pub env: Vec<KeyValue>,
    pub hooks: Option<Hooks>,
    pub linux: Option<Value>,
    pub rlimits: Vec<PosixRlimit>,
}

/// A plugin's request to evict a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerEviction {
    pub container_id: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Runtime -> plugin calls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigureRequest {
    /// Plugin-specific configuration text.
    pub config: String,
    pub runtime_name: String,
    pub runtime_version: String,
    /// Registration timeout the runtime applies, in milliseconds.
    pub registration_timeout: i64,
    /// Per-request timeout the runtime applies, in milliseconds.
    pub request_timeout: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigureResponse {
    /// Events the plugin subscribes to.
    pub events: EventMask,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchronizeRequest {
    pub pods: Vec<PodSandbox>,
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchronizeResponse {
    pub update: Vec<ContainerUpdate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateContainerRequest {
    pub pod: Option<PodSandbox>,
    pub container: Option<Container>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateContainerResponse {
    pub adjust: Option<ContainerAdjustment>,
    pub update: Vec<ContainerUpdate>,
    pub evict: Vec<ContainerEviction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateContainerRequest {
    pub pod: Option<PodSandbox>,
    pub container: Option<Container>,
    pub linux_resources: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateContainerResponse {
    pub update: Vec<ContainerUpdate>,
    pub evict: Vec<ContainerEviction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopContainerRequest {
    pub pod: Option<PodSandbox>,
    pub container: Option<Container>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopContainerResponse {
    pub update: Vec<ContainerUpdate>,
}

/// Notification of a lifecycle event the plugin subscribed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub event: Event,
    #[serde(default)]
    pub pod: Option<PodSandbox>,
    #[serde(default)]
    pub container: Option<Container>,
}

/// Body-less acknowledgement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

// ---------------------------------------------------------------------------
// Plugin -> runtime calls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterPluginRequest {
    pub plugin_name: String,
    /// Two-digit ordering index, e.g. "10".
    pub plugin_idx: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateContainersRequest {
    pub update: Vec<ContainerUpdate>,
    pub evict: Vec<ContainerEviction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateContainersResponse {
    /// Updates the runtime could not apply.
    pub failed: Vec<ContainerUpdate>,
}
