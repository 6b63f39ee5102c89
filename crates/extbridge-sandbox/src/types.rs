//! Sandbox controller message records.
//!
//! One request/response pair per controller call, mirroring the sandbox
//! controller API of container runtimes.  Runtime-specific blobs (OCI spec,
//! options, metrics data) travel as opaque JSON.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Exit status reported when the sandbox is gone and its real status is
/// unknowable.
pub const UNKNOWN_EXIT_STATUS: u32 = 255;

// ---------------------------------------------------------------------------
// Shared records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mount {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub target: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxRuntime {
    pub name: String,
    pub options: Option<Value>,
}

/// The sandbox as stored by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sandbox {
    pub sandbox_id: String,
    pub runtime: Option<SandboxRuntime>,
    pub spec: Option<Value>,
    pub labels: HashMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub extensions: HashMap<String, Value>,
    pub sandboxer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    pub timestamp: Option<DateTime<Utc>>,
    pub id: String,
    pub data: Option<Value>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Common accessors for every controller request.
pub trait SandboxRequest {
    fn sandbox_id(&self) -> &str;
    fn sandboxer_mut(&mut self) -> &mut String;
}

macro_rules! sandbox_request {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl SandboxRequest for $ty {
                fn sandbox_id(&self) -> &str {
                    &self.sandbox_id
                }

                fn sandboxer_mut(&mut self) -> &mut String {
                    &mut self.sandboxer
                }
            }
        )+
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateRequest {
    pub sandbox_id: String,
    pub rootfs: Vec<Mount>,
    pub options: Option<Value>,
    pub netns_path: String,
    pub annotations: HashMap<String, String>,
    pub sandbox: Option<Sandbox>,
    pub sandboxer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    pub sandbox_id: String,
    pub sandboxer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformRequest {
    pub sandbox_id: String,
    pub sandboxer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopRequest {
    pub sandbox_id: String,
    /// Grace period the sandboxer grants the sandbox before killing it.
    pub timeout_secs: u32,
    pub sandboxer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitRequest {
    pub sandbox_id: String,
    pub sandboxer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusRequest {
    pub sandbox_id: String,
    pub verbose: bool,
    pub sandboxer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownRequest {
    pub sandbox_id: String,
    pub sandboxer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsRequest {
    pub sandbox_id: String,
    pub sandboxer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateRequest {
    pub sandbox_id: String,
    pub sandboxer: String,
    pub sandbox: Option<Sandbox>,
    /// Names of the `sandbox` fields to apply.
    pub fields: Vec<String>,
}

sandbox_request!(
    CreateRequest,
    StartRequest,
    PlatformRequest,
    StopRequest,
    WaitRequest,
    StatusRequest,
    ShutdownRequest,
    MetricsRequest,
    UpdateRequest,
);

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateResponse {
    pub sandbox_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartResponse {
    pub sandbox_id: String,
    pub pid: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
    /// Address of the task API served inside the sandbox.
    pub address: String,
    pub version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformResponse {
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopResponse {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitResponse {
    pub sandbox_id: String,
    pub exit_status: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

impl WaitResponse {
    /// Exit record for a sandbox the sandboxer no longer knows about.
    pub fn unknown_exit(sandbox_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            exit_status: UNKNOWN_EXIT_STATUS,
            exited_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusResponse {
    pub sandbox_id: String,
    pub pid: u32,
    /// Sandboxer state string; see [`SandboxState::parse`](crate::state::SandboxState::parse).
    pub state: String,
    pub info: HashMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub extra: Option<Value>,
    pub address: String,
    pub version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownResponse {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsResponse {
    pub metrics: Option<Metrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateResponse {}
