//! Settings shared by every role of the `tracehop` binary.

use std::time::Duration;

use doku::Document;
use serde::{Deserialize, Serialize};

use crate::propagation::PropagationSettings;
use crate::telemetry::TelemetrySettings;

/// Top level settings file.
#[derive(Debug, Default, Serialize, Deserialize, Document)]
pub struct Settings {
    /// Listener, downstream and simulated-work settings
    #[serde(default)]
    pub service: ServiceSettings,

    /// Trace context header names. Must match across every service of the chain
    #[serde(default)]
    pub propagation: PropagationSettings,

    /// Telemetry settings
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

/// The part a process plays in the call chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Entry point that fans out to availability and inventory
    Frontdoor,
    /// Answers whether a book is available
    Availability,
    /// Counts books in the store, can be toggled into failure
    Inventory,
    /// Load generator calling the front door
    Client,
}

impl Role {
    /// Simulated work per request when none is configured.
    pub fn default_latency(self) -> Duration {
        match self {
            Self::Frontdoor => Duration::from_millis(100),
            Self::Availability => Duration::from_millis(200),
            Self::Inventory => Duration::from_millis(300),
            Self::Client => Duration::ZERO,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Frontdoor => "frontdoor",
            Self::Availability => "availability",
            Self::Inventory => "inventory",
            Self::Client => "client",
        })
    }
}

/// What one process listens on, calls, and pretends to do.
#[derive(Clone, Debug, Serialize, Deserialize, Document)]
#[serde(default)]
pub struct ServiceSettings {
    /// Address the HTTP listener binds to
    #[doku(example = "0.0.0.0:8081")]
    pub listen_addr: String,

    /// Availability endpoint called by the front door
    #[doku(example = "http://availability:8082/available")]
    pub availability_url: String,

    /// Inventory endpoint called by the front door
    #[doku(example = "http://inventory:8083/reserve")]
    pub inventory_url: String,

    /// Front door endpoint called by the client role
    #[doku(example = "http://localhost:8081/reserve")]
    pub frontdoor_url: String,

    /// Ceiling for a single downstream call, in milliseconds. Exceeding it counts as a failed call
    #[doku(example = "4000")]
    pub downstream_timeout_ms: u64,

    /// Simulated work per request in milliseconds. Defaults depend on the role
    #[doku(example = "100")]
    pub latency_ms: Option<u64>,

    /// Pause of the client role after a failed call, in milliseconds
    #[doku(example = "1")]
    pub client_pause_ms: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8081".to_owned(),
            availability_url: "http://availability:8082/available".to_owned(),
            inventory_url: "http://inventory:8083/reserve".to_owned(),
            frontdoor_url: "http://localhost:8081/reserve".to_owned(),
            downstream_timeout_ms: 4000,
            latency_ms: None,
            client_pause_ms: 1,
        }
    }
}

impl ServiceSettings {
    /// [`ServiceSettings::downstream_timeout_ms`] as a duration.
    pub fn downstream_timeout(&self) -> Duration {
        Duration::from_millis(self.downstream_timeout_ms)
    }

    /// The configured latency, or the default of `role`.
    pub fn latency(&self, role: Role) -> Duration {
        self.latency_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| role.default_latency())
    }

    /// [`ServiceSettings::client_pause_ms`] as a duration.
    pub fn client_pause(&self) -> Duration {
        Duration::from_millis(self.client_pause_ms)
    }
}
