/*!
Tracehop is a small chain of HTTP services wired together by an instrumented transport.

Every outbound call goes through [`transport::InstrumentedTransport`], which:
 * continues the trace found in the request headers, or starts a new one
 * records a client span and re-injects the trace id plus its own span id
 * counts the request by method, path and status class
 * logs one line correlated with the span

Trace context travels in two plain headers (see [`propagation`]) instead of W3C `traceparent`,
so that services which only know about those two headers can still take part.

### Services

The `tracehop` binary runs one of four roles, picked with `--role`:

 * `frontdoor`: `GET /reserve` fans out to availability and inventory and aggregates the result
 * `availability`: `GET /available` answers after a fixed delay
 * `inventory`: `GET /reserve` counts books in the store, `/toggle` makes the store fail
 * `client`: keeps calling the front door

```sh
tracehop --generate ./tracehop.toml
TRACEHOP_SERVICE__LISTEN_ADDR=0.0.0.0:8082 tracehop --role availability --config ./tracehop.toml
```

### Telemetry

There is no global tracer or meter. [`telemetry::init`] builds a [`telemetry::Telemetry`] client
which is handed to every component that records something:

```rust,no_run
use std::sync::Arc;
use std::time::Duration;

use tracehop::propagation::HeaderPropagator;
use tracehop::transport::{InstrumentedTransport, ReqwestClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let service_info = tracehop::service_info!();
    let settings = tracehop::telemetry::TelemetrySettings::default();
    let telemetry = Arc::new(tracehop::telemetry::init(&service_info, &settings)?);

    let transport = InstrumentedTransport::new(
        ReqwestClient::new(Duration::from_secs(4))?,
        telemetry,
        HeaderPropagator::default(),
    );
    let request = tracehop::transport::get("http://localhost:8082/available")?;
    let response = transport.send(request).await?;
    println!("{}", response.status());

    Ok(())
}
```
*/
#![deny(
    future_incompatible,
    deprecated_safe,
    rust_2018_compatibility,
    rust_2018_idioms,
    rust_2021_compatibility,
    rust_2024_compatibility
)]
#![deny(missing_docs)]

pub mod cli;
pub mod config;
pub mod id;
pub mod metrics;
pub mod propagation;
pub mod services;
pub mod settings;
pub mod span;
pub mod store;
pub mod telemetry;
pub mod transport;

/// Config and CLI initialization errors
#[derive(Debug, snafu::Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Figment could not extract a config from the file with env overrides
    #[snafu(display("Could not load application configuration: {source}"))]
    ConfigLoad {
        /// The source figment error
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },

    /// The config file could not be read
    #[snafu(display("Could not read the config file at {path:?}: {source}"))]
    ConfigFileRead {
        /// path of the config file
        path: std::path::PathBuf,
        /// the IO error that occurred
        source: std::io::Error,
    },

    /// Writing to the config file was not possible
    #[snafu(display("Could not write to the config file at {path:?}: {source}"))]
    ConfigFileWrite {
        /// path where the config file was trying to be written to
        path: std::path::PathBuf,
        /// the IO error that occurred
        source: std::io::Error,
    },
}

/// Service information collected from the build.
#[derive(Clone, Debug, Default)]
pub struct ServiceInfo {
    /// The name of the crate the service was built from.
    pub name: &'static str,

    /// The service identifier as reported in telemetry resources.
    ///
    /// Starts out as [`ServiceInfo::name`] with hyphens (`-`) replaced by underscores (`_`);
    /// see [`ServiceInfo::with_role`].
    pub name_in_metrics: String,

    /// The version of the service.
    pub version: &'static str,

    /// Service author.
    pub author: &'static str,

    /// The description of the service.
    pub description: &'static str,
}

impl ServiceInfo {
    /// Suffix the reported service name with the role this process plays in the chain, so each
    /// hop shows up as its own service in the collector.
    pub fn with_role(mut self, role: impl std::fmt::Display) -> Self {
        self.name_in_metrics = format!("{}_{role}", self.name_in_metrics);
        self
    }
}

/**
Creates [`ServiceInfo`] from the information in the `Cargo.toml` manifest of the service.

```rust
let service_info = tracehop::service_info!();
assert_eq!(service_info.name, "tracehop");
assert_eq!(service_info.with_role("frontdoor").name_in_metrics, "tracehop_frontdoor");
```
*/
#[macro_export]
macro_rules! service_info {
    () => {
        $crate::ServiceInfo {
            name: env!("CARGO_PKG_NAME"),
            name_in_metrics: env!("CARGO_PKG_NAME").replace("-", "_"),
            version: env!("CARGO_PKG_VERSION"),
            author: env!("CARGO_PKG_AUTHORS"),
            description: env!("CARGO_PKG_DESCRIPTION"),
        }
    };
}
