use std::sync::Arc;

use tokio::net::TcpListener;

use tracehop::propagation::HeaderPropagator;
use tracehop::services::availability::Availability;
use tracehop::services::frontdoor::FrontDoor;
use tracehop::services::inventory::Inventory;
use tracehop::settings::{Role, Settings};
use tracehop::store::{InstrumentedStore, MemoryStore};
use tracehop::transport::{InstrumentedTransport, ReqwestClient};

/// Runs one hop of the tracehop call chain.
#[derive(clap::Args, Debug)]
pub struct Arguments {
    /// Part this process plays in the call chain
    #[arg(short, long, value_enum, default_value_t = Role::Frontdoor)]
    pub role: Role,

    /// Stop the client role after this many requests
    #[arg(long)]
    pub requests: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = tracehop::cli::Cli::<Settings, Arguments>::new(&tracehop::service_info!(), "TRACEHOP_");
    let role = cli.args.role;
    let settings = cli.config;

    let service_info = tracehop::service_info!().with_role(role);
    let telemetry = Arc::new(tracehop::telemetry::init(&service_info, &settings.telemetry)?);
    tracing::dispatcher::set_global_default(telemetry.dispatch().clone())?;

    let propagator = HeaderPropagator::new(&settings.propagation)?;
    let service = &settings.service;
    tracing::info!(%role, version = service_info.version, "starting");

    let router = match role {
        Role::Client => {
            let transport = InstrumentedTransport::new(
                ReqwestClient::new(service.downstream_timeout())?,
                Arc::clone(&telemetry),
                propagator,
            );
            let run = tracehop::services::client::run(
                &transport,
                &service.frontdoor_url,
                service.client_pause(),
                cli.args.requests,
            );
            tokio::select! {
                summary = run => {
                    let summary = summary?;
                    tracing::info!(sent = summary.sent, failed = summary.failed, "client finished");
                }
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
            }
            return Ok(());
        }
        Role::Frontdoor => {
            let transport = InstrumentedTransport::new(
                ReqwestClient::new(service.downstream_timeout())?,
                Arc::clone(&telemetry),
                propagator,
            );
            FrontDoor::new(transport, &service.availability_url, &service.inventory_url)
                .with_latency(service.latency(role))
                .router()
        }
        Role::Availability => Availability::new(Arc::clone(&telemetry), propagator)
            .with_latency(service.latency(role))
            .router(),
        Role::Inventory => {
            let store = MemoryStore::default().with_latency(service.latency(role));
            let store = Arc::new(InstrumentedStore::new(store, Arc::clone(&telemetry)));
            Inventory::new(store, propagator).router()
        }
    };

    let listener = TcpListener::bind(&service.listen_addr).await?;
    tracehop::services::serve(listener, router).await?;

    Ok(())
}
