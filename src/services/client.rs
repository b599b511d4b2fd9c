//! Load generator: calls the front door in a loop through the instrumented transport.

use std::time::Duration;

use crate::transport::{self, InstrumentedTransport};

/// What a finished run did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Calls made
    pub sent: u64,
    /// Calls without a `2xx` answer
    pub failed: u64,
}

/// Call `url` until `limit` requests were sent, forever if there is no limit.
///
/// Every call starts a new trace. A call without a response is followed by `pause`; calls that
/// got a response, of any status, are followed immediately by the next one.
///
/// # Errors
/// - `BuildRequest` if `url` is not a valid URI.
/// - `NoDestination` if `url` has no host.
#[allow(tail_expr_drop_order)]
pub async fn run(
    transport: &InstrumentedTransport,
    url: &str,
    pause: Duration,
    limit: Option<u64>,
) -> Result<RunSummary, transport::Error> {
    // Reject bad URLs before the first call.
    let probe = transport::get(url)?;
    if probe.uri().host().is_none() {
        return transport::NoDestinationSnafu { uri: url }.fail();
    }

    let telemetry = transport.telemetry();
    let mut summary = RunSummary::default();
    while limit.map_or(true, |limit| summary.sent < limit) {
        summary.sent += 1;
        match transport.send(transport::get(url)?).await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                summary.failed += 1;
                let status = response.status().as_u16();
                telemetry.in_scope(|| tracing::debug!(status, "front door refused"));
            }
            Err(err) => {
                summary.failed += 1;
                telemetry.in_scope(|| tracing::warn!(%err, "front door unreachable"));
                tokio::time::sleep(pause).await;
            }
        }
    }

    Ok(summary)
}
