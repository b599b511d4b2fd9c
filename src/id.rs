//! Hex codec for trace and span identifiers.
//!
//! The wire form is strict: exactly 32 (trace) or 16 (span) lowercase hex
//! characters, never the all-zero value. Anything else is rejected with
//! [`Error::MalformedIdentifier`], which callers treat as "identifier absent".

use opentelemetry::trace::{SpanId, TraceId};
use snafu::{ensure, Snafu};

/// Identifier decoding errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The string is not a valid hex identifier of the expected width.
    #[snafu(display("Malformed {kind} {value:?}: {reason}"))]
    MalformedIdentifier {
        /// Which identifier was being decoded
        kind: &'static str,
        /// The rejected input
        value: String,
        /// What was wrong with it
        reason: &'static str,
    },
}

/// A fixed-width identifier with a lowercase hex text form.
pub trait HexIdentifier: Sized + Copy {
    /// Human readable name used in errors.
    const KIND: &'static str;

    /// Number of hex characters in the text form.
    const WIDTH: usize;

    /// Lowercase hex text form.
    fn encode(&self) -> String;

    /// Parse the text form.
    ///
    /// # Errors
    /// - `MalformedIdentifier` on wrong width, non-lowercase-hex characters, or the zero value.
    fn decode(value: &str) -> Result<Self, Error>;
}

impl HexIdentifier for TraceId {
    const KIND: &'static str = "trace id";
    const WIDTH: usize = 32;

    fn encode(&self) -> String {
        hex::encode(self.to_bytes())
    }

    fn decode(value: &str) -> Result<Self, Error> {
        decode_fixed::<16>(Self::KIND, value).map(TraceId::from_bytes)
    }
}

impl HexIdentifier for SpanId {
    const KIND: &'static str = "span id";
    const WIDTH: usize = 16;

    fn encode(&self) -> String {
        hex::encode(self.to_bytes())
    }

    fn decode(value: &str) -> Result<Self, Error> {
        decode_fixed::<8>(Self::KIND, value).map(SpanId::from_bytes)
    }
}

fn decode_fixed<const N: usize>(kind: &'static str, value: &str) -> Result<[u8; N], Error> {
    ensure!(
        value.len() == N * 2,
        MalformedIdentifierSnafu {
            kind,
            value,
            reason: "wrong width",
        }
    );
    ensure!(
        value
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')),
        MalformedIdentifierSnafu {
            kind,
            value,
            reason: "not lowercase hex",
        }
    );

    let mut bytes = [0u8; N];
    if hex::decode_to_slice(value, &mut bytes).is_err() {
        return MalformedIdentifierSnafu {
            kind,
            value,
            reason: "not lowercase hex",
        }
        .fail();
    }

    ensure!(
        bytes != [0u8; N],
        MalformedIdentifierSnafu {
            kind,
            value,
            reason: "all-zero identifier",
        }
    );

    Ok(bytes)
}
