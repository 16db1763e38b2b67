use std::path::PathBuf;
use thiserror::Error;

/// Unknown key or malformed value while loading a JSON campaign config.
/// Fatal: surfaced to the user with the offending path before the process exits.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown configuration key '{key}' in section '{section}'")]
    UnknownKey { section: String, key: String },
    #[error("wrong value shape for key '{key}' in section '{section}': expected {expected}")]
    WrongShape {
        section: String,
        key: String,
        expected: String,
    },
    #[error("could not read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path:?} as JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Raised when resolving a `"$Tag:value"` JSON reference against the live
/// ISA-KB fails. Fatal at config/witness load time; merely logged and
/// skipped while building the feature indices for a filtered ISA universe.
#[derive(Error, Debug)]
#[error("no instruction scheme found for reference '{0}'")]
pub struct IsaLookupError(pub String);

/// Recoverable: the caller decides whether to retry, count against a ratio,
/// or give up. Never escapes to the CLI on its own.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplingError {
    #[error("slot {0} has no feasible instruction scheme")]
    EmptyFeasibleSet(usize),
    #[error("could not adjust operand width for slot {0}")]
    WidthMismatch(usize),
    #[error("pinned operand at {0:?} conflicts with a must-not-alias neighbor")]
    AliasConflict((usize, String)),
}

/// "Failed to sample any blocks for a non-trivial start point." Raised to
/// the CLI; aborts the current generalization attempt only, never the whole
/// campaign.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct DiscoveryError(pub String);

/// A predictor invocation timed out or raised. Never propagated as a Rust
/// `Err`: it is folded into an in-band `PredictorResult::Error` so the
/// discovery loop can keep going (an error result is always maximally
/// interesting).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("predictor error: {0}")]
pub struct PredictorError(pub String);

/// A broken invariant that should be structurally impossible, e.g. the SAT
/// solver and the naive subsumption check disagreeing in a sanity check.
/// Always fatal.
#[derive(Error, Debug)]
#[error("assertion failure: {0}")]
pub struct AssertionFailure(pub String);
