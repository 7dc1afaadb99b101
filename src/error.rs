//! Error types and process exit codes.

use std::path::PathBuf;
use thiserror::Error;

/// Which per-iteration quantity tripped the stability check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StabilityQuantity {
    FlowDetach,
    FlowDeposit,
    TransportRate,
    SplashDetach,
    SplashDeposit,
    SlumpDetach,
    ToppleDetach,
}

impl std::fmt::Display for StabilityQuantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FlowDetach => "flow detachment",
            Self::FlowDeposit => "flow deposition",
            Self::TransportRate => "transport rate",
            Self::SplashDetach => "splash detachment",
            Self::SplashDeposit => "splash deposition",
            Self::SlumpDetach => "slump detachment",
            Self::ToppleDetach => "topple detachment",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error("bad command line parameter: {0}")]
    BadCliParameter(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot read input file {path}: {reason}")]
    MissingInput { path: PathBuf, reason: String },

    #[error("cannot allocate simulation memory: {0}")]
    OutOfMemory(String),

    #[error("output I/O failure on {path}: {source}")]
    OutputIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("numerical stability breach: mean per-cell {quantity} was {value:.3} mm at iteration {iteration} (cap {cap} mm)")]
    Stability {
        quantity: StabilityQuantity,
        value: f64,
        cap: f64,
        iteration: u64,
    },

    #[error("mass balance drift exceeded the hard cap: {quantity} drifted by {drift:.6} mm per cell at iteration {iteration}")]
    MassBalance {
        quantity: &'static str,
        drift: f64,
        iteration: u64,
    },
}

impl SimError {
    /// Distinct process exit code per failure family.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BadCliParameter(_) => 1,
            Self::Config(_) => 2,
            Self::MissingInput { .. } => 3,
            Self::OutOfMemory(_) => 4,
            Self::OutputIo { .. } => 5,
            Self::Stability { .. } => 6,
            Self::MassBalance { .. } => 7,
        }
    }
}

pub type Result<T> = std::result::Result<T, SimError>;
