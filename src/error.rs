use thiserror::Error;

/// Errors raised anywhere in the layer-parallel bridge.
///
/// Configuration errors are fatal; solver-callback and communication errors
/// are propagated to the caller, who decides whether to log-and-continue
/// (as `BackwardResNetApp` does) or bail out (as the `src/bin` entry points
/// do).
#[derive(Error, Debug)]
pub enum BraidError {
    #[error("step count {steps} is not divisible by rank count {ranks}")]
    StepsNotDivisible { steps: usize, ranks: usize },

    #[error("--serial requires exactly one rank, found {0}")]
    SerialRequiresOneRank(usize),

    #[error("coarsening factor must be >= 2, found {0}")]
    InvalidCFactor(u32),

    #[error("serialized layer of {actual} bytes exceeds advertised layer_data_size {limit}")]
    LayerDataOverflow { actual: usize, limit: usize },

    #[error("pack size mismatch across ranks: local {local}, peer {peer}")]
    PackSizeMismatch { local: usize, peer: usize },

    #[error("tensor shape mismatch on level {level}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        level: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("timer {0:?} started while already timing")]
    TimerReused(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("communication error: {0}")]
    Comm(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("unknown layer kind {0:?} during deserialize")]
    UnknownLayerKind(String),

    #[error("vector has no tensors")]
    EmptyVector,
}

pub type BraidResult<T> = Result<T, BraidError>;
