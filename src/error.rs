use thiserror::Error;

// every failure the engine can hand back to a caller.
// unseen categories and stale cache entries are recovered where they happen,
// so they never show up here.
#[derive(Debug, Error)]
pub enum PitwiseError {
    #[error("no trained model for driver {driver}, train it first")]
    MissingModel { driver: String },

    #[error("driver {driver} has {rows} usable laps, need at least {required}")]
    InsufficientTrainingData {
        driver: String,
        rows: usize,
        required: usize,
    },

    #[error("race context unavailable: {0}")]
    ContextResolution(String),

    #[error("invalid compound: {0}")]
    InvalidCompound(String),

    #[error("model fit failed: {0}")]
    Fit(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Linfa(#[from] linfa::error::Error),
}

pub type Result<T> = std::result::Result<T, PitwiseError>;
