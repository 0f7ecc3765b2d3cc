use std::path::PathBuf;

/// Failures that stop the engine before any task runs.
///
/// Everything that can go wrong *during* a run (process spawn, scratch
/// directories, collector I/O) is contained per task and turned into an
/// outcome instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{name} not found at: {path:?} (also not in PATH)")]
    MissingBinary { name: String, path: PathBuf },

    #[error("unknown fuzzer {name:?} (available: {available:?})")]
    PluginLoad { name: String, available: Vec<String> },

    #[error("invalid seed list: {0}")]
    SeedList(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
