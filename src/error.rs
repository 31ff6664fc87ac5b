use super::*;

/// Failures while reading a text snapshot log.
#[derive(Debug, Error)]
pub enum ParseError {
  #[error("i/o error while reading snapshot log: {0}")]
  Io(#[from] io::Error),
  #[error("module table header (`Base Size Module`) not found")]
  MissingModuleTable,
}

/// Failures while reading or writing the binary trace format.
#[derive(Debug, Error)]
pub enum CodecError {
  #[error("not a binary trace file (magic mismatch)")]
  BadMagic,
  #[error("i/o error in binary trace file: {0}")]
  Io(io::Error),
  #[error("module name is not valid utf-8")]
  NameNotUtf8(#[from] std::string::FromUtf8Error),
  #[error("binary trace file ends prematurely")]
  Truncated,
}

impl From<io::Error> for CodecError {
  fn from(value: io::Error) -> Self {
    match value.kind() {
      io::ErrorKind::UnexpectedEof => Self::Truncated,
      _ => Self::Io(value),
    }
  }
}

/// Failures while loading configuration or compiling its patterns.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config: {0}")]
  Io(#[from] io::Error),
  #[error("failed to decode config json: {0}")]
  Json(#[from] serde_json::Error),
  #[error("invalid pattern `{pattern}`: {source}")]
  Pattern {
    pattern: String,
    #[source]
    source: regex::Error,
  },
}

/// Failures while persisting the symbol cache.
#[derive(Debug, Error)]
pub enum CacheError {
  #[error("i/o error on symbol cache: {0}")]
  Io(#[from] io::Error),
  #[error("failed to encode symbol cache as json: {0}")]
  Json(#[from] serde_json::Error),
  #[error("symbol cache has no backing file")]
  NoBackingFile,
}

/// Errors that can occur when rendering a report.
#[derive(Debug, Error)]
pub enum ReportError {
  #[error("i/o error during report: {0}")]
  Io(#[from] io::Error),
  #[error("failed to encode report as json: {0}")]
  Json(#[from] serde_json::Error),
  #[error("invalid heap handle provided: {0:#X}")]
  UnknownHeap(u64),
}

/// Umbrella error for operations that span several stages.
#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Cache(#[from] CacheError),
  #[error("{path}: {source}")]
  Codec {
    path: PathBuf,
    #[source]
    source: CodecError,
  },
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error("{path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("{path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: ParseError,
  },
  #[error("failed to build worker pool: {0}")]
  Pool(#[from] rayon::ThreadPoolBuildError),
  #[error(transparent)]
  Report(#[from] ReportError),
}
