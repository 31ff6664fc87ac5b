use super::*;

/// Stock allocator entry points of the C runtime and the Windows heap manager.
pub const DEFAULT_ALLOCATOR_PATTERNS: &[&str] = &[
  r"msvcr(?:t|\d+)!_?(?:[mc]|re)alloc",
  r"ntdll!rtl(?:re)?allocateheap",
  r"kernelbase!\w+alloc",
];

/// Modules that allocate on behalf of the tooling itself.
pub const DEFAULT_TRUSTED_MODULES: &[&str] = &["dbghelp.dll"];

/// How hard the duplicate compressor looks for similar stacks.
#[derive(
  Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
  /// Sequence alignment with a leading-run gate.
  #[default]
  Aggressive,
  /// Plain common-prefix comparison.
  Strict,
}

/// Tunables of the duplicate compressor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
  /// Whether the analyzer compresses diff results at all.
  pub enabled: bool,
  pub level: CompressionLevel,
  /// Minimum fraction of a stack the shared leading run must cover.
  pub prefix_fraction: f64,
  /// Similarity ratio a pair must exceed under [`CompressionLevel::Aggressive`].
  pub ratio_cutoff: f64,
}

impl Default for CompressionConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      level: CompressionLevel::Aggressive,
      prefix_fraction: 0.7,
      ratio_cutoff: 0.88,
    }
  }
}

impl CompressionConfig {
  #[must_use]
  pub fn with_level(mut self, level: CompressionLevel) -> Self {
    self.level = level;
    self
  }
}

/// Inputs of the foreign-module classifier.
///
/// Patterns are regular expressions matched case-insensitively against
/// `module!symbol` frame names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
  pub allocator_patterns: Vec<String>,
  /// Path prefix of system images, e.g. `c:\windows`. Modules loaded from
  /// below it count as trusted.
  pub system_dir: Option<String>,
  /// Module file names whose allocations are never reported. These take
  /// precedence over `trusted_patterns`.
  pub trusted_modules: Vec<String>,
  pub trusted_patterns: Vec<String>,
}

impl Default for ClassifierConfig {
  fn default() -> Self {
    Self {
      allocator_patterns: DEFAULT_ALLOCATOR_PATTERNS
        .iter()
        .map(|pattern| (*pattern).to_string())
        .collect(),
      system_dir: None,
      trusted_modules: DEFAULT_TRUSTED_MODULES
        .iter()
        .map(|module| (*module).to_string())
        .collect(),
      trusted_patterns: Vec::new(),
    }
  }
}

impl ClassifierConfig {
  #[must_use]
  pub fn with_allocator_pattern(mut self, pattern: impl Into<String>) -> Self {
    self.allocator_patterns.push(pattern.into());
    self
  }

  #[must_use]
  pub fn with_system_dir(mut self, dir: impl Into<String>) -> Self {
    self.system_dir = Some(dir.into());
    self
  }

  #[must_use]
  pub fn with_trusted_module(mut self, module: impl Into<String>) -> Self {
    self.trusted_modules.push(module.into());
    self
  }

  #[must_use]
  pub fn with_trusted_pattern(mut self, pattern: impl Into<String>) -> Self {
    self.trusted_patterns.push(pattern.into());
    self
  }
}

/// Controls how snapshots are prepared, diffed and reduced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
  pub classifier: ClassifierConfig,
  pub compression: CompressionConfig,
  /// Persisted resolver cache, reloaded on start-up when present.
  pub symbol_cache: Option<PathBuf>,
  /// Upper bound on the batch worker pool; `None` uses one per CPU.
  pub workers: Option<usize>,
}

impl AnalyzerConfig {
  /// Read a JSON config file. Absent fields keep their defaults.
  ///
  /// # Errors
  ///
  /// Returns an error if the file cannot be read or is not valid JSON.
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let file = File::open(path.as_ref())?;
    let config = serde_json::from_reader(BufReader::new(file))?;
    debug!(path = %path.as_ref().display(), "loaded analyzer config");
    Ok(config)
  }

  #[must_use]
  pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
    self.compression = compression;
    self
  }

  #[must_use]
  pub fn with_workers(mut self, workers: usize) -> Self {
    self.workers = Some(workers.max(1));
    self
  }

  /// Explicitly disable duplicate compression.
  #[must_use]
  pub fn without_compression(mut self) -> Self {
    self.compression.enabled = false;
    self
  }
}

/// Compile a pattern case-insensitively, naming it on failure.
pub(crate) fn compile_pattern(pattern: &str) -> Result<Regex, ConfigError> {
  RegexBuilder::new(pattern)
    .case_insensitive(true)
    .build()
    .map_err(|source| ConfigError::Pattern {
      pattern: pattern.to_string(),
      source,
    })
}

pub(crate) fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
  patterns
    .iter()
    .map(|pattern| compile_pattern(pattern))
    .collect()
}

#[cfg(test)]
mod tests {
  use {super::*, std::fs};

  #[test]
  fn partial_json_keeps_defaults() {
    let config: AnalyzerConfig = serde_json::from_str(
      r#"{ "classifier": { "trusted_patterns": ["qtcore4!_hb_alloc"] },
           "compression": { "level": "strict" } }"#,
    )
    .expect("valid config");

    assert_eq!(
      config.classifier.trusted_patterns,
      vec!["qtcore4!_hb_alloc".to_string()]
    );
    assert_eq!(config.classifier.trusted_modules, vec!["dbghelp.dll".to_string()]);
    assert_eq!(config.compression.level, CompressionLevel::Strict);
    assert!((config.compression.ratio_cutoff - 0.88).abs() < f64::EPSILON);
    assert!(config.compression.enabled);
  }

  #[test]
  fn default_allocator_patterns_compile() {
    let patterns = compile_patterns(&ClassifierConfig::default().allocator_patterns)
      .expect("stock patterns compile");

    assert!(patterns.iter().any(|p| p.is_match("MSVCR90!malloc")));
    assert!(patterns.iter().any(|p| p.is_match("ntdll!RtlAllocateHeap")));
    assert!(patterns.iter().any(|p| p.is_match("msvcrt!_realloc")));
    assert!(!patterns.iter().any(|p| p.is_match("app!main")));
  }

  #[test]
  fn invalid_pattern_is_reported() {
    let err = compile_patterns(&["(unclosed".to_string()]).expect_err("must fail");
    assert!(matches!(err, ConfigError::Pattern { ref pattern, .. } if pattern == "(unclosed"));
  }

  #[test]
  fn loads_from_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.json");
    fs::write(&path, r#"{ "workers": 3 }"#).expect("write config");

    let config = AnalyzerConfig::load(&path).expect("load config");
    assert_eq!(config.workers, Some(3));
    assert_eq!(config.compression, CompressionConfig::default());
  }
}
