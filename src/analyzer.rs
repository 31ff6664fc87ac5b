use super::*;

/// Customizes an [`AnalyzerConfig`] one knob at a time.
#[derive(Debug, Default)]
pub struct AnalyzerBuilder {
  config: AnalyzerConfig,
}

impl AnalyzerBuilder {
  #[must_use]
  pub fn compression_level(mut self, level: CompressionLevel) -> Self {
    self.config.compression.level = level;
    self
  }

  /// Build the analyzer, checking every configured pattern up front.
  ///
  /// # Errors
  ///
  /// Returns an error if an allocator or trusted pattern does not compile.
  pub fn finish(self) -> Result<Analyzer, ConfigError> {
    Analyzer::with_config(self.config)
  }

  /// Report near-duplicate traces individually.
  #[must_use]
  pub fn keep_duplicates(mut self, keep: bool) -> Self {
    self.config.compression.enabled = !keep;
    self
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  #[must_use]
  pub fn trusted_pattern(mut self, pattern: impl Into<String>) -> Self {
    self.config.classifier.trusted_patterns.push(pattern.into());
    self
  }

  #[must_use]
  pub fn with_config(mut self, config: AnalyzerConfig) -> Self {
    self.config = config;
    self
  }
}

/// Turns a pair of snapshots into the leak candidates of the later one.
#[derive(Debug, Clone)]
pub struct Analyzer {
  config: AnalyzerConfig,
}

impl Analyzer {
  #[must_use]
  pub fn builder() -> AnalyzerBuilder {
    AnalyzerBuilder::new()
  }

  #[must_use]
  pub fn config(&self) -> &AnalyzerConfig {
    &self.config
  }

  /// Traces of `later` with samples absent from `baseline`, minus traces
  /// the classifier does not attribute to foreign code, with near-duplicate
  /// traces folded together when compression is enabled.
  ///
  /// # Errors
  ///
  /// Returns an error if a configured pattern does not compile.
  pub fn diff<R: SymbolResolver>(
    &self,
    baseline: &Snapshot,
    later: &Snapshot,
    resolver: R,
  ) -> Result<Snapshot, ConfigError> {
    let classifier = Classifier::new(
      &self.config.classifier,
      Arc::clone(later.modules()),
      resolver,
    )?;

    let mut delta = diff(baseline, later, |allocation| classifier.classify(allocation));

    if self.config.compression.enabled {
      compress(&mut delta, &self.config.compression);
    }

    info!(
      heaps = delta.heaps().count(),
      traces = delta.trace_count(),
      reported = delta.heaps().map(|heap| delta.reported(heap).count()).sum::<usize>(),
      "diffed snapshots"
    );

    Ok(delta)
  }

  #[must_use]
  pub fn new() -> Self {
    Self {
      config: AnalyzerConfig::default(),
    }
  }

  /// # Errors
  ///
  /// Returns an error if a configured pattern does not compile.
  pub fn with_config(config: AnalyzerConfig) -> Result<Self, ConfigError> {
    compile_patterns(&config.classifier.allocator_patterns)?;
    compile_patterns(&config.classifier.trusted_patterns)?;
    Ok(Self { config })
  }
}

impl Default for Analyzer {
  fn default() -> Self {
    Self::new()
  }
}
