use super::*;

/// Why the classifier kept or dropped a trace.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Decision {
  /// The stack ended while still inside allocator frames.
  AllocatorOnly,
  /// The first caller of the allocator is not trusted.
  Foreign,
  /// No frame matched an allocator pattern.
  NoAllocator,
  /// The allocator was called from a trusted module.
  TrustedModule,
  /// A trusted pattern matched at or beyond the allocator's caller.
  TrustedPattern,
}

impl Decision {
  /// Whether the trace should be reported.
  #[must_use]
  pub fn is_kept(self) -> bool {
    matches!(self, Self::AllocatorOnly | Self::Foreign | Self::NoAllocator)
  }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum WalkState {
  AtAllocator,
  Searching,
}

/// Heuristic foreign-module filter.
///
/// Walks a stack looking for a known allocator entry point, skips chained
/// allocator shims, then judges the first caller: trusted modules and
/// trusted symbol patterns are dropped, anything else is kept as a leak
/// candidate.
#[derive(Debug)]
pub struct Classifier<R> {
  allocator_patterns: Vec<Regex>,
  modules: Arc<ModuleTable>,
  resolver: R,
  system_dir: Option<String>,
  trusted_modules: HashSet<String>,
  trusted_patterns: Vec<Regex>,
}

impl<R: SymbolResolver> Classifier<R> {
  /// Whether `allocation` should be reported.
  #[must_use]
  pub fn classify(&self, allocation: &Allocation) -> bool {
    let decision = self.decide(&allocation.stack);
    tracing::trace!(
      trace_id = format_args!("{:#x}", allocation.trace_id),
      ?decision,
      "classified trace"
    );
    decision.is_kept()
  }

  /// Classify a raw stack, resolving frames lazily.
  #[must_use]
  pub fn decide(&self, stack: &[u64]) -> Decision {
    self.decide_frames(
      stack
        .iter()
        .map(|address| ResolvedFrame::resolve(&self.resolver, &self.modules, *address)),
    )
  }

  /// Run the frame walk over already resolved frames.
  pub fn decide_frames<I>(&self, frames: I) -> Decision
  where
    I: IntoIterator<Item = ResolvedFrame>,
  {
    let mut frames = frames.into_iter();
    let mut state = WalkState::Searching;

    while let Some(frame) = frames.next() {
      let name = frame.qualified_name();
      let is_allocator = matches_any(&self.allocator_patterns, &name);

      match (state, is_allocator) {
        (WalkState::Searching, true) => state = WalkState::AtAllocator,
        (WalkState::Searching, false) | (WalkState::AtAllocator, true) => {}
        (WalkState::AtAllocator, false) => {
          if self.is_trusted_module(&frame.module_path) {
            return Decision::TrustedModule;
          }

          if matches_any(&self.trusted_patterns, &name)
            || frames.any(|outer| matches_any(&self.trusted_patterns, &outer.qualified_name()))
          {
            return Decision::TrustedPattern;
          }

          return Decision::Foreign;
        }
      }
    }

    match state {
      WalkState::Searching => Decision::NoAllocator,
      WalkState::AtAllocator => Decision::AllocatorOnly,
    }
  }

  fn is_trusted_module(&self, path: &str) -> bool {
    if self
      .trusted_modules
      .contains(&base_name(path).to_lowercase())
    {
      return true;
    }

    self
      .system_dir
      .as_deref()
      .is_some_and(|dir| path.to_lowercase().starts_with(dir))
  }

  /// Build a classifier for traces of a snapshot with `modules`.
  ///
  /// # Errors
  ///
  /// Returns an error if one of the configured patterns does not compile.
  pub fn new(
    config: &ClassifierConfig,
    modules: Arc<ModuleTable>,
    resolver: R,
  ) -> Result<Self, ConfigError> {
    Ok(Self {
      allocator_patterns: compile_patterns(&config.allocator_patterns)?,
      modules,
      resolver,
      system_dir: config.system_dir.as_deref().map(str::to_lowercase),
      trusted_modules: config
        .trusted_modules
        .iter()
        .map(|module| module.to_lowercase())
        .collect(),
      trusted_patterns: compile_patterns(&config.trusted_patterns)?,
    })
  }
}

/// Keeps traces with at least one frame matching a pattern.
#[derive(Debug)]
pub struct GrepFilter<R> {
  modules: Arc<ModuleTable>,
  pattern: Regex,
  resolver: R,
}

impl<R: SymbolResolver> GrepFilter<R> {
  #[must_use]
  pub fn matches(&self, allocation: &Allocation) -> bool {
    allocation.stack.iter().any(|address| {
      let frame = ResolvedFrame::resolve(&self.resolver, &self.modules, *address);
      self.pattern.is_match(&frame.qualified_name())
    })
  }

  /// # Errors
  ///
  /// Returns an error if `pattern` does not compile.
  pub fn new(pattern: &str, modules: Arc<ModuleTable>, resolver: R) -> Result<Self, ConfigError> {
    let pattern = compile_pattern(pattern)?;

    Ok(Self {
      modules,
      pattern,
      resolver,
    })
  }
}

fn matches_any(patterns: &[Regex], name: &str) -> bool {
  patterns.iter().any(|pattern| pattern.is_match(name))
}
