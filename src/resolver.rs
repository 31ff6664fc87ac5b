use super::*;

/// Module name reported for addresses outside every loaded image.
pub const NO_MODULE: &str = "<no module>";

/// Answer of a symbol lookup.
///
/// `displacement` is relative to the symbol start when a symbol was found,
/// and relative to the module base otherwise. `module` is the image path, or
/// [`NO_MODULE`].
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
  pub displacement: u64,
  pub module: String,
  pub symbol: Option<String>,
}

impl Resolution {
  /// A miss inside a module: no symbol, displacement from the module base.
  #[must_use]
  pub fn module_offset(modules: &ModuleTable, address: u64) -> Self {
    match modules.map_to_module(address) {
      Some(module) => Self {
        displacement: module.rva(address),
        module: module.path.clone(),
        symbol: None,
      },
      None => Self {
        displacement: 0,
        module: NO_MODULE.to_string(),
        symbol: None,
      },
    }
  }
}

/// Source of symbol names for return addresses.
///
/// Implementations may be slow and may keep state, so lookups take `&self`
/// and callers should avoid resolving the same frame twice.
pub trait SymbolResolver {
  fn resolve(&self, modules: &ModuleTable, address: u64) -> Resolution;
}

impl<R: SymbolResolver + ?Sized> SymbolResolver for &R {
  fn resolve(&self, modules: &ModuleTable, address: u64) -> Resolution {
    (**self).resolve(modules, address)
  }
}

impl<R: SymbolResolver + ?Sized> SymbolResolver for Arc<R> {
  fn resolve(&self, modules: &ModuleTable, address: u64) -> Resolution {
    (**self).resolve(modules, address)
  }
}

/// Resolver for runs without debug information: every lookup misses and
/// degrades to the module-relative offset.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleOffsetResolver;

impl SymbolResolver for ModuleOffsetResolver {
  fn resolve(&self, modules: &ModuleTable, address: u64) -> Resolution {
    Resolution::module_offset(modules, address)
  }
}

/// A stack frame after resolution.
///
/// A frame without a symbol uses the module's file name in its place, so
/// every frame renders as `module!symbol+0xdisp`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ResolvedFrame {
  pub address: u64,
  pub displacement: u64,
  /// Short module name as produced by [`format_module_name`].
  pub module: String,
  /// Full image path as reported by the resolver.
  pub module_path: String,
  pub symbol: String,
}

impl Display for ResolvedFrame {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "{}!{}+{:#x}", self.module, self.symbol, self.displacement)
  }
}

impl ResolvedFrame {
  #[must_use]
  pub fn from_resolution(address: u64, resolution: Resolution) -> Self {
    let symbol = resolution
      .symbol
      .unwrap_or_else(|| base_name(&resolution.module).to_string());

    Self {
      address,
      displacement: resolution.displacement,
      module: format_module_name(&resolution.module),
      module_path: resolution.module,
      symbol,
    }
  }

  /// `module!symbol`, the form pattern matching runs against.
  #[must_use]
  pub fn qualified_name(&self) -> String {
    format!("{}!{}", self.module, self.symbol)
  }

  #[must_use]
  pub fn resolve<R: SymbolResolver + ?Sized>(
    resolver: &R,
    modules: &ModuleTable,
    address: u64,
  ) -> Self {
    Self::from_resolution(address, resolver.resolve(modules, address))
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedSymbol {
  hits: u64,
  module: String,
  resolution: Resolution,
  rva: u64,
}

/// Memoizing front for an expensive resolver.
///
/// Entries are keyed by module and module-relative address, so a cache
/// stays valid across runs where images load at different bases. Addresses
/// outside every module bypass the cache.
#[derive(Debug)]
pub struct CachingResolver<R> {
  entries: DashMap<(String, u64), CachedSymbol>,
  inner: R,
  path: Option<PathBuf>,
}

impl<R: SymbolResolver> SymbolResolver for CachingResolver<R> {
  fn resolve(&self, modules: &ModuleTable, address: u64) -> Resolution {
    let Some(module) = modules.map_to_module(address) else {
      return self.inner.resolve(modules, address);
    };

    let key = (module.key(), module.rva(address));

    if let Some(mut cached) = self.entries.get_mut(&key) {
      cached.hits = cached.hits.saturating_add(1);
      return cached.resolution.clone();
    }

    // No shard lock may be held while the inner resolver runs.
    let resolution = self.inner.resolve(modules, address);

    let mut cached = self.entries.entry(key.clone()).or_insert(CachedSymbol {
      hits: 0,
      module: key.0,
      resolution,
      rva: key.1,
    });

    cached.hits = cached.hits.saturating_add(1);
    cached.resolution.clone()
  }
}

impl<R> CachingResolver<R> {
  /// Write symbol frequencies, most used first.
  ///
  /// # Errors
  ///
  /// Returns an error if the writer fails.
  pub fn dump_stats<W: Write>(&self, mut writer: W) -> io::Result<()> {
    let mut entries = self.snapshot_entries();
    entries.sort_by(|a, b| b.hits.cmp(&a.hits).then(a.rva.cmp(&b.rva)));

    for entry in entries {
      let name = entry
        .resolution
        .symbol
        .as_deref()
        .unwrap_or_else(|| base_name(&entry.resolution.module));
      writeln!(writer, "{}: {}!{}", entry.hits, entry.module, name)?;
    }

    Ok(())
  }

  #[must_use]
  pub fn into_inner(self) -> R {
    self.inner
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  #[must_use]
  pub fn new(inner: R) -> Self {
    Self {
      entries: DashMap::new(),
      inner,
      path: None,
    }
  }

  /// Persist the cache to its backing file.
  ///
  /// # Errors
  ///
  /// Returns an error if there is no backing file or it cannot be written.
  pub fn save(&self) -> Result<(), CacheError> {
    let path = self.path.as_ref().ok_or(CacheError::NoBackingFile)?;
    self.save_to(path)
  }

  /// Persist the cache as JSON to `path`.
  ///
  /// # Errors
  ///
  /// Returns an error if the file cannot be written.
  pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), CacheError> {
    let mut entries = self.snapshot_entries();
    entries.sort_by(|a, b| a.module.cmp(&b.module).then(a.rva.cmp(&b.rva)));

    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    serde_json::to_writer(&mut writer, &entries)?;
    writer.flush()?;

    debug!(
      path = %path.as_ref().display(),
      entries = entries.len(),
      "saved symbol cache"
    );
    Ok(())
  }

  fn snapshot_entries(&self) -> Vec<CachedSymbol> {
    self
      .entries
      .iter()
      .map(|entry| entry.value().clone())
      .collect()
  }

  /// Back the cache with `path`, preloading whatever it already holds.
  ///
  /// An unreadable or corrupt cache file is logged and ignored; the cache
  /// then starts empty and overwrites it on the next save.
  #[must_use]
  pub fn with_cache_file(inner: R, path: impl Into<PathBuf>) -> Self {
    let path = path.into();
    let cache = Self {
      entries: DashMap::new(),
      inner,
      path: Some(path.clone()),
    };

    if !path.exists() {
      return cache;
    }

    match load_entries(&path) {
      Ok(entries) => {
        for entry in entries {
          cache.entries.insert((entry.module.clone(), entry.rva), entry);
        }
        debug!(path = %path.display(), entries = cache.len(), "loaded symbol cache");
      }
      Err(err) => warn!(path = %path.display(), %err, "ignoring unreadable symbol cache"),
    }

    cache
  }
}

fn load_entries(path: &Path) -> Result<Vec<CachedSymbol>, CacheError> {
  let file = File::open(path)?;
  Ok(serde_json::from_reader(BufReader::new(file))?)
}
