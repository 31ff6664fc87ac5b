use super::*;

/// An executable image loaded into the snapshotted process.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Module {
  pub base: u64,
  pub path: String,
  pub size: u64,
}

impl Module {
  #[must_use]
  pub fn contains(&self, address: u64) -> bool {
    address >= self.base && address - self.base < self.size
  }

  /// File name component of the image path, as written in the log.
  #[must_use]
  pub fn file_name(&self) -> &str {
    base_name(&self.path)
  }

  /// Lower-cased file name; the identity of a module within a snapshot.
  #[must_use]
  pub fn key(&self) -> String {
    self.file_name().to_lowercase()
  }

  #[must_use]
  pub fn new(base: u64, size: u64, path: impl Into<String>) -> Self {
    Self {
      base,
      path: path.into(),
      size,
    }
  }

  /// Offset of `address` relative to the module's load address.
  #[must_use]
  pub fn rva(&self, address: u64) -> u64 {
    address.wrapping_sub(self.base)
  }
}

/// Modules of one snapshot keyed by [`Module::key`].
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ModuleTable {
  by_key: BTreeMap<String, Module>,
}

impl ModuleTable {
  #[must_use]
  pub fn get(&self, key: &str) -> Option<&Module> {
    self.by_key.get(key)
  }

  /// Register a module, replacing any earlier image with the same file name.
  pub fn insert(&mut self, module: Module) -> Option<Module> {
    self.by_key.insert(module.key(), module)
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.by_key.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Module> {
    self.by_key.values()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.by_key.len()
  }

  /// Find the module whose address range covers `address`.
  #[must_use]
  pub fn map_to_module(&self, address: u64) -> Option<&Module> {
    self.by_key.values().find(|module| module.contains(address))
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }
}

impl FromIterator<Module> for ModuleTable {
  fn from_iter<I: IntoIterator<Item = Module>>(iter: I) -> Self {
    let mut table = Self::new();
    for module in iter {
      table.insert(module);
    }
    table
  }
}

/// Short module name used in `module!symbol` frames: lower-cased file name
/// with a trailing `.dll`/`.exe` removed.
#[must_use]
pub fn format_module_name(path: &str) -> String {
  let name = base_name(path).to_lowercase();

  match name.strip_suffix(".dll").or_else(|| name.strip_suffix(".exe")) {
    Some(stem) => stem.to_string(),
    None => name,
  }
}

/// Logs carry Windows paths, so both separators count.
pub(crate) fn base_name(path: &str) -> &str {
  path.rsplit(['\\', '/']).next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn keys_are_lowercased_file_names() {
    let module = Module::new(0x400000, 0x1000, r"C:\Program Files\App\App.EXE");
    assert_eq!(module.file_name(), "App.EXE");
    assert_eq!(module.key(), "app.exe");
  }

  #[test]
  fn maps_addresses_to_covering_module() {
    let table: ModuleTable = [
      Module::new(0x400000, 0x10000, "app.exe"),
      Module::new(0x7C900000, 0xB2000, r"C:\WINDOWS\system32\ntdll.dll"),
    ]
    .into_iter()
    .collect();

    assert_eq!(
      table.map_to_module(0x40FFFF).map(Module::key).as_deref(),
      Some("app.exe")
    );
    assert_eq!(
      table.map_to_module(0x7C901234).map(Module::key).as_deref(),
      Some("ntdll.dll")
    );
    assert!(table.map_to_module(0x410000).is_none());
    assert!(table.map_to_module(0).is_none());
  }

  #[test]
  fn formats_short_module_names() {
    assert_eq!(format_module_name(r"C:\WINDOWS\system32\NTDLL.DLL"), "ntdll");
    assert_eq!(format_module_name("/opt/app/App.exe"), "app");
    assert_eq!(format_module_name("libfoo.so"), "libfoo.so");
  }

  #[test]
  fn rva_is_relative_to_base() {
    let module = Module::new(0x400000, 0x10000, "app.exe");
    assert_eq!(module.rva(0x401234), 0x1234);
  }
}
