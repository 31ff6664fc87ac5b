use super::*;

/// Load a snapshot from a text log or a binary trace file, whichever `path`
/// holds.
///
/// # Errors
///
/// Returns an error naming `path` if it cannot be read or decoded.
pub fn load(path: impl AsRef<Path>) -> Result<Snapshot, Error> {
  let path = path.as_ref();

  let binary = codec::is_binary(path).map_err(|source| Error::Io {
    path: path.to_path_buf(),
    source,
  })?;

  if binary {
    codec::load(path).map_err(|source| Error::Codec {
      path: path.to_path_buf(),
      source,
    })
  } else {
    parser::parse_file(path).map_err(|source| Error::Parse {
      path: path.to_path_buf(),
      source,
    })
  }
}

/// Load one input, preferring the binary cache next to a text log. A
/// missing or unreadable cache is rebuilt from the log when `write_cache`
/// is set.
fn prepare_one(path: &Path, write_cache: bool) -> Result<Snapshot, Error> {
  let cache = codec::binary_cache_path(path);

  if cache != path && cache.is_file() {
    match codec::load(&cache) {
      Ok(snapshot) => {
        debug!(path = %cache.display(), "using binary cache");
        return Ok(snapshot);
      }
      Err(err) => warn!(path = %cache.display(), %err, "ignoring unusable binary cache"),
    }
  }

  let snapshot = load(path)?;

  if write_cache && cache != path {
    match codec::save(&snapshot, &cache) {
      Ok(()) => debug!(path = %cache.display(), "wrote binary cache"),
      Err(err) => warn!(path = %cache.display(), %err, "failed to write binary cache"),
    }
  }

  Ok(snapshot)
}

/// Prepare several inputs concurrently on a bounded pool.
///
/// Results come back in the order of `paths`. `workers` caps the pool size;
/// `None` uses one thread per CPU.
///
/// # Errors
///
/// Returns an error if any input fails to load or the pool cannot be
/// started.
pub fn prepare<P>(paths: &[P], workers: Option<usize>, write_cache: bool) -> Result<Vec<Snapshot>, Error>
where
  P: AsRef<Path> + Sync,
{
  let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("heapdiff-worker-{i}"));

  if let Some(workers) = workers {
    builder = builder.num_threads(workers.clamp(1, paths.len().max(1)));
  }

  let pool = builder.build()?;

  debug!(
    inputs = paths.len(),
    threads = pool.current_num_threads(),
    "preparing snapshots"
  );

  pool.install(|| {
    paths
      .par_iter()
      .map(|path| prepare_one(path.as_ref(), write_cache))
      .collect()
  })
}
