//! Binary trace format.
//!
//! ```text
//! magic        6 bytes, "hdmuyp"
//! modules      u64 count, then per module:
//!                u64 base, u64 size, u64 name length, name bytes
//! heaps        u64 count, then per heap:
//!                u64 handle, u64 trace count, then per trace:
//!                  u64 trace id, u64 stack length, u64 sample count,
//!                  u64 address * stack length,
//!                  (u64 requested, u64 overhead, u64 address) * sample count
//! ```
//!
//! Integers are native byte order. Alias stacks are not persisted and a
//! retained set is written in flattened form.

use super::*;

pub const MAGIC: &[u8; 6] = b"hdmuyp";

/// Upper bound on speculative pre-allocation driven by counts read from disk.
const MAX_PREALLOC: usize = 4096;

/// Encode a snapshot into a fresh buffer.
#[must_use]
pub fn encode(snapshot: &Snapshot) -> Vec<u8> {
  let mut buffer = Vec::with_capacity(4096);

  // Writing into a Vec cannot fail.
  if let Err(err) = encode_into(snapshot, &mut buffer) {
    warn!(%err, "in-memory snapshot encoding failed");
  }

  buffer
}

/// Stream a snapshot into `writer`.
///
/// # Errors
///
/// Returns an error if the writer fails.
pub fn encode_into<W: Write>(snapshot: &Snapshot, mut writer: W) -> Result<(), CodecError> {
  let flat = snapshot.flattened();

  writer.write_all(MAGIC)?;

  write_len(&mut writer, flat.modules().len())?;
  for module in flat.modules().iter() {
    writer.write_u64::<NativeEndian>(module.base)?;
    writer.write_u64::<NativeEndian>(module.size)?;
    write_len(&mut writer, module.path.len())?;
    writer.write_all(module.path.as_bytes())?;
  }

  let heaps: Vec<&Heap> = flat.heaps().collect();
  write_len(&mut writer, heaps.len())?;
  for heap in heaps {
    writer.write_u64::<NativeEndian>(heap.handle())?;
    write_len(&mut writer, heap.len())?;

    for allocation in heap.allocations() {
      writer.write_u64::<NativeEndian>(allocation.trace_id)?;
      write_len(&mut writer, allocation.stack.len())?;
      write_len(&mut writer, allocation.samples.len())?;

      for address in &allocation.stack {
        writer.write_u64::<NativeEndian>(*address)?;
      }

      for sample in &allocation.samples {
        writer.write_u64::<NativeEndian>(sample.requested)?;
        writer.write_u64::<NativeEndian>(sample.overhead)?;
        writer.write_u64::<NativeEndian>(sample.address)?;
      }
    }
  }

  writer.flush()?;

  debug!(
    modules = flat.modules().len(),
    traces = flat.trace_count(),
    "encoded binary snapshot"
  );

  Ok(())
}

/// Decode a snapshot from an in-memory buffer.
///
/// # Errors
///
/// Returns [`CodecError::BadMagic`] if the buffer does not start with the
/// magic token and [`CodecError::Truncated`] if it ends early.
pub fn decode(bytes: &[u8]) -> Result<Snapshot, CodecError> {
  decode_from(bytes)
}

/// Decode a snapshot from a reader.
///
/// # Errors
///
/// See [`decode`].
pub fn decode_from<R: Read>(mut reader: R) -> Result<Snapshot, CodecError> {
  let mut magic = [0u8; MAGIC.len()];
  reader.read_exact(&mut magic).map_err(|err| match err.kind() {
    io::ErrorKind::UnexpectedEof => CodecError::BadMagic,
    _ => CodecError::Io(err),
  })?;

  if &magic != MAGIC {
    return Err(CodecError::BadMagic);
  }

  let mut builder = SnapshotBuilder::new();

  let module_count = reader.read_u64::<NativeEndian>()?;
  for _ in 0..module_count {
    let base = reader.read_u64::<NativeEndian>()?;
    let size = reader.read_u64::<NativeEndian>()?;
    let name_len = reader.read_u64::<NativeEndian>()?;

    let mut name = Vec::with_capacity(prealloc(name_len));
    let read = (&mut reader).take(name_len).read_to_end(&mut name)?;
    if u64::try_from(read).ok() != Some(name_len) {
      return Err(CodecError::Truncated);
    }

    builder.insert_module(Module::new(base, size, String::from_utf8(name)?));
  }

  let heap_count = reader.read_u64::<NativeEndian>()?;
  for _ in 0..heap_count {
    let handle = reader.read_u64::<NativeEndian>()?;
    let trace_count = reader.read_u64::<NativeEndian>()?;
    let mut heap = Heap::new(handle);

    for _ in 0..trace_count {
      let trace_id = reader.read_u64::<NativeEndian>()?;
      let stack_len = reader.read_u64::<NativeEndian>()?;
      let sample_count = reader.read_u64::<NativeEndian>()?;

      let mut stack = Vec::with_capacity(prealloc(stack_len));
      for _ in 0..stack_len {
        stack.push(reader.read_u64::<NativeEndian>()?);
      }

      let mut samples = Vec::with_capacity(prealloc(sample_count));
      for _ in 0..sample_count {
        let requested = reader.read_u64::<NativeEndian>()?;
        let overhead = reader.read_u64::<NativeEndian>()?;
        let address = reader.read_u64::<NativeEndian>()?;
        samples.push(Sample::new(requested, overhead, address));
      }

      heap.record(Allocation::new(trace_id, stack).with_samples(samples));
    }

    builder.insert_heap(heap);
  }

  Ok(builder.finish())
}

/// Whether the file at `path` starts with the binary magic token.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn is_binary(path: impl AsRef<Path>) -> io::Result<bool> {
  let mut file = File::open(path)?;
  let mut magic = [0u8; MAGIC.len()];

  match file.read_exact(&mut magic) {
    Ok(()) => Ok(&magic == MAGIC),
    Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
    Err(err) => Err(err),
  }
}

/// Location of the binary cache that belongs to a text log: the same file
/// name with a `.bin` extension, next to the log.
#[must_use]
pub fn binary_cache_path(log: impl AsRef<Path>) -> PathBuf {
  log.as_ref().with_extension("bin")
}

/// Load a binary snapshot through a read-only memory map.
///
/// # Errors
///
/// Returns an error if the file cannot be mapped or is not a valid binary
/// trace file.
pub fn load(path: impl AsRef<Path>) -> Result<Snapshot, CodecError> {
  let file = File::open(path.as_ref())?;

  if file.metadata()?.len() == 0 {
    return Err(CodecError::BadMagic);
  }

  // SAFETY: the mapping is read-only and dropped before this function
  // returns; cache files are not modified while a run is decoding them.
  let mmap = unsafe { Mmap::map(&file)? };

  let snapshot = decode(&mmap)?;
  debug!(
    path = %path.as_ref().display(),
    traces = snapshot.trace_count(),
    "loaded binary snapshot"
  );
  Ok(snapshot)
}

/// Write a snapshot to `path` in binary form.
///
/// # Errors
///
/// Returns an error if the file cannot be created or written.
pub fn save(snapshot: &Snapshot, path: impl AsRef<Path>) -> Result<(), CodecError> {
  let file = OpenOptions::new()
    .create(true)
    .write(true)
    .truncate(true)
    .open(path.as_ref())?;

  encode_into(snapshot, BufWriter::new(file))?;
  debug!(path = %path.as_ref().display(), "saved binary snapshot");
  Ok(())
}

fn prealloc(count: u64) -> usize {
  usize::try_from(count).unwrap_or(usize::MAX).min(MAX_PREALLOC)
}

fn write_len<W: Write>(writer: &mut W, len: usize) -> io::Result<()> {
  let len = u64::try_from(len).map_err(|_| io::Error::other("length exceeds u64"))?;
  writer.write_u64::<NativeEndian>(len)
}
