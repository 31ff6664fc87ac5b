use super::*;

const MODULE_TABLE_HEADER: &str = "Base Size Module";
const HEAP_END_MARKER: &str = "End of data for heap";
const ALIAS_MARKER: &str = "Alias";

static HEAP_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"Heap ([0-9A-Fa-f]+) Hogs").expect("valid regex"));

static STAT_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(
    r"([0-9A-Fa-f]+) bytes \+ ([0-9A-Fa-f]+) at ([0-9A-Fa-f]+) by BackTrace([0-9A-Fa-f]+)",
  )
  .expect("valid regex")
});

static MODULE_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^\s*([0-9A-Fa-f]+)\s+([0-9A-Fa-f]+)\s+(\S.*?)\s*$").expect("valid regex")
});

/// Parse a snapshot log from disk.
///
/// # Errors
///
/// Fails when the file cannot be read or has no module table.
pub fn parse_file(path: impl AsRef<Path>) -> Result<Snapshot, ParseError> {
  let file = File::open(path.as_ref())?;
  debug!(path = %path.as_ref().display(), "parsing snapshot log");
  parse(BufReader::new(file))
}

/// Parse a snapshot log in a single forward pass.
///
/// Unrecognised and malformed lines are skipped. Only a missing module table
/// header is an error.
///
/// # Errors
///
/// Returns [`ParseError::MissingModuleTable`] when the header never appears,
/// or [`ParseError::Io`] when the reader fails.
pub fn parse<R: BufRead>(reader: R) -> Result<Snapshot, ParseError> {
  let mut lines = LineReader::new(reader);
  let mut builder = SnapshotBuilder::new();

  loop {
    match lines.next_line()? {
      Some(line) if line.contains(MODULE_TABLE_HEADER) => break,
      Some(_) => {}
      None => return Err(ParseError::MissingModuleTable),
    }
  }

  let mut current = None;

  while let Some(line) = lines.next_line()? {
    if line.starts_with("*-") {
      current = Some(line);
      break;
    }

    // Module rows may carry the comment prefix of the header above them.
    let row = line.strip_prefix("//").unwrap_or(&line);

    if row.trim().is_empty() {
      continue;
    }

    match parse_module(row) {
      Some(module) => builder.insert_module(module),
      None if is_skippable(&line) => {}
      None => tracing::trace!(%line, "skipping malformed module line"),
    }
  }

  debug!(modules = builder.module_count(), "module table parsed");

  let mut heap: Option<Heap> = None;

  while let Some(line) = current.take() {
    if let Some(handle) = parse_heap_header(&line) {
      if let Some(done) = heap.replace(Heap::new(handle)) {
        finish_heap(&mut builder, done);
      }
      debug!(handle = format_args!("{handle:#X}"), "heap section started");
    } else if is_heap_end(&line) {
      if let Some(done) = heap.take() {
        finish_heap(&mut builder, done);
      }
    } else if let Some(open) = heap.as_mut() {
      match parse_stat(&line) {
        Some((trace_id, sample)) => {
          let stacks = read_stacks(&mut lines)?;
          open.record(
            Allocation::new(trace_id, stacks.primary)
              .with_alias_stacks(stacks.aliases)
              .with_samples(vec![sample]),
          );
        }
        None => tracing::trace!(%line, "skipping unrecognised heap line"),
      }
    }

    current = lines.next_significant()?;
  }

  if let Some(done) = heap {
    finish_heap(&mut builder, done);
  }

  Ok(builder.finish())
}

fn finish_heap(builder: &mut SnapshotBuilder, heap: Heap) {
  debug!(
    handle = format_args!("{:#X}", heap.handle()),
    traces = heap.len(),
    "heap section finished"
  );
  builder.insert_heap(heap);
}

fn is_heap_end(line: &str) -> bool {
  line
    .trim_start_matches(['*', '-', ' '])
    .starts_with(HEAP_END_MARKER)
}

fn is_skippable(line: &str) -> bool {
  line.trim().is_empty() || line.starts_with("//")
}

fn parse_hex(value: &str) -> Option<u64> {
  let value = value.trim();
  let value = value
    .strip_prefix("0x")
    .or_else(|| value.strip_prefix("0X"))
    .unwrap_or(value);
  u64::from_str_radix(value, 16).ok()
}

fn parse_heap_header(line: &str) -> Option<u64> {
  let captures = HEAP_RE.captures(line)?;
  parse_hex(&captures[1])
}

fn parse_module(line: &str) -> Option<Module> {
  let captures = MODULE_RE.captures(line)?;
  Some(Module::new(
    parse_hex(&captures[1])?,
    parse_hex(&captures[2])?,
    &captures[3],
  ))
}

fn parse_stat(line: &str) -> Option<(TraceId, Sample)> {
  let captures = STAT_RE.captures(line)?;
  let requested = parse_hex(&captures[1])?;
  let overhead = parse_hex(&captures[2])?;
  let address = parse_hex(&captures[3])?;
  let trace_id = parse_hex(&captures[4])?;
  Some((trace_id, Sample::new(requested, overhead, address)))
}

#[derive(Debug, Default)]
struct Stacks {
  aliases: Vec<Vec<u64>>,
  primary: Vec<u64>,
}

/// Consume the tab-indented stack that may follow a stat line.
///
/// The stack ends at the first blank or unindented line, which is left in
/// place for the caller.
fn read_stacks<R: BufRead>(lines: &mut LineReader<R>) -> Result<Stacks, ParseError> {
  let mut stacks = Stacks::default();

  while let Some(line) = lines.peek()? {
    let content = line.trim();

    if content.starts_with(ALIAS_MARKER) {
      stacks.aliases.push(Vec::new());
    } else if line.starts_with('\t') && !content.is_empty() {
      let token = content.split_whitespace().next().unwrap_or(content);

      match parse_hex(token) {
        Some(address) => match stacks.aliases.last_mut() {
          Some(alias) => alias.push(address),
          None => stacks.primary.push(address),
        },
        None => warn!(line = %content, "ignoring non-address stack line"),
      }
    } else {
      break;
    }

    lines.consume();
  }

  Ok(stacks)
}

/// Line source with a single line of lookahead.
struct LineReader<R> {
  buffer: Vec<u8>,
  peeked: Option<String>,
  reader: R,
}

impl<R: BufRead> LineReader<R> {
  fn consume(&mut self) {
    self.peeked = None;
  }

  fn new(reader: R) -> Self {
    Self {
      buffer: Vec::new(),
      peeked: None,
      reader,
    }
  }

  fn next_line(&mut self) -> io::Result<Option<String>> {
    if let Some(line) = self.peeked.take() {
      return Ok(Some(line));
    }
    self.read_raw()
  }

  /// Next line that is neither blank nor a `//` comment.
  fn next_significant(&mut self) -> io::Result<Option<String>> {
    while let Some(line) = self.next_line()? {
      if !is_skippable(&line) {
        return Ok(Some(line));
      }
    }
    Ok(None)
  }

  fn peek(&mut self) -> io::Result<Option<&str>> {
    if self.peeked.is_none() {
      self.peeked = self.read_raw()?;
    }
    Ok(self.peeked.as_deref())
  }

  fn read_raw(&mut self) -> io::Result<Option<String>> {
    self.buffer.clear();

    if self.reader.read_until(b'\n', &mut self.buffer)? == 0 {
      return Ok(None);
    }

    let line = String::from_utf8_lossy(&self.buffer);
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
  }
}
