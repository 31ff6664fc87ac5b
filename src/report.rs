use super::*;

/// One reported trace, as exported to JSON.
#[derive(Debug, Serialize)]
pub struct TraceReport {
  pub addresses: Vec<u64>,
  pub frames: Vec<String>,
  pub overhead_bytes: u64,
  pub requested_bytes: u64,
  pub samples: usize,
  pub trace_id: TraceId,
}

impl TraceReport {
  /// Summarize a surviving trace of `heap`, folding in the samples it
  /// absorbed.
  #[must_use]
  pub fn new(
    snapshot: &Snapshot,
    heap: &Heap,
    allocation: &Allocation,
    resolver: &dyn SymbolResolver,
  ) -> Self {
    let mut merged = allocation.samples.clone();
    merged.extend_from_slice(snapshot.absorbed(heap.handle(), allocation.trace_id));

    Self {
      addresses: merged.iter().map(|sample| sample.address).collect(),
      frames: allocation
        .stack
        .iter()
        .map(|address| {
          ResolvedFrame::resolve(resolver, snapshot.modules(), *address).to_string()
        })
        .collect(),
      overhead_bytes: merged
        .iter()
        .fold(0u64, |acc, sample| acc.saturating_add(sample.overhead)),
      requested_bytes: merged
        .iter()
        .fold(0u64, |acc, sample| acc.saturating_add(sample.requested)),
      samples: merged.len(),
      trace_id: allocation.trace_id,
    }
  }
}

#[derive(Debug, Serialize)]
struct HeapReport {
  handle: u64,
  traces: Vec<TraceReport>,
}

/// Consumer of analysis results.
pub trait ReportSink {
  /// # Errors
  ///
  /// Returns a `ReportError` if the report cannot be rendered or if the
  /// underlying writer fails.
  fn write_report(
    &mut self,
    snapshot: &Snapshot,
    resolver: &dyn SymbolResolver,
  ) -> Result<(), ReportError>;
}

/// Human-readable dump of every surviving trace.
pub struct TextReport<W: Write> {
  handle: Option<u64>,
  writer: W,
}

impl<W: Write> ReportSink for TextReport<W> {
  fn write_report(
    &mut self,
    snapshot: &Snapshot,
    resolver: &dyn SymbolResolver,
  ) -> Result<(), ReportError> {
    dump_allocations(snapshot, resolver, self.handle, |_| true, &mut self.writer)
  }
}

impl<W: Write> TextReport<W> {
  /// Restrict the report to one heap.
  #[must_use]
  pub fn for_heap(mut self, handle: u64) -> Self {
    self.handle = Some(handle);
    self
  }

  pub fn into_inner(self) -> W {
    self.writer
  }

  pub fn new(writer: W) -> Self {
    Self {
      handle: None,
      writer,
    }
  }
}

/// JSON document with one entry per heap and surviving trace.
pub struct JsonReport<W: Write> {
  pretty: bool,
  writer: W,
}

impl<W: Write> ReportSink for JsonReport<W> {
  fn write_report(
    &mut self,
    snapshot: &Snapshot,
    resolver: &dyn SymbolResolver,
  ) -> Result<(), ReportError> {
    let heaps: Vec<HeapReport> = snapshot
      .heaps()
      .map(|heap| HeapReport {
        handle: heap.handle(),
        traces: snapshot
          .reported(heap)
          .map(|allocation| TraceReport::new(snapshot, heap, allocation, resolver))
          .collect(),
      })
      .collect();

    if self.pretty {
      serde_json::to_writer_pretty(&mut self.writer, &heaps)?;
    } else {
      serde_json::to_writer(&mut self.writer, &heaps)?;
    }
    self.writer.write_all(b"\n")?;
    Ok(())
  }
}

impl<W: Write> JsonReport<W> {
  pub fn into_inner(self) -> W {
    self.writer
  }

  pub fn new(writer: W) -> Self {
    Self {
      pretty: false,
      writer,
    }
  }

  #[must_use]
  pub fn pretty(mut self) -> Self {
    self.pretty = true;
    self
  }
}

/// Write the surviving traces of one heap (or all heaps), with symbolized
/// stacks. `filter` can hide further traces.
///
/// # Errors
///
/// Returns [`ReportError::UnknownHeap`] if `handle` names no heap of the
/// snapshot, or an i/o error if the writer fails.
pub fn dump_allocations<W, F>(
  snapshot: &Snapshot,
  resolver: &dyn SymbolResolver,
  handle: Option<u64>,
  mut filter: F,
  mut writer: W,
) -> Result<(), ReportError>
where
  W: Write,
  F: FnMut(&Allocation) -> bool,
{
  let heaps: Vec<&Heap> = match handle {
    Some(handle) => vec![snapshot.heap(handle).ok_or(ReportError::UnknownHeap(handle))?],
    None => snapshot.heaps().collect(),
  };

  writeln!(writer, "Allocations:")?;

  for heap in heaps {
    writeln!(writer, "Heap @ {:#X}", heap.handle())?;

    for allocation in snapshot.reported(heap).filter(|allocation| filter(*allocation)) {
      let report = TraceReport::new(snapshot, heap, allocation, resolver);

      writeln!(writer, "Traceid: {:#x}", report.trace_id)?;
      writeln!(
        writer,
        "Samples: {}, requested: {} bytes, overhead: {} bytes",
        report.samples, report.requested_bytes, report.overhead_bytes
      )?;

      let addresses: Vec<String> = report
        .addresses
        .iter()
        .map(|address| format!("{address:#x}"))
        .collect();
      writeln!(writer, "Allocations: [{}]", addresses.join(","))?;

      for frame in &report.frames {
        writeln!(writer, "\t{frame}")?;
      }
    }
  }

  writer.flush()?;
  Ok(())
}

/// Write the surviving traces of every heap as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if encoding or the writer fails.
pub fn export_json<W: Write>(
  snapshot: &Snapshot,
  resolver: &dyn SymbolResolver,
  writer: W,
) -> Result<(), ReportError> {
  JsonReport::new(writer).pretty().write_report(snapshot, resolver)
}

/// List the loaded modules.
///
/// # Errors
///
/// Returns an error if the writer fails.
pub fn dump_modules<W: Write>(snapshot: &Snapshot, mut writer: W) -> Result<(), ReportError> {
  writeln!(writer, "Modules:")?;
  for module in snapshot.modules().iter() {
    writeln!(
      writer,
      "{} @ {:#X}, size={}",
      module.path, module.base, module.size
    )?;
  }
  Ok(())
}

/// List heaps by descending trace count.
///
/// # Errors
///
/// Returns an error if the writer fails.
pub fn dump_stats<W: Write>(snapshot: &Snapshot, mut writer: W) -> Result<(), ReportError> {
  for stats in snapshot.stats() {
    writeln!(
      writer,
      "Heap: {:#X}, allocations: {}",
      stats.handle, stats.traces
    )?;
  }
  Ok(())
}
