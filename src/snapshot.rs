use super::*;

/// Per-heap summary, as printed by stats dumps.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct HeapStats {
  pub handle: u64,
  pub traces: usize,
}

/// One heap of the snapshotted process and the traces allocated from it.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Heap {
  allocations: BTreeMap<TraceId, Allocation>,
  handle: u64,
}

impl Heap {
  pub fn allocations(&self) -> impl Iterator<Item = &Allocation> {
    self.allocations.values()
  }

  #[must_use]
  pub fn get(&self, trace_id: TraceId) -> Option<&Allocation> {
    self.allocations.get(&trace_id)
  }

  #[must_use]
  pub fn handle(&self) -> u64 {
    self.handle
  }

  /// Store `allocation`, replacing whatever was recorded under its id.
  pub fn insert(&mut self, allocation: Allocation) -> Option<Allocation> {
    self.allocations.insert(allocation.trace_id, allocation)
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.allocations.is_empty()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.allocations.len()
  }

  #[must_use]
  pub fn new(handle: u64) -> Self {
    Self {
      allocations: BTreeMap::new(),
      handle,
    }
  }

  /// Accumulate `allocation` into the heap.
  ///
  /// A trace seen before keeps its original stack and alias stacks; only the
  /// samples of later occurrences are appended.
  pub fn record(&mut self, allocation: Allocation) {
    match self.allocations.get_mut(&allocation.trace_id) {
      Some(existing) => existing.samples.extend(allocation.samples),
      None => {
        self.allocations.insert(allocation.trace_id, allocation);
      }
    }
  }

  pub fn trace_ids(&self) -> impl Iterator<Item = TraceId> + '_ {
    self.allocations.keys().copied()
  }
}

/// Complete state of one heap-usage sample of a process.
///
/// Snapshots are assembled through [`SnapshotBuilder`] and are read-only
/// afterwards, which keeps the cross-heap trace index in step with the heaps.
/// The only later change is the retained set installed by duplicate
/// compression.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Snapshot {
  heaps: BTreeMap<u64, Heap>,
  index: BTreeMap<TraceId, u64>,
  modules: Arc<ModuleTable>,
  retained: Option<Retained>,
}

/// Surviving traces per heap handle, each with the samples it absorbed.
///
/// Trace ids are only unique within a heap, so survivors are tracked per
/// heap.
pub type Retained = BTreeMap<u64, BTreeMap<TraceId, Vec<Sample>>>;

impl Snapshot {
  /// Samples a surviving trace of heap `handle` took over from its
  /// duplicates.
  #[must_use]
  pub fn absorbed(&self, handle: u64, trace_id: TraceId) -> &[Sample] {
    self
      .retained
      .as_ref()
      .and_then(|retained| retained.get(&handle)?.get(&trace_id))
      .map(Vec::as_slice)
      .unwrap_or_default()
  }

  /// Every trace of every heap, through the cross-heap index.
  pub fn all_traces(&self) -> impl Iterator<Item = &Allocation> {
    self
      .index
      .iter()
      .filter_map(|(trace_id, handle)| self.heaps.get(handle)?.get(*trace_id))
  }

  #[must_use]
  pub fn builder() -> SnapshotBuilder {
    SnapshotBuilder::new()
  }

  /// Fold the retained set back into plain traces.
  ///
  /// Absorbed traces disappear and every retained trace carries its merged
  /// samples. Without a retained set this is a plain copy.
  #[must_use]
  pub fn flattened(&self) -> Snapshot {
    let Some(retained) = &self.retained else {
      return self.clone();
    };

    let mut builder = SnapshotBuilder::new().with_modules(Arc::clone(&self.modules));

    for heap in self.heaps.values() {
      let mut flat = Heap::new(heap.handle());
      let survivors = retained.get(&heap.handle());

      for allocation in heap.allocations() {
        if let Some(extra) = survivors.and_then(|s| s.get(&allocation.trace_id)) {
          let mut merged = allocation.clone();
          merged.samples.extend_from_slice(extra);
          flat.insert(merged);
        }
      }

      builder.insert_heap(flat);
    }

    builder.finish()
  }

  #[must_use]
  pub fn heap(&self, handle: u64) -> Option<&Heap> {
    self.heaps.get(&handle)
  }

  pub fn heaps(&self) -> impl Iterator<Item = &Heap> {
    self.heaps.values()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.heaps.is_empty()
  }

  /// Whether the trace of heap `handle` survives duplicate compression.
  /// Every trace survives until a retained set has been computed.
  #[must_use]
  pub fn is_reported(&self, handle: u64, trace_id: TraceId) -> bool {
    match &self.retained {
      Some(retained) => retained
        .get(&handle)
        .is_some_and(|survivors| survivors.contains_key(&trace_id)),
      None => self
        .heaps
        .get(&handle)
        .is_some_and(|heap| heap.get(trace_id).is_some()),
    }
  }

  #[must_use]
  pub fn map_to_module(&self, address: u64) -> Option<&Module> {
    self.modules.map_to_module(address)
  }

  /// Samples of a trace of heap `handle`, followed by the samples of every
  /// trace it absorbed.
  #[must_use]
  pub fn merged_samples(&self, handle: u64, trace_id: TraceId) -> Vec<Sample> {
    let mut samples = self
      .heaps
      .get(&handle)
      .and_then(|heap| heap.get(trace_id))
      .map(|allocation| allocation.samples.clone())
      .unwrap_or_default();

    samples.extend_from_slice(self.absorbed(handle, trace_id));
    samples
  }

  #[must_use]
  pub fn modules(&self) -> &Arc<ModuleTable> {
    &self.modules
  }

  /// Traces of `heap` that survive compression, in trace id order.
  pub fn reported<'a>(
    &'a self,
    heap: &'a Heap,
  ) -> impl Iterator<Item = &'a Allocation> + 'a {
    heap
      .allocations()
      .filter(|allocation| self.is_reported(heap.handle(), allocation.trace_id))
  }

  #[must_use]
  pub fn retained(&self) -> Option<&Retained> {
    self.retained.as_ref()
  }

  pub(crate) fn set_retained(&mut self, retained: Retained) {
    self.retained = Some(retained);
  }

  /// Heaps ordered by descending trace count.
  #[must_use]
  pub fn stats(&self) -> Vec<HeapStats> {
    let mut stats: Vec<_> = self
      .heaps
      .values()
      .map(|heap| HeapStats {
        handle: heap.handle(),
        traces: heap.len(),
      })
      .collect();

    stats.sort_by(|a, b| b.traces.cmp(&a.traces).then(a.handle.cmp(&b.handle)));

    stats
  }

  #[must_use]
  pub fn trace(&self, trace_id: TraceId) -> Option<&Allocation> {
    let handle = self.index.get(&trace_id)?;
    self.heaps.get(handle)?.get(trace_id)
  }

  #[must_use]
  pub fn trace_count(&self) -> usize {
    self.index.len()
  }
}

/// The single mutation path for [`Snapshot`].
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
  heaps: BTreeMap<u64, Heap>,
  modules: Arc<ModuleTable>,
}

impl SnapshotBuilder {
  /// Seal the builder, deriving the cross-heap trace index.
  ///
  /// Heaps are indexed in ascending handle order, so a trace id shared by two
  /// heaps resolves to the one with the higher handle.
  #[must_use]
  pub fn finish(self) -> Snapshot {
    let mut index = BTreeMap::new();

    for (handle, heap) in &self.heaps {
      for trace_id in heap.trace_ids() {
        index.insert(trace_id, *handle);
      }
    }

    Snapshot {
      heaps: self.heaps,
      index,
      modules: self.modules,
      retained: None,
    }
  }

  /// Merge a heap into the snapshot. Traces already present under the same
  /// handle accumulate samples as in [`Heap::record`].
  pub fn insert_heap(&mut self, heap: Heap) {
    let handle = heap.handle();

    match self.heaps.get_mut(&handle) {
      Some(existing) => {
        for allocation in heap.allocations.into_values() {
          existing.record(allocation);
        }
      }
      None => {
        self.heaps.insert(handle, heap);
      }
    }
  }

  pub fn insert_module(&mut self, module: Module) {
    Arc::make_mut(&mut self.modules).insert(module);
  }

  pub(crate) fn module_count(&self) -> usize {
    self.modules.len()
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record(&mut self, handle: u64, allocation: Allocation) {
    self
      .heaps
      .entry(handle)
      .or_insert_with(|| Heap::new(handle))
      .record(allocation);
  }

  #[must_use]
  pub fn with_heap(mut self, heap: Heap) -> Self {
    self.insert_heap(heap);
    self
  }

  /// Share an existing module table instead of building a new one.
  #[must_use]
  pub fn with_modules(mut self, modules: Arc<ModuleTable>) -> Self {
    self.modules = modules;
    self
  }
}
