use super::*;

/// Identifier the snapshot tool assigns to a distinct allocation call stack.
pub type TraceId = u64;

/// One physical allocation recorded against a trace.
///
/// Identity covers all three fields, so two samples are the same block only
/// if the size, the heap overhead and the address all agree.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  Eq,
  PartialEq,
  Hash,
  Ord,
  PartialOrd,
  Serialize,
  Deserialize,
)]
pub struct Sample {
  pub address: u64,
  pub overhead: u64,
  pub requested: u64,
}

impl Sample {
  #[must_use]
  pub fn new(requested: u64, overhead: u64, address: u64) -> Self {
    Self {
      address,
      overhead,
      requested,
    }
  }

  /// Bytes the heap actually committed for this block.
  #[must_use]
  pub fn total_bytes(&self) -> u64 {
    self.requested.saturating_add(self.overhead)
  }
}

/// Live allocations that share one call stack.
///
/// `alias_stacks` carries the alternate call paths the log groups under the
/// same trace id. They are informational only and take no part in equality.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Allocation {
  pub alias_stacks: Vec<Vec<u64>>,
  pub samples: Vec<Sample>,
  pub stack: Vec<u64>,
  pub trace_id: TraceId,
}

impl PartialEq for Allocation {
  fn eq(&self, other: &Self) -> bool {
    self.trace_id == other.trace_id
      && self.stack == other.stack
      && self.samples == other.samples
  }
}

impl Eq for Allocation {}

impl Allocation {
  #[must_use]
  pub fn new(trace_id: TraceId, stack: Vec<u64>) -> Self {
    Self {
      alias_stacks: Vec::new(),
      samples: Vec::new(),
      stack,
      trace_id,
    }
  }

  #[must_use]
  pub fn overhead_bytes(&self) -> u64 {
    self
      .samples
      .iter()
      .fold(0u64, |acc, sample| acc.saturating_add(sample.overhead))
  }

  pub fn push_sample(&mut self, sample: Sample) {
    self.samples.push(sample);
  }

  #[must_use]
  pub fn requested_bytes(&self) -> u64 {
    self
      .samples
      .iter()
      .fold(0u64, |acc, sample| acc.saturating_add(sample.requested))
  }

  #[must_use]
  pub fn with_alias_stacks(mut self, alias_stacks: Vec<Vec<u64>>) -> Self {
    self.alias_stacks = alias_stacks;
    self
  }

  #[must_use]
  pub fn with_samples(mut self, samples: Vec<Sample>) -> Self {
    self.samples = samples;
    self
  }
}
