use super::*;

/// Compute the allocations that appeared or grew between `baseline` and
/// `later`, i.e. `later - baseline`.
///
/// Only heaps present in both snapshots are compared. For each of them:
///
/// - traces new in `later` are taken whole,
/// - traces present in both contribute the samples `later` has and
///   `baseline` lacks,
/// - traces that only exist in `baseline` are dropped.
///
/// `keep` sees every candidate (with its reduced sample list) and can veto
/// it. Heaps left without traces are omitted. The result shares the module
/// table of `later`.
pub fn diff<F>(baseline: &Snapshot, later: &Snapshot, mut keep: F) -> Snapshot
where
  F: FnMut(&Allocation) -> bool,
{
  let mut builder = SnapshotBuilder::new().with_modules(Arc::clone(later.modules()));

  for heap in later.heaps() {
    let Some(old) = baseline.heap(heap.handle()) else {
      debug!(
        handle = format_args!("{:#X}", heap.handle()),
        "heap missing from baseline, skipped"
      );
      continue;
    };

    let mut delta = Heap::new(heap.handle());

    for allocation in heap.allocations() {
      match old.get(allocation.trace_id) {
        None => {
          if keep(allocation) {
            delta.insert(allocation.clone());
          }
        }
        Some(previous) => {
          let grown = new_samples(&previous.samples, &allocation.samples);
          if grown.is_empty() {
            continue;
          }

          let candidate = Allocation {
            alias_stacks: allocation.alias_stacks.clone(),
            samples: grown,
            stack: allocation.stack.clone(),
            trace_id: allocation.trace_id,
          };

          if keep(&candidate) {
            delta.insert(candidate);
          }
        }
      }
    }

    if delta.is_empty() {
      continue;
    }

    debug!(
      handle = format_args!("{:#X}", heap.handle()),
      traces = delta.len(),
      "heap grew"
    );
    builder.insert_heap(delta);
  }

  builder.finish()
}

/// Samples of `later` that `baseline` does not contain, in `later` order and
/// without repeats.
fn new_samples(baseline: &[Sample], later: &[Sample]) -> Vec<Sample> {
  let mut seen: HashSet<Sample> = baseline.iter().copied().collect();

  later
    .iter()
    .filter(|sample| seen.insert(**sample))
    .copied()
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  const HEAP: u64 = 0x2E60000;

  fn snapshot(traces: &[(TraceId, &[Sample])]) -> Snapshot {
    let mut builder = Snapshot::builder();
    builder.insert_module(Module::new(0x400000, 0x10000, "app.exe"));
    for (trace_id, samples) in traces {
      builder.record(
        HEAP,
        Allocation::new(*trace_id, vec![0x401000, *trace_id])
          .with_samples(samples.to_vec()),
      );
    }
    builder.finish()
  }

  const S1: Sample = Sample {
    address: 0x500000,
    overhead: 0x20,
    requested: 0x100,
  };
  const S2: Sample = Sample {
    address: 0x500100,
    overhead: 0x20,
    requested: 0x100,
  };
  const S3: Sample = Sample {
    address: 0x600000,
    overhead: 0x8,
    requested: 0x40,
  };

  #[test]
  fn reports_new_traces_and_grown_samples() {
    let baseline = snapshot(&[(1, &[S1])]);
    let later = snapshot(&[(1, &[S1, S2]), (2, &[S3])]);

    let result = diff(&baseline, &later, |_| true);
    let heap = result.heap(HEAP).expect("missing heap");

    assert_eq!(heap.len(), 2);
    assert_eq!(heap.get(1).expect("trace 1").samples, vec![S2]);
    assert_eq!(heap.get(2).expect("trace 2").samples, vec![S3]);
    assert!(Arc::ptr_eq(result.modules(), later.modules()));
  }

  #[test]
  fn diff_is_not_commutative() {
    let baseline = snapshot(&[(1, &[S1])]);
    let later = snapshot(&[(1, &[S1, S2]), (2, &[S3])]);

    let forward = diff(&baseline, &later, |_| true);
    let backward = diff(&later, &baseline, |_| true);

    assert_ne!(forward, backward);
    assert!(backward.is_empty());
  }

  #[test]
  fn self_diff_is_empty() {
    let later = snapshot(&[(1, &[S1, S2]), (2, &[S3])]);
    assert!(diff(&later, &later, |_| true).is_empty());
  }

  #[test]
  fn keep_can_veto_candidates() {
    let baseline = snapshot(&[(1, &[S1])]);
    let later = snapshot(&[(1, &[S1, S2]), (2, &[S3])]);

    let mut seen = Vec::new();
    let result = diff(&baseline, &later, |allocation| {
      seen.push((allocation.trace_id, allocation.samples.clone()));
      allocation.trace_id != 2
    });

    assert_eq!(seen, vec![(1, vec![S2]), (2, vec![S3])]);
    assert!(result.trace(2).is_none());
    assert!(result.trace(1).is_some());
  }

  #[test]
  fn unchanged_traces_never_reach_keep() {
    let baseline = snapshot(&[(1, &[S1])]);
    let later = snapshot(&[(1, &[S1])]);

    let mut calls = 0;
    let result = diff(&baseline, &later, |_| {
      calls += 1;
      true
    });

    assert_eq!(calls, 0);
    assert!(result.heap(HEAP).is_none());
  }

  #[test]
  fn heaps_missing_from_baseline_are_skipped() {
    let baseline = Snapshot::builder().finish();
    let later = snapshot(&[(1, &[S1])]);

    assert!(diff(&baseline, &later, |_| true).is_empty());
  }
}
