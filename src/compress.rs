use super::*;

/// A run of equal elements shared by two sequences: `a[a..a + size]` equals
/// `b[b..b + size]`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Match {
  pub a: usize,
  pub b: usize,
  pub size: usize,
}

/// Longest-common-substring alignment between two stacks.
///
/// Mirrors the classic recursive matching-block algorithm: find the longest
/// contiguous common run, then recurse on both sides of it.
#[derive(Debug)]
pub struct SequenceMatch<'s> {
  a: &'s [u64],
  b: &'s [u64],
  b_positions: HashMap<u64, Vec<usize>>,
}

impl<'s> SequenceMatch<'s> {
  /// Longest common run inside `a[alo..ahi]` and `b[blo..bhi]`. Ties go to
  /// the run starting earliest in `a`, then earliest in `b`.
  #[must_use]
  pub fn find_longest_match(&self, alo: usize, ahi: usize, blo: usize, bhi: usize) -> Match {
    let mut best = Match {
      a: alo,
      b: blo,
      size: 0,
    };
    let mut run_ending_at: HashMap<usize, usize> = HashMap::new();

    for i in alo..ahi {
      let mut next_runs = HashMap::new();

      if let Some(positions) = self.b_positions.get(&self.a[i]) {
        for &j in positions {
          if j < blo {
            continue;
          }
          if j >= bhi {
            break;
          }

          let size = j
            .checked_sub(1)
            .and_then(|prev| run_ending_at.get(&prev))
            .copied()
            .unwrap_or(0)
            + 1;
          next_runs.insert(j, size);

          if size > best.size {
            best = Match {
              a: i + 1 - size,
              b: j + 1 - size,
              size,
            };
          }
        }
      }

      run_ending_at = next_runs;
    }

    best
  }

  /// Non-overlapping common runs in ascending order, adjacent runs fused.
  #[must_use]
  pub fn matching_blocks(&self) -> Vec<Match> {
    let mut pending = vec![(0, self.a.len(), 0, self.b.len())];
    let mut blocks = Vec::new();

    while let Some((alo, ahi, blo, bhi)) = pending.pop() {
      let found = self.find_longest_match(alo, ahi, blo, bhi);
      if found.size == 0 {
        continue;
      }

      blocks.push(found);
      if alo < found.a && blo < found.b {
        pending.push((alo, found.a, blo, found.b));
      }
      if found.a + found.size < ahi && found.b + found.size < bhi {
        pending.push((found.a + found.size, ahi, found.b + found.size, bhi));
      }
    }

    blocks.sort_by_key(|block| (block.a, block.b));

    let mut fused: Vec<Match> = Vec::with_capacity(blocks.len());
    for block in blocks {
      match fused.last_mut() {
        Some(last) if last.a + last.size == block.a && last.b + last.size == block.b => {
          last.size += block.size;
        }
        _ => fused.push(block),
      }
    }

    fused
  }

  #[must_use]
  pub fn new(a: &'s [u64], b: &'s [u64]) -> Self {
    let mut b_positions: HashMap<u64, Vec<usize>> = HashMap::new();
    for (index, address) in b.iter().enumerate() {
      b_positions.entry(*address).or_default().push(index);
    }

    Self { a, b, b_positions }
  }

  /// Similarity in `[0, 1]`: twice the matched length over the combined
  /// length. Two empty sequences are identical.
  #[must_use]
  pub fn ratio(&self) -> f64 {
    let total = self.a.len() + self.b.len();
    if total == 0 {
      return 1.0;
    }

    let matched: usize = self.matching_blocks().iter().map(|block| block.size).sum();
    (2 * matched) as f64 / total as f64
  }
}

/// Whether two stacks differ only in ways too small to report separately.
///
/// Empty stacks carry no call path and never match anything.
#[must_use]
pub fn is_duplicate(a: &[u64], b: &[u64], config: &CompressionConfig) -> bool {
  if a.is_empty() || b.is_empty() {
    return false;
  }

  match config.level {
    CompressionLevel::Strict => {
      let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
      covers(prefix, a.len().max(b.len()), config.prefix_fraction)
    }
    CompressionLevel::Aggressive => {
      let matcher = SequenceMatch::new(a, b);
      if matcher.ratio() <= config.ratio_cutoff {
        return false;
      }

      let longest = matcher.find_longest_match(0, a.len(), 0, b.len());
      longest.a == 0
        && longest.b == 0
        && covers(longest.size, a.len().min(b.len()), config.prefix_fraction)
    }
  }
}

fn covers(len: usize, total: usize, fraction: f64) -> bool {
  // Tolerate rounding in `fraction * total` for exact thresholds like 7/10.
  len as f64 + 1e-9 >= fraction * total as f64
}

/// Mark near-duplicate traces so they are reported once.
///
/// Each heap is handled on its own. Every pair of traces (in ascending id
/// order) is tested with [`is_duplicate`]; the second trace of a matching
/// pair is absorbed. Traces that are never absorbed become keys of their
/// heap's entry in the retained set, paired with the samples of the traces
/// they absorbed. An absorbed trace is credited to exactly one survivor: its
/// first surviving partner, or failing that, whoever absorbed its first
/// partner.
pub fn compress(snapshot: &mut Snapshot, config: &CompressionConfig) {
  let mut retained = Retained::new();

  for heap in snapshot.heaps() {
    let survivors = retained.entry(heap.handle()).or_default();
    let traces: Vec<&Allocation> = heap.allocations().collect();
    let mut partners: BTreeMap<TraceId, Vec<TraceId>> = BTreeMap::new();

    for (index, first) in traces.iter().enumerate() {
      for second in &traces[index + 1..] {
        if is_duplicate(&first.stack, &second.stack, config) {
          partners
            .entry(second.trace_id)
            .or_default()
            .push(first.trace_id);
        }
      }
    }

    let absorbed: IntSet<TraceId> = partners.keys().copied().collect();

    for allocation in &traces {
      if !absorbed.contains(&allocation.trace_id) {
        survivors.entry(allocation.trace_id).or_default();
      }
    }

    let mut owners: BTreeMap<TraceId, TraceId> = BTreeMap::new();

    // Partners always have lower ids, so their owners are settled first.
    for (trace_id, firsts) in &partners {
      let owner = firsts
        .iter()
        .copied()
        .find(|first| !absorbed.contains(first))
        .or_else(|| firsts.first().and_then(|first| owners.get(first).copied()));

      let Some(owner) = owner else {
        continue;
      };

      owners.insert(*trace_id, owner);

      if let Some(allocation) = heap.get(*trace_id) {
        survivors
          .entry(owner)
          .or_default()
          .extend_from_slice(&allocation.samples);
      }
    }

    debug!(
      handle = format_args!("{:#X}", heap.handle()),
      traces = traces.len(),
      absorbed = absorbed.len(),
      "compressed heap"
    );
  }

  snapshot.set_retained(retained);
}

#[cfg(test)]
mod tests {
  use super::*;

  const HEAP: u64 = 0x2E60000;

  fn stack(len: u64, last: u64) -> Vec<u64> {
    let mut frames: Vec<u64> = (0..len - 1).map(|i| 0x401000 + i * 0x100).collect();
    frames.push(last);
    frames
  }

  fn build(traces: Vec<(TraceId, Vec<u64>, Vec<Sample>)>) -> Snapshot {
    let mut builder = Snapshot::builder();
    for (trace_id, frames, samples) in traces {
      builder.record(HEAP, Allocation::new(trace_id, frames).with_samples(samples));
    }
    builder.finish()
  }

  #[test]
  fn longest_match_prefers_earliest_run() {
    let a: [u64; 7] = [1, 2, 3, 9, 1, 2, 3];
    let b: [u64; 4] = [5, 1, 2, 3];
    let matcher = SequenceMatch::new(&a, &b);

    assert_eq!(
      matcher.find_longest_match(0, a.len(), 0, b.len()),
      Match { a: 0, b: 1, size: 3 }
    );
  }

  #[test]
  fn ratio_counts_all_matching_blocks() {
    let a: [u64; 4] = [1, 2, 3, 4];
    let b: [u64; 4] = [1, 2, 9, 4];
    let matcher = SequenceMatch::new(&a, &b);

    assert_eq!(
      matcher.matching_blocks(),
      vec![Match { a: 0, b: 0, size: 2 }, Match { a: 3, b: 3, size: 1 }]
    );
    assert!((matcher.ratio() - 0.75).abs() < 1e-9);
    assert!((SequenceMatch::new(&[], &[]).ratio() - 1.0).abs() < 1e-9);
  }

  #[test]
  fn aggressive_needs_shared_leading_run() {
    let config = CompressionConfig::default();
    let base = stack(10, 0x409000);

    let tail_differs = stack(10, 0x409010);
    assert!(is_duplicate(&base, &tail_differs, &config));

    let mut head_differs = base.clone();
    head_differs[0] = 0xDEAD;
    assert!(!is_duplicate(&base, &head_differs, &config));

    let short = &base[..5];
    assert!(!is_duplicate(&base, short, &config));
  }

  #[test]
  fn strict_uses_prefix_of_longer_stack() {
    let config = CompressionConfig::default().with_level(CompressionLevel::Strict);
    let base = stack(10, 0x409000);

    assert!(is_duplicate(&base, &stack(10, 0x409010), &config));
    assert!(is_duplicate(&base, &base[..7], &config));
    assert!(!is_duplicate(&base, &base[..6], &config));
    assert!(!is_duplicate(&[], &[], &config));
  }

  #[test]
  fn merges_tail_variants_into_one_trace() {
    let s1 = Sample::new(0x10, 0x8, 0x500000);
    let s2 = Sample::new(0x20, 0x8, 0x500100);
    let mut snapshot = build(vec![
      (1, stack(10, 0x409000), vec![s1]),
      (2, stack(10, 0x409010), vec![s2]),
    ]);

    compress(&mut snapshot, &CompressionConfig::default());

    let retained = &snapshot.retained().expect("retained set")[&HEAP];
    assert_eq!(retained.keys().copied().collect::<Vec<_>>(), vec![1]);
    assert_eq!(retained[&1], vec![s2]);
    assert_eq!(snapshot.merged_samples(HEAP, 1), vec![s1, s2]);
    assert!(!snapshot.is_reported(HEAP, 2));
  }

  #[test]
  fn unrelated_traces_all_survive() {
    let mut snapshot = build(vec![
      (1, vec![0x1, 0x2, 0x3], vec![Sample::new(1, 0, 0x10)]),
      (2, vec![0x7, 0x8, 0x9], vec![Sample::new(2, 0, 0x20)]),
    ]);

    compress(&mut snapshot, &CompressionConfig::default());

    let retained = &snapshot.retained().expect("retained set")[&HEAP];
    assert_eq!(retained.len(), 2);
    assert!(retained.values().all(Vec::is_empty));
  }

  #[test]
  fn chained_duplicates_lose_and_repeat_nothing() {
    // 1~2 and 2~3 are similar, 1 and 3 are not: 3 is credited to 1 via 2.
    let config = CompressionConfig::default().with_level(CompressionLevel::Strict);
    let t1: Vec<u64> = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
    let t2: Vec<u64> = vec![1, 2, 3, 4, 5, 6, 7, 8, 20, 21];
    let t3: Vec<u64> = vec![1, 2, 3, 4, 5, 6, 7, 8, 20, 21, 22, 23];
    assert!(is_duplicate(&t1, &t2, &config));
    assert!(is_duplicate(&t2, &t3, &config));
    assert!(!is_duplicate(&t1, &t3, &config));

    let samples: Vec<Sample> = (1..=3).map(|i| Sample::new(i, 0, i * 0x100)).collect();
    let mut snapshot = build(vec![
      (1, t1, vec![samples[0]]),
      (2, t2, vec![samples[1]]),
      (3, t3, vec![samples[2]]),
    ]);

    compress(&mut snapshot, &config);

    let retained = &snapshot.retained().expect("retained set")[&HEAP];
    assert_eq!(retained.len(), 1);
    assert_eq!(snapshot.merged_samples(HEAP, 1), samples);
  }

  #[test]
  fn shared_trace_ids_stay_within_their_heap() {
    let s1 = Sample::new(0x10, 0, 0x1);
    let s2 = Sample::new(0x10, 0, 0x2);
    let s3 = Sample::new(0x10, 0, 0x3);
    let other = 0x3F00000;

    let mut builder = Snapshot::builder();
    builder.record(HEAP, Allocation::new(1, stack(10, 0x409000)).with_samples(vec![s1]));
    builder.record(HEAP, Allocation::new(2, stack(10, 0x409010)).with_samples(vec![s2]));
    builder.record(other, Allocation::new(2, vec![0x7, 0x8, 0x9]).with_samples(vec![s3]));
    let mut snapshot = builder.finish();

    compress(&mut snapshot, &CompressionConfig::default());

    assert!(!snapshot.is_reported(HEAP, 2));
    assert!(snapshot.is_reported(other, 2));

    let mut reported = Vec::new();
    for heap in snapshot.heaps() {
      for allocation in snapshot.reported(heap) {
        reported.extend(snapshot.merged_samples(heap.handle(), allocation.trace_id));
      }
    }
    reported.sort();
    assert_eq!(reported, vec![s1, s2, s3]);
  }
}
