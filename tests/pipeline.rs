use {
  heapdiff::{
    Analyzer, CompressionLevel, ModuleTable, ReportSink, Resolution, SymbolResolver, TextReport,
    TraceId, codec, dump_allocations, export_json, parser,
  },
  std::collections::HashMap,
};

const HEAP: u64 = 0x2E60000;
const APP: u64 = 0x400000;
const DBGHELP: u64 = 0x6000_0000;
const NTDLL: u64 = 0x7FF0_0000;

struct TableResolver {
  symbols: HashMap<u64, &'static str>,
}

impl TableResolver {
  fn new() -> Self {
    Self {
      symbols: HashMap::from([
        (NTDLL + 0x10, "RtlAllocateHeap"),
        (APP + 0x100, "Widget::new"),
        (APP + 0x200, "cache_insert"),
        (DBGHELP + 0x40, "SymLoadModule"),
      ]),
    }
  }
}

impl SymbolResolver for TableResolver {
  fn resolve(&self, modules: &ModuleTable, address: u64) -> Resolution {
    let mut resolution = Resolution::module_offset(modules, address);
    if let Some(symbol) = self.symbols.get(&address) {
      resolution.symbol = Some((*symbol).to_string());
      resolution.displacement = 0;
    }
    resolution
  }
}

fn stack(tail: u64) -> String {
  let mut frames = vec![NTDLL + 0x10, APP + 0x100];
  frames.extend((0..7).map(|i| APP + 0x1000 + i * 0x10));
  frames.push(tail);
  frames.iter().map(|frame| format!("\t{frame:X}\n")).collect()
}

fn log(traces: &[(TraceId, Vec<u64>, String)]) -> String {
  let mut log = String::from(
    "// Loaded modules:\n\
     //     Base Size Module\n\
       400000    10000 C:\\app\\app.exe\n\
     60000000    10000 C:\\app\\dbghelp.dll\n\
     7FF00000    10000 C:\\Windows\\System32\\ntdll.dll\n\
     \n\
     *- - - - - - - - - - Heap 2E60000 Hogs - - - - - - - - - -\n\n",
  );

  for (trace_id, addresses, frames) in traces {
    for address in addresses {
      log.push_str(&format!("40 bytes + 10 at {address:X} by BackTrace{trace_id:X}\n"));
      log.push_str(frames);
      log.push('\n');
    }
  }

  log.push_str("*- - - - - - - - - - End of data for heap @ 2E60000 - - - - - - - - - -\n");
  log
}

fn snapshots() -> (heapdiff::Snapshot, heapdiff::Snapshot) {
  let trusted = format!("\t{:X}\n\t{:X}\n", NTDLL + 0x10, DBGHELP + 0x40);
  let cached = format!("\t{:X}\n\t{:X}\n", NTDLL + 0x10, APP + 0x200);

  let baseline = log(&[
    (0x1A, vec![0x500000], stack(APP + 0x2000)),
    (0x2B, vec![0x600000], trusted.clone()),
  ]);

  let later = log(&[
    (0x1A, vec![0x500000, 0x500100, 0x500200], stack(APP + 0x2000)),
    (0x1C, vec![0x510000], stack(APP + 0x3000)),
    (0x2B, vec![0x600000, 0x600100], trusted),
    (0x3D, vec![0x700000], cached),
  ]);

  (
    parser::parse(baseline.as_bytes()).expect("parse baseline"),
    parser::parse(later.as_bytes()).expect("parse later"),
  )
}

#[test]
fn reports_one_folded_leak_site() {
  let (baseline, later) = snapshots();
  assert_eq!(later.trace_count(), 4);
  assert_eq!(later.trace(0x1A).expect("trace 1A").samples.len(), 3);

  let analyzer = Analyzer::builder()
    .trusted_pattern(r"!cache_")
    .finish()
    .expect("valid patterns");
  let resolver = TableResolver::new();
  let delta = analyzer
    .diff(&baseline, &later, &resolver)
    .expect("diff");

  let ids: Vec<TraceId> = delta.all_traces().map(|a| a.trace_id).collect();
  assert_eq!(ids, vec![0x1A, 0x1C]);
  assert!(delta.is_reported(HEAP, 0x1A));
  assert!(!delta.is_reported(HEAP, 0x1C));

  let addresses: Vec<u64> = delta
    .merged_samples(HEAP, 0x1A)
    .iter()
    .map(|sample| sample.address)
    .collect();
  assert_eq!(addresses, vec![0x500100, 0x500200, 0x510000]);

  let mut report = TextReport::new(Vec::new());
  report.write_report(&delta, &resolver).expect("report");
  let text = String::from_utf8(report.into_inner()).expect("utf8");

  assert!(text.contains("Traceid: 0x1a\n"));
  assert!(text.contains("Samples: 3, requested: 192 bytes, overhead: 48 bytes\n"));
  assert!(text.contains("\tntdll!RtlAllocateHeap+0x0\n\tapp!Widget::new+0x0\n"));
  assert!(!text.contains("0x1c"));
  assert!(!text.contains("0x2b"));
  assert!(!text.contains("0x3d"));
}

#[test]
fn keep_duplicates_reports_both_sites() {
  let (baseline, later) = snapshots();
  let resolver = TableResolver::new();

  let delta = Analyzer::builder()
    .keep_duplicates(true)
    .trusted_pattern(r"!cache_")
    .finish()
    .expect("valid patterns")
    .diff(&baseline, &later, &resolver)
    .expect("diff");

  let mut out = Vec::new();
  dump_allocations(&delta, &resolver, None, |_| true, &mut out).expect("dump");
  let text = String::from_utf8(out).expect("utf8");
  assert!(text.contains("Traceid: 0x1a\n"));
  assert!(text.contains("Traceid: 0x1c\n"));
  assert!(!text.contains("Traceid: 0x3d\n"));
}

#[test]
fn strict_mode_needs_a_shared_leading_run() {
  let (baseline, later) = snapshots();
  let resolver = TableResolver::new();

  let delta = Analyzer::builder()
    .compression_level(CompressionLevel::Strict)
    .finish()
    .expect("valid patterns")
    .diff(&baseline, &later, &resolver)
    .expect("diff");

  assert!(delta.is_reported(HEAP, 0x1A));
  assert!(!delta.is_reported(HEAP, 0x1C));
  // The trusted pattern is absent, so the cache allocation is reported.
  assert!(delta.is_reported(HEAP, 0x3D));
}

#[test]
fn folded_result_survives_binary_round_trip() {
  let (baseline, later) = snapshots();
  let resolver = TableResolver::new();
  let delta = Analyzer::new()
    .diff(&baseline, &later, &resolver)
    .expect("diff");

  let decoded = codec::decode(&codec::encode(&delta)).expect("decode");
  assert_eq!(decoded, delta.flattened());
  assert!(decoded.trace(0x1C).is_none());
  assert_eq!(decoded.trace(0x1A).expect("trace 1A").samples.len(), 3);

  let mut json = Vec::new();
  export_json(&decoded, &resolver, &mut json).expect("json");
  let value: serde_json::Value = serde_json::from_slice(&json).expect("valid json");
  assert_eq!(value[0]["traces"][0]["samples"], 3);
}
