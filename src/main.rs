use {
  anyhow::{Context, bail},
  clap::{Parser, Subcommand},
  heapdiff::{
    Analyzer, AnalyzerConfig, CachingResolver, CompressionLevel, GrepFilter,
    ModuleOffsetResolver, Snapshot, SymbolResolver, batch, codec, dump_allocations,
    dump_modules, dump_stats, export_json, parser,
  },
  std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
  },
  tracing::{info, warn},
  tracing_subscriber::EnvFilter,
};

#[derive(Parser, Debug)]
#[command(name = "heapdiff")]
#[command(about = "Find native heap leaks by diffing heap snapshots", long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Commands,

  /// Log debug output to stderr.
  #[arg(short, long, global = true)]
  verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
  /// Convert a text snapshot log into the binary trace format.
  Convert(ConvertArgs),

  /// Print the contents of one snapshot.
  Dump(DumpArgs),

  /// Report allocations present in the later snapshot but not the baseline.
  ///
  /// Only allocations whose allocator was called from foreign code are
  /// reported, and near-duplicate stacks are folded together.
  Diff(DiffArgs),
}

#[derive(Parser, Debug)]
struct ConvertArgs {
  /// Text snapshot log.
  log: PathBuf,

  /// Output file. Defaults to the log path with a `.bin` extension.
  #[arg(short, long)]
  out: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct DumpArgs {
  /// Text log or binary trace file.
  file: PathBuf,

  /// Only show allocations keeping at least one frame matching this pattern.
  #[arg(long)]
  grep: Option<String>,

  /// Restrict the allocation dump to one heap (hex handle).
  #[arg(long, value_parser = parse_handle)]
  heap: Option<u64>,

  /// Print the module table.
  #[arg(long)]
  modules: bool,

  /// Print per-heap trace counts instead of allocations.
  #[arg(long)]
  stats: bool,
}

#[derive(Parser, Debug)]
struct DiffArgs {
  /// Snapshot taken first.
  baseline: PathBuf,

  /// Snapshot taken later.
  later: PathBuf,

  /// Write a binary cache next to each text log that lacks one.
  #[arg(long)]
  cache_inputs: bool,

  /// JSON analyzer configuration.
  #[arg(long)]
  config: Option<PathBuf>,

  /// Only report allocations with at least one frame matching this pattern.
  #[arg(long, conflicts_with_all = ["json", "save_binary"])]
  grep: Option<String>,

  /// Emit JSON instead of text.
  #[arg(long, conflicts_with = "save_binary")]
  json: bool,

  /// Report near-duplicate stacks separately.
  #[arg(long)]
  keep_duplicates: bool,

  /// Write the report here instead of stdout.
  #[arg(short, long)]
  out: Option<PathBuf>,

  /// Save the (flattened) diff result to `--out` in binary form instead of
  /// printing a report.
  #[arg(long, requires = "out")]
  save_binary: bool,

  /// Require a shared leading run of frames to fold stacks together.
  #[arg(long)]
  strict: bool,

  /// Persistent symbol cache file.
  #[arg(long)]
  sym_cache: Option<PathBuf>,

  /// Symbol pattern (`module!symbol`, case-insensitive) marking trusted
  /// callers. May be repeated.
  #[arg(long = "trusted-pattern")]
  trusted_patterns: Vec<String>,

  /// Bound on the number of inputs prepared in parallel.
  #[arg(long)]
  workers: Option<usize>,
}

fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  match cli.command {
    Commands::Convert(args) => convert(args),
    Commands::Dump(args) => dump(args),
    Commands::Diff(args) => diff(args),
  }
}

fn init_tracing(verbose: bool) {
  let default = if verbose { "heapdiff=debug" } else { "heapdiff=info" };

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
    .with_writer(io::stderr)
    .init();
}

fn parse_handle(value: &str) -> Result<u64, String> {
  let digits = value
    .strip_prefix("0x")
    .or_else(|| value.strip_prefix("0X"))
    .unwrap_or(value);
  u64::from_str_radix(digits, 16).map_err(|err| format!("invalid heap handle `{value}`: {err}"))
}

fn output(path: Option<&Path>) -> anyhow::Result<Box<dyn Write>> {
  Ok(match path {
    Some(path) => Box::new(BufWriter::new(
      File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
    )),
    None => Box::new(io::stdout().lock()),
  })
}

fn convert(args: ConvertArgs) -> anyhow::Result<()> {
  let snapshot = parser::parse_file(&args.log)
    .with_context(|| format!("failed to parse {}", args.log.display()))?;

  let out = args
    .out
    .unwrap_or_else(|| codec::binary_cache_path(&args.log));

  if out == args.log {
    bail!("refusing to overwrite the input log {}", out.display());
  }

  codec::save(&snapshot, &out).with_context(|| format!("failed to write {}", out.display()))?;

  info!(
    path = %out.display(),
    modules = snapshot.modules().len(),
    traces = snapshot.trace_count(),
    "wrote binary snapshot"
  );
  Ok(())
}

fn dump(args: DumpArgs) -> anyhow::Result<()> {
  let snapshot = batch::load(&args.file)?;
  let mut writer = output(None)?;

  if args.modules {
    dump_modules(&snapshot, &mut writer)?;
  }

  if args.stats {
    dump_stats(&snapshot, &mut writer)?;
  } else {
    write_allocations(
      &snapshot,
      &ModuleOffsetResolver,
      args.heap,
      args.grep.as_deref(),
      &mut writer,
    )?;
  }

  writer.flush()?;
  Ok(())
}

fn diff(args: DiffArgs) -> anyhow::Result<()> {
  let mut config = match &args.config {
    Some(path) => AnalyzerConfig::load(path)
      .with_context(|| format!("failed to load config {}", path.display()))?,
    None => AnalyzerConfig::default(),
  };

  if let Some(workers) = args.workers {
    config = config.with_workers(workers);
  }

  if args.sym_cache.is_some() {
    config.symbol_cache.clone_from(&args.sym_cache);
  }

  let mut builder = Analyzer::builder().with_config(config.clone());

  if args.keep_duplicates {
    builder = builder.keep_duplicates(true);
  }

  if args.strict {
    builder = builder.compression_level(CompressionLevel::Strict);
  }

  for pattern in args.trusted_patterns {
    builder = builder.trusted_pattern(pattern);
  }

  let analyzer = builder.finish().context("invalid analyzer configuration")?;

  let inputs = [args.baseline.as_path(), args.later.as_path()];
  let mut snapshots = batch::prepare(&inputs, config.workers, args.cache_inputs)?.into_iter();

  let (Some(baseline), Some(later)) = (snapshots.next(), snapshots.next()) else {
    bail!("expected two prepared snapshots");
  };

  let resolver = match &config.symbol_cache {
    Some(path) => CachingResolver::with_cache_file(ModuleOffsetResolver, path),
    None => CachingResolver::new(ModuleOffsetResolver),
  };

  let delta = analyzer.diff(&baseline, &later, &resolver)?;

  match args.out.as_deref() {
    Some(out) if args.save_binary => save_diff(&delta, out)?,
    out => {
      let mut writer = output(out)?;

      if args.json {
        export_json(&delta, &resolver, &mut writer)?;
      } else {
        write_allocations(&delta, &resolver, None, args.grep.as_deref(), &mut writer)?;
      }

      writer.flush()?;
    }
  }

  if config.symbol_cache.is_some() {
    if let Err(err) = resolver.save() {
      warn!(%err, "failed to save symbol cache");
    }
  }

  Ok(())
}

fn save_diff(delta: &Snapshot, out: &Path) -> anyhow::Result<()> {
  codec::save(delta, out).with_context(|| format!("failed to write {}", out.display()))?;
  info!(path = %out.display(), traces = delta.trace_count(), "saved diff");
  Ok(())
}

fn write_allocations<W: Write>(
  snapshot: &Snapshot,
  resolver: &dyn SymbolResolver,
  heap: Option<u64>,
  grep: Option<&str>,
  writer: W,
) -> anyhow::Result<()> {
  match grep {
    Some(pattern) => {
      let filter = GrepFilter::new(pattern, snapshot.modules().clone(), resolver)?;
      dump_allocations(snapshot, resolver, heap, |a| filter.matches(a), writer)?;
    }
    None => dump_allocations(snapshot, resolver, heap, |_| true, writer)?,
  }

  Ok(())
}
