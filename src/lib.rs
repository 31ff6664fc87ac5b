//! Offline analysis of native heap snapshots.
//!
//! Snapshots are UMDH-style logs (or binary caches of them) listing the
//! loaded modules and, per heap, every live allocation grouped by the stack
//! trace that made it. Two snapshots of one process are diffed to find
//! allocations that appeared in between, filtered down to those whose
//! allocator was called from foreign code, and near-duplicate stacks are
//! folded so each leak site is reported once.

pub mod batch;
pub mod codec;
pub mod parser;

mod allocation;
mod analyzer;
mod classify;
mod compress;
mod config;
mod diff;
mod error;
mod modules;
mod report;
mod resolver;
mod snapshot;

use {
  byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt},
  config::{compile_pattern, compile_patterns},
  dashmap::DashMap,
  memmap2::Mmap,
  modules::base_name,
  nohash_hasher::IntSet,
  rayon::{ThreadPoolBuilder, prelude::*},
  regex::{Regex, RegexBuilder},
  serde::{Deserialize, Serialize},
  std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::{self, Display, Formatter},
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
  },
  thiserror::Error,
  tracing::{debug, info, warn},
};

pub use {
  allocation::{Allocation, Sample, TraceId},
  analyzer::{Analyzer, AnalyzerBuilder},
  classify::{Classifier, Decision, GrepFilter},
  compress::{Match, SequenceMatch, compress, is_duplicate},
  config::{
    AnalyzerConfig, ClassifierConfig, CompressionConfig, CompressionLevel,
    DEFAULT_ALLOCATOR_PATTERNS, DEFAULT_TRUSTED_MODULES,
  },
  diff::diff,
  error::{CacheError, CodecError, ConfigError, Error, ParseError, ReportError},
  modules::{Module, ModuleTable, format_module_name},
  report::{
    JsonReport, ReportSink, TextReport, TraceReport, dump_allocations, dump_modules,
    dump_stats, export_json,
  },
  resolver::{
    CachingResolver, ModuleOffsetResolver, NO_MODULE, Resolution, ResolvedFrame,
    SymbolResolver,
  },
  snapshot::{Heap, HeapStats, Retained, Snapshot, SnapshotBuilder},
};
