//! Micro-benchmark harness for the region allocators.
//!
//! Runs each allocator through four scenarios (sequential, random, mixed,
//! stress) on a fresh platform-backed region per run, and emits one
//! CSV row per (allocator, scenario) pair to stdout or a file.

use std::{
    fs::File,
    io::{self, Write as _},
    path::PathBuf,
    process, ptr,
    time::Instant,
};

use argh::{FromArgValue, FromArgs};
use rand::{Rng as _, SeedableRng as _, rngs::StdRng, seq::SliceRandom as _};
use region_alloc::region::{Algorithm, RegionAllocator};
use snafu::{Report, ResultExt as _, Whatever};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

/// Region size handed to each allocator instance.
const DEFAULT_HEAP_SIZE: usize = 10 * 1024 * 1024;

/// Fixed seed so the random scenario is comparable across runs.
const RANDOM_SEED: u64 = 42;

const CSV_HEADER: &str =
    "Allocator,Benchmark,AllocTime_us,FreeTime_us,AllocOps,FreeOps,AllocOpsPerSec,FreeOpsPerSec,PeakUtilization";

/// Compare the in-place region allocators across micro-benchmark scenarios.
#[derive(Debug, FromArgs)]
struct Args {
    /// allocator to benchmark: segregated, buddy or all (default: all)
    #[argh(option, short = 'a', default = "AllocatorChoice::All")]
    allocator: AllocatorChoice,
    /// number of operations per scenario (default: 10000)
    #[argh(option, short = 'n', default = "10_000")]
    num_ops: usize,
    /// output CSV file (default: stdout)
    #[argh(option, short = 'o')]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocatorChoice {
    Segregated,
    Buddy,
    All,
}

impl FromArgValue for AllocatorChoice {
    fn from_arg_value(value: &str) -> Result<Self, String> {
        match value {
            "segregated" => Ok(Self::Segregated),
            "buddy" => Ok(Self::Buddy),
            "all" => Ok(Self::All),
            other => Err(format!("unknown allocator type: {other}")),
        }
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Args = argh::from_env();
    if let Err(err) = run(&args) {
        let report = Report::from_error(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Whatever> {
    let mut out: Box<dyn io::Write> = match &args.output {
        Some(path) => {
            let file = File::create(path).with_whatever_context(|_| {
                format!("failed to create output file {}", path.display())
            })?;
            Box::new(file)
        }
        None => Box::new(io::stdout()),
    };

    writeln!(out, "{CSV_HEADER}").whatever_context("failed to write CSV header")?;

    match args.allocator {
        AllocatorChoice::Segregated => run_benchmarks(
            Algorithm::SegregatedFreelist,
            "SegregatedFreeList",
            args.num_ops,
            out.as_mut(),
        )?,
        AllocatorChoice::Buddy => {
            run_benchmarks(Algorithm::Buddy, "Buddy", args.num_ops, out.as_mut())?;
        }
        AllocatorChoice::All => {
            run_benchmarks(
                Algorithm::SegregatedFreelist,
                "SegregatedFreeList",
                args.num_ops,
                out.as_mut(),
            )?;
            run_benchmarks(Algorithm::Buddy, "Buddy", args.num_ops, out.as_mut())?;
        }
    }

    if let Some(path) = &args.output {
        info!("results written to {}", path.display());
    }
    Ok(())
}

/// Runs every scenario for one algorithm, each on a fresh region.
fn run_benchmarks(
    algorithm: Algorithm,
    name: &'static str,
    num_ops: usize,
    out: &mut dyn io::Write,
) -> Result<(), Whatever> {
    info!("running benchmarks for {name}");

    let scenarios: [(&'static str, ScenarioFn); 4] = [
        ("Sequential", bench_sequential),
        ("Random", bench_random),
        ("Mixed", bench_mixed),
        ("Stress", bench_stress),
    ];

    for (scenario, bench) in scenarios {
        let mut allocator = RegionAllocator::with_platform_backing(algorithm, DEFAULT_HEAP_SIZE)
            .with_whatever_context(|_| format!("failed to create {name} allocator"))?;
        let timings = bench(&mut allocator, num_ops);
        let utilization = allocator.stats().utilization();
        write_row(out, name, scenario, &timings, utilization)
            .whatever_context("failed to write CSV row")?;
    }
    Ok(())
}

type ScenarioFn = fn(&mut RegionAllocator<'static>, usize) -> Timings;

struct Timings {
    alloc_time_us: f64,
    free_time_us: f64,
    alloc_ops: usize,
    free_ops: usize,
}

fn write_row(
    out: &mut dyn io::Write,
    name: &str,
    scenario: &str,
    timings: &Timings,
    utilization: f64,
) -> io::Result<()> {
    writeln!(
        out,
        "{},{},{:.2},{:.2},{},{},{:.2},{:.2},{:.6}",
        name,
        scenario,
        timings.alloc_time_us,
        timings.free_time_us,
        timings.alloc_ops,
        timings.free_ops,
        ops_per_sec(timings.alloc_ops, timings.alloc_time_us),
        ops_per_sec(timings.free_ops, timings.free_time_us),
        utilization,
    )
}

fn ops_per_sec(ops: usize, elapsed_us: f64) -> f64 {
    if elapsed_us <= 0.0 {
        0.0
    } else {
        ops as f64 / (elapsed_us / 1_000_000.0)
    }
}

fn micros_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1_000_000.0
}

/// Fixed-size allocations released in allocation order.
fn bench_sequential(allocator: &mut RegionAllocator<'static>, num_ops: usize) -> Timings {
    let cap = num_ops.min(100_000);
    let mut ptrs = Vec::with_capacity(cap);

    let alloc_start = Instant::now();
    for _ in 0..cap {
        let ptr = allocator.alloc(64);
        if ptr.is_null() {
            break;
        }
        ptrs.push(ptr);
    }
    let alloc_time_us = micros_since(alloc_start);

    let free_start = Instant::now();
    for &ptr in &ptrs {
        unsafe { allocator.free(ptr) };
    }
    let free_time_us = micros_since(free_start);

    Timings {
        alloc_time_us,
        free_time_us,
        alloc_ops: ptrs.len(),
        free_ops: ptrs.len(),
    }
}

/// Random sizes, released in shuffled order.
fn bench_random(allocator: &mut RegionAllocator<'static>, num_ops: usize) -> Timings {
    let cap = num_ops.min(2_000);
    let mut rng = StdRng::seed_from_u64(RANDOM_SEED);
    let mut ptrs = Vec::with_capacity(cap);

    let alloc_start = Instant::now();
    for _ in 0..cap {
        let size = rng.random_range(16..2064);
        let ptr = allocator.alloc(size);
        if ptr.is_null() {
            break;
        }
        ptrs.push(ptr);
    }
    let alloc_time_us = micros_since(alloc_start);

    ptrs.shuffle(&mut rng);

    let free_start = Instant::now();
    for &ptr in &ptrs {
        unsafe { allocator.free(ptr) };
    }
    let free_time_us = micros_since(free_start);

    Timings {
        alloc_time_us,
        free_time_us,
        alloc_ops: ptrs.len(),
        free_ops: ptrs.len(),
    }
}

/// Interleaved phases: small allocations, partial release, larger
/// allocations into the gaps, full release.
fn bench_mixed(allocator: &mut RegionAllocator<'static>, _num_ops: usize) -> Timings {
    let mut ptrs: Vec<*mut u8> = vec![ptr::null_mut(); 500];
    let mut alloc_time_us = 0.0;
    let mut free_time_us = 0.0;
    let mut alloc_ops = 0;
    let mut free_ops = 0;

    let start = Instant::now();
    for slot in ptrs.iter_mut() {
        *slot = allocator.alloc(32);
        if !slot.is_null() {
            alloc_ops += 1;
        }
    }
    alloc_time_us += micros_since(start);

    let start = Instant::now();
    for slot in ptrs.iter_mut().step_by(2) {
        if !slot.is_null() {
            unsafe { allocator.free(*slot) };
            *slot = ptr::null_mut();
            free_ops += 1;
        }
    }
    free_time_us += micros_since(start);

    let start = Instant::now();
    for slot in ptrs.iter_mut().step_by(2) {
        *slot = allocator.alloc(128);
        if !slot.is_null() {
            alloc_ops += 1;
        }
    }
    alloc_time_us += micros_since(start);

    let start = Instant::now();
    for slot in ptrs.iter_mut() {
        if !slot.is_null() {
            unsafe { allocator.free(*slot) };
            *slot = ptr::null_mut();
            free_ops += 1;
        }
    }
    free_time_us += micros_since(start);

    Timings {
        alloc_time_us,
        free_time_us,
        alloc_ops,
        free_ops,
    }
}

/// Same-size allocations until the region (or the operation budget) runs
/// out, then a full release.
fn bench_stress(allocator: &mut RegionAllocator<'static>, num_ops: usize) -> Timings {
    let cap = num_ops.min(10_000);
    let mut ptrs = Vec::with_capacity(cap);

    let alloc_start = Instant::now();
    for _ in 0..cap {
        let ptr = allocator.alloc(256);
        if ptr.is_null() {
            break;
        }
        ptrs.push(ptr);
    }
    let alloc_time_us = micros_since(alloc_start);

    let free_start = Instant::now();
    for &ptr in &ptrs {
        unsafe { allocator.free(ptr) };
    }
    let free_time_us = micros_since(free_start);

    Timings {
        alloc_time_us,
        free_time_us,
        alloc_ops: ptrs.len(),
        free_ops: ptrs.len(),
    }
}
