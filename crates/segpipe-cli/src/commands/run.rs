//! Run command - drive a synthetic pipeline end to end.
//!
//! Every synthetic segment adds one to each element, so a request pushed with
//! value `v` comes out as `v + segments`. The consumer checks that, which
//! also checks ordering.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, ValueEnum};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{debug, info, warn};

use segpipe_core::tensor::{TensorError, TensorEnvelope};
use segpipe_core::{
    ElementType, FnExecutor, PipelinedModelRunner, StageExecutor, TensorSet, TensorSpec,
};

use super::load_config;

/// Output format for the run report.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Arguments for the run command.
#[derive(Args)]
pub struct RunArgs {
    /// Number of segments
    #[arg(short, long, default_value = "3")]
    segments: usize,

    /// Number of requests to push
    #[arg(short = 'n', long, default_value = "100")]
    requests: usize,

    /// Float32 elements per request
    #[arg(long, default_value = "1024")]
    elements: usize,

    /// Simulated execution time per segment, in milliseconds
    #[arg(long, default_value = "0")]
    latency_ms: u64,

    /// Make the last segment fail every Nth request
    #[arg(long)]
    fail_every: Option<usize>,

    /// Input queue capacity (overrides config)
    #[arg(long)]
    input_capacity: Option<usize>,

    /// Output queue capacity (overrides config)
    #[arg(long)]
    output_capacity: Option<usize>,

    /// Report format
    #[arg(short, long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Hide the progress bar
    #[arg(long)]
    no_progress: bool,
}

#[derive(Debug, Serialize)]
struct SegmentReport {
    segment: usize,
    invocations: u64,
    failures: u64,
    mean_us: u128,
}

#[derive(Debug, Serialize)]
struct RunReport {
    segments: usize,
    requests: usize,
    succeeded: usize,
    failed: usize,
    mismatched: usize,
    elapsed_ms: u128,
    requests_per_sec: f64,
    queue_capacities: Vec<usize>,
    queue_high_water_marks: Vec<usize>,
    per_segment: Vec<SegmentReport>,
}

#[derive(Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    mismatched: usize,
}

pub async fn run(args: RunArgs, config_path: Option<&Path>) -> anyhow::Result<()> {
    if args.segments == 0 {
        anyhow::bail!("--segments must be at least 1");
    }
    if args.fail_every == Some(0) {
        anyhow::bail!("--fail-every must be at least 1");
    }

    let mut config = load_config(config_path)?;
    if args.input_capacity.is_some() {
        config.input_queue_capacity = args.input_capacity;
    }
    if args.output_capacity.is_some() {
        config.output_queue_capacity = args.output_capacity;
    }

    let executors = synthetic_segments(&args);
    let runner = Arc::new(PipelinedModelRunner::builder(executors).config(config).build()?);
    info!(
        "Running {} requests through {} segments",
        args.requests, args.segments
    );

    let progress = if args.no_progress || matches!(args.format, OutputFormat::Json) {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(args.requests as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} requests")?
                .progress_chars("=>-"),
        );
        pb
    };

    let start = Instant::now();

    let producer = {
        let runner = Arc::clone(&runner);
        let (requests, elements) = (args.requests, args.elements);
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let pushed = (0..requests).try_for_each(|seq| -> anyhow::Result<()> {
                let values = vec![seq as f32; elements];
                let input =
                    TensorEnvelope::from_slice("t0", &values, runner.input_allocator().as_ref())?;
                runner.push(TensorSet::from_tensors(vec![input])?)?;
                Ok(())
            });
            // Unblocks the consumer even if a push failed.
            runner.close();
            pushed
        })
    };

    let consumer = {
        let runner = Arc::clone(&runner);
        let progress = progress.clone();
        let segments = args.segments;
        let output = format!("t{}", segments);
        tokio::task::spawn_blocking(move || -> anyhow::Result<Tally> {
            let mut tally = Tally::default();
            let mut seq = 0usize;
            loop {
                match runner.pop() {
                    Ok(Some(result)) => {
                        let first = result.require(&output)?.to_vec::<f32>()?[0];
                        let expected = (seq + segments) as f32;
                        if first == expected {
                            tally.succeeded += 1;
                        } else {
                            warn!(
                                "Request {} came back as {}, expected {}",
                                seq, first, expected
                            );
                            tally.mismatched += 1;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Request {} failed: {}", seq, e);
                        tally.failed += 1;
                    }
                }
                seq += 1;
                progress.inc(1);
            }
            Ok(tally)
        })
    };

    producer.await??;
    let tally = consumer.await??;
    let elapsed = start.elapsed();
    progress.finish_and_clear();

    let report = RunReport {
        segments: args.segments,
        requests: args.requests,
        succeeded: tally.succeeded,
        failed: tally.failed,
        mismatched: tally.mismatched,
        elapsed_ms: elapsed.as_millis(),
        requests_per_sec: args.requests as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        queue_capacities: runner.queue_capacities(),
        queue_high_water_marks: runner.queue_high_water_marks(),
        per_segment: runner
            .segment_stats()
            .iter()
            .enumerate()
            .map(|(segment, stats)| SegmentReport {
                segment,
                invocations: stats.invocations,
                failures: stats.failures,
                mean_us: stats.mean_time().as_micros(),
            })
            .collect(),
    };

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&report, elapsed),
    }

    if report.mismatched > 0 {
        anyhow::bail!("{} results did not match their request", report.mismatched);
    }

    Ok(())
}

/// Segment `i` reads `t{i}` and writes `t{i+1}`.
fn synthetic_segments(args: &RunArgs) -> Vec<Arc<dyn StageExecutor>> {
    let latency = Duration::from_millis(args.latency_ms);
    let last = args.segments - 1;

    (0..args.segments)
        .map(|index| {
            let input = format!("t{}", index);
            let output = format!("t{}", index + 1);
            let fail_every = if index == last { args.fail_every } else { None };
            let calls = AtomicUsize::new(0);

            Arc::new(FnExecutor::new(
                vec![TensorSpec::new(input.clone(), ElementType::Float32)],
                vec![TensorSpec::new(output.clone(), ElementType::Float32)],
                move |inputs, outputs| {
                    let call = calls.fetch_add(1, Ordering::Relaxed) + 1;
                    if !latency.is_zero() {
                        thread::sleep(latency);
                    }
                    if fail_every.is_some_and(|n| call % n == 0) {
                        return Err(TensorError::execution(format!(
                            "injected failure on call {}",
                            call
                        )));
                    }
                    let values: Vec<f32> = inputs.require(&input)?.to_vec()?;
                    let next: Vec<f32> = values.into_iter().map(|v| v + 1.0).collect();
                    outputs.write_slice(&output, &next)
                },
            )) as Arc<dyn StageExecutor>
        })
        .collect()
}

fn print_report(report: &RunReport, elapsed: Duration) {
    println!(
        "{} Processed {} requests through {} segments in {:?}",
        style("✓").green(),
        report.requests,
        report.segments,
        elapsed
    );
    println!("  Succeeded: {}", style(report.succeeded).green());
    if report.failed > 0 {
        println!("  Failed:    {}", style(report.failed).red());
    }
    if report.mismatched > 0 {
        println!("  Mismatched: {}", style(report.mismatched).red());
    }
    println!("  Throughput: {:.1} requests/s", report.requests_per_sec);
    println!();
    println!("  {:<8} {:>12} {:>10} {:>12}", "segment", "invocations", "failures", "mean (µs)");
    for segment in &report.per_segment {
        println!(
            "  {:<8} {:>12} {:>10} {:>12}",
            segment.segment, segment.invocations, segment.failures, segment.mean_us
        );
    }
    println!();
    println!(
        "  Queue high-water marks: {:?} (capacities {:?})",
        report.queue_high_water_marks, report.queue_capacities
    );
}
