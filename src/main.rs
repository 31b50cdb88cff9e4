#![allow(clippy::needless_return)]

use std::net::IpAddr;

use anyhow::Context;
use cdnscan::address::{FileRanges, RangeSource, StaticRanges};
use cdnscan::cache::FileFailureStore;
use cdnscan::campaign::{
    Campaign, CampaignEvent, CampaignOptions, ScanMethod, ScoredResult, Summary,
};
use cdnscan::input::{Config, Opts};
use cdnscan::scanner::{tunnel_worker_count, worker_count};
use cdnscan::tui::print_opening;
use cdnscan::{detail, output, warning};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use tokio_util::sync::CancellationToken;

/// Descriptors kept free for the runtime, logging and the failure cache.
const RESERVED_FILE_DESCRIPTORS: u64 = 100;
/// Below this many descriptors the pool is halved instead of trimmed.
const SMALL_FILE_LIMIT: u64 = 1_000;
/// How many ranked results the final table shows.
const RANKING_ROWS: usize = 20;
/// JSON mode reports progress every this many completions.
const JSON_PROGRESS_STEP: usize = 100;

#[tokio::main]
/// Reads the command line options, runs one campaign and prints what it found.
async fn main() -> anyhow::Result<()> {
    #[cfg(not(unix))]
    let _ = ansi_term::enable_ansi_support();

    env_logger::init();

    let mut opts: Opts = Opts::read();
    let config = Config::read(opts.config_path.clone()).context("Invalid configuration file")?;
    opts.merge(&config);

    debug!("Main() `opts` arguments are {opts:?}");

    print_opening(&opts);

    let ranges = collect_ranges(&opts).await?;
    if ranges.is_empty() {
        warning!(
            "No ranges given, aborting campaign. Use --ranges or --ranges-file.",
            opts.greppable,
            opts.accessible
        );
        std::process::exit(1);
    }

    let method = match &opts.tunnel {
        Some(link) => ScanMethod::Tunnel(link.parse().context("Invalid tunnel config")?),
        None => ScanMethod::Trace,
    };

    let fraction = opts.speed.resource_fraction();
    let inferred = match method {
        ScanMethod::Trace => worker_count(fraction, num_cpus::get()),
        ScanMethod::Tunnel(_) => tunnel_worker_count(fraction),
    };
    let ulimit = adjust_ulimit_size(&opts);
    let workers = infer_workers(&opts, ulimit, opts.workers.unwrap_or(inferred));

    let options = CampaignOptions {
        ranges,
        ports: opts.ports(),
        profile: opts.speed,
        target: opts.target,
        ping_min: opts.ping_min,
        ping_max: opts.ping_max,
        method,
        shuffle: !opts.no_shuffle,
        workers: Some(workers),
    };

    detail!(
        format!(
            "Speed {}, {} workers, target {}, ping {}..{}ms, ports {:?}",
            opts.speed, workers, opts.target, opts.ping_min, opts.ping_max, options.ports
        ),
        opts.greppable || opts.json,
        opts.accessible
    );

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Stop requested");
            stop.cancel();
        }
    });

    let mut campaign = Campaign::new(options, cancel);
    if let Some(path) = &opts.failure_cache {
        campaign = campaign.with_failure_store(Box::new(FileFailureStore::new(path)));
    }

    let bar = progress_bar(&opts);
    let mut found = Vec::new();
    let outcome = campaign
        .run(|event| report(&opts, &bar, &mut found, event))
        .await;
    bar.finish_and_clear();

    let summary = match outcome {
        Ok(summary) => summary,
        Err(e) => {
            warning!(format!("Campaign failed: {e}"), opts.json, opts.accessible);
            return Err(e.into());
        }
    };

    if !opts.greppable && !opts.json {
        print_ranking(&opts, &mut found);
        print_summary(&opts, &summary);
    }
    Ok(())
}

/// Gathers range strings from the command line and the ranges file.
async fn collect_ranges(opts: &Opts) -> anyhow::Result<Vec<String>> {
    let mut sources: Vec<Box<dyn RangeSource>> =
        vec![Box::new(StaticRanges(opts.ranges.clone()))];
    if let Some(path) = &opts.ranges_file {
        sources.push(Box::new(FileRanges(path.clone())));
    }

    let mut ranges = Vec::new();
    for source in &sources {
        ranges.extend(source.fetch().await.context("Could not read ranges")?);
    }
    Ok(ranges)
}

fn progress_bar(opts: &Opts) -> ProgressBar {
    if opts.greppable || opts.json || opts.accessible {
        return ProgressBar::hidden();
    }
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    ProgressBar::new(0).with_style(style)
}

fn report(opts: &Opts, bar: &ProgressBar, found: &mut Vec<ScoredResult>, event: CampaignEvent) {
    if opts.json {
        let wanted = match &event {
            CampaignEvent::Progress(p) => {
                p.completed % JSON_PROGRESS_STEP == 0 || p.completed == p.total
            }
            _ => true,
        };
        if wanted {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => debug!("Could not serialize event: {e}"),
            }
        }
        if let CampaignEvent::Result(result) = event {
            found.push(result);
        }
        return;
    }

    match event {
        CampaignEvent::Result(result) => {
            if opts.greppable {
                let line = result
                    .config
                    .clone()
                    .unwrap_or_else(|| result.address.to_string());
                println!("{line}");
            } else if bar.is_hidden() {
                println!("{}", result_line(opts, &result));
            } else {
                bar.println(result_line(opts, &result));
            }
            found.push(result);
        }
        CampaignEvent::Progress(progress) => {
            bar.set_length(progress.total as u64);
            bar.set_position(progress.completed as u64);
            bar.set_message(format!("{:.0} addr/s", progress.throughput_per_sec));
        }
        CampaignEvent::Warning { message } => {
            bar.suspend(|| {
                warning!(message, opts.greppable, opts.accessible);
            });
        }
        CampaignEvent::Summary(_) => {}
    }
}

fn result_line(opts: &Opts, result: &ScoredResult) -> String {
    let ping = result
        .ping_ms
        .map_or_else(|| "-".to_owned(), |ping| format!("{ping:.0}ms"));
    let ports = result
        .open_ports
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    if opts.accessible {
        return format!(
            "Found {} ping {ping} ports {ports} score {:.0}",
            result.address, result.score
        );
    }
    format!(
        "{} {} {} [{}] {:.0}",
        "Found".bold(),
        result.address.to_string().green(),
        colour_ping(result.ping_ms, &ping),
        ports.purple(),
        result.score
    )
}

fn colour_ping(ping_ms: Option<f64>, text: &str) -> colored::ColoredString {
    match ping_ms {
        Some(ping) if ping < 100.0 => text.green(),
        Some(ping) if ping < 500.0 => text.yellow(),
        _ => text.red(),
    }
}

/// Best score first, lower ping breaking ties.
fn rank(found: &mut [ScoredResult]) {
    found.sort_by(|a, b| {
        b.score.total_cmp(&a.score).then_with(|| {
            a.ping_ms
                .unwrap_or(f64::MAX)
                .total_cmp(&b.ping_ms.unwrap_or(f64::MAX))
        })
    });
}

fn print_ranking(opts: &Opts, found: &mut [ScoredResult]) {
    if found.is_empty() {
        warning!("No usable addresses found.", false, opts.accessible);
        return;
    }
    if let Some(target) = opts.target.limit() {
        if found.len() < target {
            detail!(
                format!("Only {} of {target} wanted addresses were found.", found.len()),
                false,
                opts.accessible
            );
        }
    }
    rank(found);

    output!(
        format!("Top {} of {} addresses:", RANKING_ROWS.min(found.len()), found.len()),
        false,
        opts.accessible
    );
    for (i, result) in found.iter().take(RANKING_ROWS).enumerate() {
        let address: &IpAddr = &result.address;
        let line = format!(
            "{:>3}. {:<39} {:>8} score {:>3.0}",
            i + 1,
            address,
            result
                .ping_ms
                .map_or_else(|| "-".to_owned(), |ping| format!("{ping:.0}ms")),
            result.score
        );
        println!("{line}");
        if let Some(config) = &result.config {
            println!("     {config}");
        }
    }
}

fn print_summary(opts: &Opts, summary: &Summary) {
    output!(
        format!(
            "Started {}, {} after {:.1}s: {} found in {} scanned.",
            summary.started_at.format("%Y-%m-%d %H:%M:%S"),
            summary.reason,
            summary.elapsed_sec,
            summary.total_found,
            summary.total_scanned
        ),
        false,
        opts.accessible
    );
}

#[cfg(unix)]
fn adjust_ulimit_size(opts: &Opts) -> u64 {
    use rlimit::Resource;

    if let Some(limit) = opts.ulimit {
        if Resource::NOFILE.set(limit, limit).is_ok() {
            detail!(
                format!("Automatically increasing ulimit value to {limit}."),
                opts.greppable,
                opts.accessible
            );
        } else {
            warning!(
                "ERROR. Failed to set ulimit value.",
                opts.greppable,
                opts.accessible
            );
        }
    }

    Resource::NOFILE.get().map_or(u64::MAX, |(soft, _)| soft)
}

#[cfg(not(unix))]
fn adjust_ulimit_size(_opts: &Opts) -> u64 {
    u64::MAX
}

/// Lowers the worker pool when the open-file limit cannot carry it.
fn infer_workers(opts: &Opts, ulimit: u64, workers: usize) -> usize {
    let wanted = workers as u64;
    if ulimit >= wanted.saturating_add(RESERVED_FILE_DESCRIPTORS) {
        return workers;
    }

    warning!(
        "File limit is lower than the worker pool. Consider upping with --ulimit.",
        opts.greppable,
        opts.accessible
    );
    let lowered = if ulimit < SMALL_FILE_LIMIT {
        info!("Halving workers because the file limit is small");
        ulimit / 2
    } else {
        ulimit - RESERVED_FILE_DESCRIPTORS
    };
    usize::try_from(lowered.max(1)).unwrap_or(workers)
}

#[cfg(test)]
mod tests {
    use super::{infer_workers, rank};
    use cdnscan::campaign::ScoredResult;
    use cdnscan::input::Opts;

    fn result(last: u8, score: f64, ping_ms: f64) -> ScoredResult {
        ScoredResult {
            address: [104, 16, 0, last].into(),
            open_ports: vec![443],
            ping_ms: Some(ping_ms),
            score,
            config: None,
        }
    }

    #[test]
    fn workers_untouched_with_room() {
        let opts = Opts::default();
        assert_eq!(infer_workers(&opts, 10_000, 2000), 2000);
    }

    #[test]
    fn workers_trimmed_to_limit() {
        let opts = Opts::default();
        assert_eq!(infer_workers(&opts, 1_024, 2000), 924);
    }

    #[test]
    fn workers_halved_on_small_limit() {
        let opts = Opts::default();
        assert_eq!(infer_workers(&opts, 256, 400), 128);
    }

    #[test]
    fn workers_never_zero() {
        let opts = Opts::default();
        assert_eq!(infer_workers(&opts, 1, 150), 1);
    }

    #[test]
    fn ranking_prefers_score_then_ping() {
        let mut found = vec![result(1, 40.0, 90.0), result(2, 60.0, 300.0), result(3, 60.0, 120.0)];
        rank(&mut found);
        let order: Vec<u8> = found
            .iter()
            .map(|r| match r.address {
                std::net::IpAddr::V4(v4) => v4.octets()[3],
                std::net::IpAddr::V6(_) => 0,
            })
            .collect();
        assert_eq!(order, vec![3, 2, 1]);
    }
}
