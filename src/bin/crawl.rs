//! Demo crawl driven by the fanout dispatcher.

use anyhow::{Context, Result};
use clap::Parser;
use fanout::{canonical, DispatchControls, Dispatcher, WebFetcher};
use std::time::{Duration, Instant};
use tokio::runtime::Builder;
use url::Url;

const EXECUTOR_COUNT: usize = fanout::DEFAULT_EXECUTOR_COUNT;
const INBOX_DEPTH: usize = fanout::DEFAULT_INBOX_DEPTH;

#[derive(Parser, Debug)]
#[command(name = "fanout-crawl", about = "Breadth-first crawl with bounded fan-out")]
struct Cli {
    /// Seed URLs to start from
    #[arg(required = true)]
    seeds: Vec<String>,

    /// Maximum crawl depth
    #[arg(long, env = "FANOUT_MAX_DEPTH", default_value_t = 4)]
    max_depth: u8,

    /// Maximum concurrent fetches
    #[arg(long, env = "FANOUT_GATE_CAPACITY", default_value_t = 4)]
    gate_capacity: usize,

    /// Seconds to run before requesting shutdown (0 = run to exhaustion)
    #[arg(long, env = "FANOUT_DURATION", default_value_t = 0)]
    duration_secs: u64,

    /// Domain allowlist, comma separated (empty = any domain)
    #[arg(long, env = "FANOUT_DOMAINS", default_value = "")]
    allowed_domains: String,

    /// Milliseconds to wait before each fetch
    #[arg(long, env = "FANOUT_POLITENESS_MS", default_value_t = 250)]
    politeness_ms: u64,

    /// Maximum links captured per page
    #[arg(long, env = "FANOUT_MAX_LINKS", default_value_t = 16)]
    max_links_per_page: usize,

    /// Emit the final report as JSON instead of the stats summary
    #[arg(long, default_value_t = false)]
    json: bool,
}

impl Cli {
    fn domains_vec(&self) -> Vec<String> {
        self.allowed_domains
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let rt = Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(crawl(cli))
}

async fn crawl(cli: Cli) -> Result<()> {
    let seeds = cli
        .seeds
        .iter()
        .map(|raw| Url::parse(raw).with_context(|| format!("invalid seed url: {raw}")))
        .collect::<Result<Vec<_>>>()?;

    let fetcher = WebFetcher::new(
        cli.domains_vec(),
        cli.max_links_per_page,
        Duration::from_millis(cli.politeness_ms),
    )?;

    let mut controls = DispatchControls::new(cli.max_depth, cli.gate_capacity);
    if cli.duration_secs > 0 {
        controls = controls.with_deadline(Duration::from_secs(cli.duration_secs));
    }

    let dispatcher = Dispatcher::<Url, EXECUTOR_COUNT, INBOX_DEPTH>::new(
        seeds,
        canonical::url_canonicalizer(),
        fetcher.fetch_fn(),
        controls,
    );

    let cancel = dispatcher.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, draining");
            cancel.cancel();
        }
    });

    let start = Instant::now();
    let report = match dispatcher.run().await {
        Ok(report) => report,
        Err(cancelled) => {
            eprintln!("{cancelled}");
            cancelled.report
        }
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.stats.report(start.elapsed());
        println!("visited: {}", report.visited.len());
        for failure in &report.failures {
            eprintln!(
                "failed [depth {}] {}: {}",
                failure.depth, failure.item, failure.message
            );
        }
    }

    Ok(())
}
