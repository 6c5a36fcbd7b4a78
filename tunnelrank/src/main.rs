use anyhow::Result;
#[cfg(any(feature = "probe", feature = "fetch"))]
use anyhow::anyhow;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
#[cfg(any(feature = "probe", feature = "fetch"))]
use std::time::Duration;
#[cfg(any(feature = "probe", feature = "fetch"))]
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Jsonl }

#[derive(Debug, Parser)]
#[command(name = "tunnelrank", version, about = "Rank tunnel endpoint candidates by probed latency")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./tunnelrank.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Parse endpoint links and emit descriptors as JSON lines
    Parse {
        /// Links given inline
        uris: Vec<String>,
        /// File with newline-delimited links (comments with # and blanks ignored)
        #[arg(long, value_name = "FILE")]
        input: Option<PathBuf>,
    },
    /// Fetch subscription sources and print the decoded links
    #[cfg(feature = "fetch")]
    Fetch {
        /// Source URLs (base64-encoded bodies). Falls back to the config file.
        sources: Vec<String>,
    },
    /// Probe candidates through the engine binary and print them ranked by latency
    #[cfg(feature = "probe")]
    Rank {
        /// Subscription source URL (repeatable)
        #[cfg(feature = "fetch")]
        #[arg(long, value_name = "URL")]
        source: Vec<String>,
        /// File with newline-delimited links
        #[arg(long, value_name = "FILE")]
        input: Option<PathBuf>,
        /// Engine binary (xray-compatible)
        #[arg(long)]
        engine: Option<PathBuf>,
        /// Canary URL fetched through each candidate; any promptly-2xx endpoint works
        #[arg(long)]
        canary_url: Option<String>,
        /// Overall canary timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Window for the engine's socks listener to come up, in milliseconds
        #[arg(long)]
        startup_timeout_ms: Option<u64>,
        /// Max simultaneous probes; each one spawns an engine process
        #[arg(long)]
        concurrency: Option<usize>,
        /// Enable UDP association on the local socks inbound
        #[arg(long, default_value_t = false)]
        udp: bool,
        /// Directory for per-probe engine configs (default: OS tempdir)
        #[arg(long, value_name = "DIR")]
        config_dir: Option<PathBuf>,
        /// Output format: text, json, or jsonl
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Output file (overwrites)
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        /// Write CSV instead of text/json when --out is provided
        #[arg(long, default_value_t = false)]
        csv: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tunnelrank=info,tunnel_probe=info,subscription=info,tunnelrank_core=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    #[cfg(any(feature = "probe", feature = "fetch"))]
    let loaded_cfg = config::load_config(cli.config.as_deref());
    #[cfg(not(any(feature = "probe", feature = "fetch")))]
    let _loaded_cfg: Option<config::Config> = None;

    match cli.command {
        Commands::Version => {
            println!(
                "tunnelrank {} (core {})",
                env!("CARGO_PKG_VERSION"),
                tunnelrank_core::version()
            );
        }
        Commands::Parse { uris, input } => {
            let mut links = uris;
            if let Some(path) = input {
                links.extend(read_links_file(&path)?);
            }
            if links.is_empty() {
                return Err(anyhow::anyhow!("provide links or --input <FILE>"));
            }
            for uri in links {
                match link_parse::parse(&uri) {
                    Ok(d) => println!("{}", serde_json::to_string(&d)?),
                    Err(e) => {
                        let obj = serde_json::json!({ "uri": uri, "error": e.to_string() });
                        println!("{}", serde_json::to_string(&obj)?);
                    }
                }
            }
        }
        #[cfg(feature = "fetch")]
        Commands::Fetch { sources } => {
            let configured = loaded_cfg
                .as_ref()
                .and_then(|c| c.rank.as_ref())
                .and_then(|r| r.sources.clone())
                .unwrap_or_default();
            let sources = valid_sources(if sources.is_empty() { configured } else { sources });
            if sources.is_empty() {
                return Err(anyhow!("no subscription sources given"));
            }
            let rt = tokio::runtime::Runtime::new()?;
            let (lines, failures) = rt.block_on(async {
                let client = http_client()?;
                Ok::<_, anyhow::Error>(subscription::fetch_all(&client, &sources).await)
            })?;
            if lines.is_empty() && !failures.is_empty() {
                return Err(anyhow!("all subscription sources failed"));
            }
            for line in lines {
                println!("{line}");
            }
        }
        #[cfg(feature = "probe")]
        Commands::Rank {
            #[cfg(feature = "fetch")]
            source,
            input,
            engine,
            canary_url,
            timeout_ms,
            startup_timeout_ms,
            concurrency,
            udp,
            config_dir,
            format,
            out,
            csv,
        } => {
            let rank_cfg = loaded_cfg
                .as_ref()
                .and_then(|c| c.rank.clone())
                .unwrap_or_default();

            #[cfg(feature = "fetch")]
            let sources = valid_sources(if source.is_empty() {
                rank_cfg.sources.clone().unwrap_or_default()
            } else {
                source
            });

            let canary_url = canary_url
                .or(rank_cfg.canary_url.clone())
                .unwrap_or_else(|| "http://www.google.com".to_string());
            url::Url::parse(&canary_url)
                .map_err(|e| anyhow!("invalid canary url {canary_url}: {e}"))?;

            let opts = tunnel_probe::ProbeOptions {
                engine_bin: engine
                    .or(rank_cfg.engine.clone().map(PathBuf::from))
                    .unwrap_or_else(|| PathBuf::from("xray")),
                canary_url,
                request_timeout: Duration::from_millis(
                    timeout_ms.or(rank_cfg.timeout_ms).unwrap_or(10_000),
                ),
                startup_timeout: Duration::from_millis(
                    startup_timeout_ms
                        .or(rank_cfg.startup_timeout_ms)
                        .unwrap_or(2_000),
                ),
                enable_udp: udp || rank_cfg.udp.unwrap_or(false),
                config_dir: config_dir
                    .or(rank_cfg.config_dir.clone().map(PathBuf::from))
                    .unwrap_or_else(std::env::temp_dir),
                ..tunnel_probe::ProbeOptions::default()
            };
            let concurrency = concurrency.or(rank_cfg.concurrency).unwrap_or(30);

            let mut links: Vec<String> = Vec::new();
            if let Some(path) = input {
                links.extend(read_links_file(&path)?);
            }

            let rt = tokio::runtime::Runtime::new()?;
            let (ranking, unparsed) = rt.block_on(async move {
                #[cfg(feature = "fetch")]
                if !sources.is_empty() {
                    let client = http_client()?;
                    let (mut fetched, failures) =
                        subscription::fetch_all(&client, &sources).await;
                    if fetched.is_empty() && !failures.is_empty() && links.is_empty() {
                        return Err(anyhow!("all subscription sources failed"));
                    }
                    links.append(&mut fetched);
                }
                if links.is_empty() {
                    return Err(anyhow!("no candidate links: provide --source or --input"));
                }

                let (descriptors, parse_failures) = link_parse::parse_all(&links);
                for (uri, e) in &parse_failures {
                    warn!(error = %e, "dropped unparsable link: {uri}");
                }
                info!(
                    candidates = descriptors.len(),
                    unparsed = parse_failures.len(),
                    concurrency,
                    "probing candidates"
                );

                let allocator = tunnelrank_core::PortAllocator::new();
                let reports =
                    tunnel_probe::probe_many(descriptors, allocator, opts, concurrency).await;
                Ok::<_, anyhow::Error>((tunnel_probe::rank(reports), parse_failures.len()))
            })?;

            for report in &ranking.failed {
                if let Some(e) = report.error() {
                    warn!(
                        label = report.descriptor.label.as_str(),
                        kind = e.kind(),
                        error = %e,
                        "candidate failed"
                    );
                }
            }
            info!(
                reachable = ranking.reachable.len(),
                failed = ranking.failed.len(),
                unparsed,
                "ranking complete"
            );

            match out {
                Some(path) if csv => write_ranking_csv(&path, &ranking)?,
                Some(path) => std::fs::write(&path, render_ranking(&ranking, format)?)?,
                None => print!("{}", render_ranking(&ranking, format)?),
            }
        }
    }
    Ok(())
}

fn read_links_file(path: &std::path::Path) -> Result<Vec<String>> {
    use std::io::BufRead;
    let fh = std::fs::File::open(path)?;
    let br = std::io::BufReader::new(fh);
    Ok(br
        .lines()
        .filter_map(|l| l.ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && !s.starts_with('#'))
        .collect())
}

#[cfg(feature = "fetch")]
fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent(format!("tunnelrank/{}", env!("CARGO_PKG_VERSION")))
        .build()?)
}

#[cfg(feature = "fetch")]
fn valid_sources(sources: Vec<String>) -> Vec<String> {
    sources
        .into_iter()
        .filter(|s| match url::Url::parse(s) {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "skipping invalid source url: {s}");
                false
            }
        })
        .collect()
}

#[cfg(feature = "probe")]
fn report_json(report: &tunnel_probe::ProbeReport) -> serde_json::Value {
    serde_json::json!({
        "label": report.descriptor.label,
        "host": report.descriptor.host,
        "port": report.descriptor.port,
        "latency_ms": report.latency_ms().map(|v| v as u64),
        "started_at": report.started_at,
        "ended_at": report.ended_at,
    })
}

#[cfg(feature = "probe")]
fn render_ranking(ranking: &tunnel_probe::Ranking, format: OutputFormat) -> Result<String> {
    let mut buf = String::new();
    match format {
        OutputFormat::Text => {
            for r in &ranking.reachable {
                buf.push_str(&format!(
                    "{:>6} ms  {}  {}:{}\n",
                    r.latency_ms().unwrap_or_default(),
                    r.descriptor.label,
                    r.descriptor.host,
                    r.descriptor.port
                ));
            }
        }
        OutputFormat::Json => {
            let arr: Vec<_> = ranking.reachable.iter().map(report_json).collect();
            buf.push_str(&serde_json::to_string_pretty(&arr)?);
            buf.push('\n');
        }
        OutputFormat::Jsonl => {
            for r in &ranking.reachable {
                buf.push_str(&serde_json::to_string(&report_json(r))?);
                buf.push('\n');
            }
        }
    }
    Ok(buf)
}

#[cfg(feature = "probe")]
fn write_ranking_csv(path: &std::path::Path, ranking: &tunnel_probe::Ranking) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(std::fs::File::create(path)?);
    wtr.write_record(["label", "host", "port", "latency_ms", "started_at", "ended_at"])?;
    for r in &ranking.reachable {
        wtr.write_record([
            r.descriptor.label.clone(),
            r.descriptor.host.clone(),
            r.descriptor.port.to_string(),
            r.latency_ms().unwrap_or_default().to_string(),
            r.started_at.clone(),
            r.ended_at.clone(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
