//! Per-candidate probing and ranking.
//!
//! One probe claims two local ports, writes a fresh engine config, launches
//! the engine binary, waits for its socks listener to accept, times a single
//! canary GET through it and tears the process down on every branch. Probes
//! fan out under a semaphore; each OS process and socket pair is why the
//! fan-out is bounded.

mod process;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use engine_config::BuildOptions;
use process::EngineProcess;
use tunnelrank_core::{EndpointDescriptor, PortAllocator, RankError, Result};

/// Settings shared by every probe in a run.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Engine binary, e.g. an xray build.
    pub engine_bin: PathBuf,
    /// External URL the canary GET targets; any promptly-2xx endpoint works.
    pub canary_url: String,
    pub connect_timeout: Duration,
    /// Overall deadline for the canary request.
    pub request_timeout: Duration,
    /// Window for the socks listener to start accepting.
    pub startup_timeout: Duration,
    pub enable_udp: bool,
    /// Where per-probe config files land. They are not deleted here;
    /// cleanup belongs to the caller (the default is the OS tempdir).
    pub config_dir: PathBuf,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            engine_bin: PathBuf::from("xray"),
            canary_url: "http://www.google.com".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(2),
            enable_udp: false,
            config_dir: std::env::temp_dir(),
        }
    }
}

/// How one probe ended.
#[derive(Debug)]
pub enum ProbeOutcome {
    Reachable { latency: Duration },
    Failed { error: RankError },
}

/// Result of probing one candidate; immutable once produced.
#[derive(Debug)]
pub struct ProbeReport {
    pub descriptor: EndpointDescriptor,
    pub outcome: ProbeOutcome,
    pub started_at: String,
    pub ended_at: String,
}

impl ProbeReport {
    pub fn is_reachable(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Reachable { .. })
    }

    pub fn latency(&self) -> Option<Duration> {
        match &self.outcome {
            ProbeOutcome::Reachable { latency } => Some(*latency),
            ProbeOutcome::Failed { .. } => None,
        }
    }

    pub fn latency_ms(&self) -> Option<u128> {
        self.latency().map(|d| d.as_millis())
    }

    pub fn error(&self) -> Option<&RankError> {
        match &self.outcome {
            ProbeOutcome::Failed { error } => Some(error),
            ProbeOutcome::Reachable { .. } => None,
        }
    }
}

/// Reachable candidates ascending by latency, failures kept for reporting.
#[derive(Debug)]
pub struct Ranking {
    pub reachable: Vec<ProbeReport>,
    pub failed: Vec<ProbeReport>,
}

/// Probe one candidate end to end. Failures land in the report's outcome;
/// this never aborts a batch.
pub async fn probe_one(
    descriptor: EndpointDescriptor,
    allocator: &PortAllocator,
    opts: &ProbeOptions,
) -> ProbeReport {
    let started_at = now_rfc3339();
    let outcome = match run_probe(&descriptor, allocator, opts).await {
        Ok(latency) => {
            info!(label = descriptor.label.as_str(), latency_ms = latency.as_millis() as u64, "reachable");
            ProbeOutcome::Reachable { latency }
        }
        Err(error) => {
            debug!(label = descriptor.label.as_str(), error = %error, "probe failed");
            ProbeOutcome::Failed { error }
        }
    };
    ProbeReport {
        descriptor,
        outcome,
        started_at,
        ended_at: now_rfc3339(),
    }
}

async fn run_probe(
    descriptor: &EndpointDescriptor,
    allocator: &PortAllocator,
    opts: &ProbeOptions,
) -> Result<Duration> {
    // The binding outlives the engine process below; its claims release
    // when this function returns, after shutdown.
    let binding = allocator.binding()?;

    let config = engine_config::build(
        descriptor,
        &binding,
        BuildOptions {
            enable_udp: opts.enable_udp,
        },
    );
    let config_path = opts
        .config_dir
        .join(format!("tunnelrank-{}.json", Uuid::new_v4()));
    let body = serde_json::to_vec_pretty(&config)
        .map_err(|e| RankError::EngineLaunch(format!("serialize config: {e}")))?;
    tokio::fs::write(&config_path, body).await?;

    let engine = EngineProcess::launch(&opts.engine_bin, &config_path, &descriptor.label)?;

    let socks_port = binding.socks.port();
    if !listener_ready(socks_port, opts.startup_timeout).await {
        engine.shutdown().await;
        return Err(RankError::EngineLaunch(format!(
            "socks listener on 127.0.0.1:{socks_port} not accepting within {:?}",
            opts.startup_timeout
        )));
    }

    let result = canary_request(socks_port, opts).await;
    engine.shutdown().await;
    result
}

/// Poll-connect until the local listener accepts, bounded by `window`.
/// Replaces a fixed warm-up sleep: slow engine starts are tolerated up to
/// the bound and fast ones are not penalized.
async fn listener_ready(port: u16, window: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < window {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

/// One GET through the local socks listener, timed from send to body
/// completion. 2xx is reachable; everything else is a typed failure.
async fn canary_request(socks_port: u16, opts: &ProbeOptions) -> Result<Duration> {
    let proxy = reqwest::Proxy::all(format!("socks5://127.0.0.1:{socks_port}"))
        .map_err(|e| RankError::ProbeNetwork(e.to_string()))?;
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .connect_timeout(opts.connect_timeout)
        .timeout(opts.request_timeout)
        .build()
        .map_err(|e| RankError::ProbeNetwork(e.to_string()))?;

    let start = Instant::now();
    let resp = client
        .get(&opts.canary_url)
        .send()
        .await
        .map_err(|e| classify_canary_error(e, opts.request_timeout))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(RankError::ProbeNetwork(format!("canary returned {status}")));
    }

    resp.bytes()
        .await
        .map_err(|e| classify_canary_error(e, opts.request_timeout))?;

    Ok(start.elapsed())
}

fn classify_canary_error(err: reqwest::Error, deadline: Duration) -> RankError {
    if err.is_timeout() {
        RankError::ProbeTimeout(deadline)
    } else {
        RankError::ProbeNetwork(err.to_string())
    }
}

/// Probe all candidates with at most `concurrency` in flight. Completion
/// order is unspecified; callers must not rely on it.
pub async fn probe_many(
    descriptors: Vec<EndpointDescriptor>,
    allocator: PortAllocator,
    opts: ProbeOptions,
    concurrency: usize,
) -> Vec<ProbeReport> {
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let opts = Arc::new(opts);
    let mut handles = Vec::new();
    for descriptor in descriptors {
        let permit = sem.clone().acquire_owned().await.unwrap();
        let allocator = allocator.clone();
        let opts = opts.clone();
        handles.push(tokio::spawn(async move {
            let report = probe_one(descriptor, &allocator, &opts).await;
            drop(permit);
            report
        }));
    }
    let mut reports = Vec::new();
    for h in handles {
        if let Ok(r) = h.await {
            reports.push(r);
        }
    }
    reports
}

/// Partition reports and sort the reachable ones ascending by latency.
/// The sort is stable, so equal latencies keep their collection order.
pub fn rank(reports: Vec<ProbeReport>) -> Ranking {
    let (mut reachable, failed): (Vec<_>, Vec<_>) =
        reports.into_iter().partition(ProbeReport::is_reachable);
    reachable.sort_by_key(|r| r.latency().unwrap_or(Duration::MAX));
    Ranking { reachable, failed }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelrank_core::{Security, Transport};

    fn descriptor(label: &str) -> EndpointDescriptor {
        EndpointDescriptor {
            user_id: "u".into(),
            host: "10.0.0.1".into(),
            port: 443,
            transport: Transport::Tcp,
            security: Security::None,
            flow: None,
            encryption: "none".into(),
            sni: None,
            alpn: None,
            host_header: None,
            path: None,
            label: label.into(),
        }
    }

    fn report(label: &str, outcome: ProbeOutcome) -> ProbeReport {
        ProbeReport {
            descriptor: descriptor(label),
            outcome,
            started_at: now_rfc3339(),
            ended_at: now_rfc3339(),
        }
    }

    fn reachable(label: &str, ms: u64) -> ProbeReport {
        report(
            label,
            ProbeOutcome::Reachable {
                latency: Duration::from_millis(ms),
            },
        )
    }

    fn failed(label: &str) -> ProbeReport {
        report(
            label,
            ProbeOutcome::Failed {
                error: RankError::ProbeNetwork("connection refused".into()),
            },
        )
    }

    #[test]
    fn rank_sorts_reachable_ascending_and_keeps_failures() {
        let ranking = rank(vec![
            reachable("slow", 900),
            failed("dead"),
            reachable("fast", 40),
            reachable("mid", 120),
            failed("dead2"),
        ]);
        let labels: Vec<_> = ranking
            .reachable
            .iter()
            .map(|r| r.descriptor.label.as_str())
            .collect();
        assert_eq!(labels, vec!["fast", "mid", "slow"]);
        assert_eq!(ranking.failed.len(), 2);

        let latencies: Vec<_> = ranking
            .reachable
            .iter()
            .map(|r| r.latency().unwrap())
            .collect();
        assert!(latencies.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn rank_is_stable_on_latency_ties() {
        let ranking = rank(vec![
            reachable("first", 50),
            reachable("second", 50),
            reachable("third", 50),
        ]);
        let labels: Vec<_> = ranking
            .reachable
            .iter()
            .map(|r| r.descriptor.label.as_str())
            .collect();
        assert_eq!(labels, vec!["first", "second", "third"]);
    }

    #[test]
    fn rank_length_bookkeeping_holds() {
        let reports = vec![reachable("a", 1), failed("b"), reachable("c", 2), failed("d")];
        let submitted = reports.len();
        let ranking = rank(reports);
        assert_eq!(ranking.reachable.len() + ranking.failed.len(), submitted);
    }

    #[tokio::test]
    async fn missing_engine_binary_is_a_launch_failure() {
        let opts = ProbeOptions {
            engine_bin: PathBuf::from("/nonexistent/engine-binary"),
            startup_timeout: Duration::from_millis(100),
            ..ProbeOptions::default()
        };
        let allocator = PortAllocator::new();
        let report = probe_one(descriptor("x"), &allocator, &opts).await;
        assert!(matches!(
            report.error(),
            Some(RankError::EngineLaunch(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn never_ready_engine_is_a_launch_failure() {
        // `sleep` accepts being spawned with our args but exits at once, so
        // the socks listener never comes up and the readiness window lapses.
        let opts = ProbeOptions {
            engine_bin: PathBuf::from("sleep"),
            startup_timeout: Duration::from_millis(250),
            ..ProbeOptions::default()
        };
        let allocator = PortAllocator::new();
        let report = probe_one(descriptor("x"), &allocator, &opts).await;
        match report.error() {
            Some(RankError::EngineLaunch(msg)) => {
                assert!(msg.contains("not accepting"), "unexpected message: {msg}");
            }
            other => panic!("expected launch failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn listener_ready_sees_a_bound_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(listener_ready(port, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn listener_ready_gives_up_on_a_dead_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!listener_ready(port, Duration::from_millis(200)).await);
    }
}
