use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeeper::auth::BoundedReplayTracker;
use gatekeeper::clock::{Clock, ManualClock};
use gatekeeper::config::GatekeeperConfig;
use gatekeeper::ratelimit::{RateLimitConfig, SlidingWindowRateLimiter};
use gatekeeper::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

#[derive(Parser)]
#[command(name = "gatekeeper", version, about = "Exercise Gatekeeper's request guards")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate a configuration file
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Drive a rate limiter from concurrent tasks
    Simulate {
        /// Limit in "<count>/<unit>" form
        #[arg(short, long, default_value = "10/second")]
        limit: RateLimitConfig,
        #[arg(short, long, default_value_t = 100)]
        requests: usize,
        #[arg(short = 'j', long, default_value_t = 4)]
        concurrency: usize,
        #[arg(short, long, default_value = "demo")]
        key: String,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Walk a circuit breaker through failures and recovery
    Breaker {
        #[arg(long, default_value_t = 5)]
        failures: u32,
        #[arg(long, default_value_t = 3)]
        failure_threshold: u32,
        #[arg(long, default_value_t = 2)]
        success_threshold: u32,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        #[arg(long, default_value_t = 2)]
        half_open_max_calls: u32,
    },
    /// Present freshly issued and replayed token identifiers to a tracker
    Replay {
        #[arg(long, default_value_t = 20)]
        tokens: usize,
        #[arg(long, default_value_t = 10)]
        max_tracked: usize,
    },
}

#[derive(Debug, Serialize)]
struct SimulationSummary {
    limit: String,
    key: String,
    requests: usize,
    allowed: usize,
    rejected: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .init();

    match Cli::parse().command {
        Command::Check { config } => check(config),
        Command::Simulate {
            limit,
            requests,
            concurrency,
            key,
            json,
        } => simulate(limit, requests, concurrency, key, json).await,
        Command::Breaker {
            failures,
            failure_threshold,
            success_threshold,
            timeout_secs,
            half_open_max_calls,
        } => breaker(
            failures,
            failure_threshold,
            success_threshold,
            timeout_secs,
            half_open_max_calls,
        ),
        Command::Replay {
            tokens,
            max_tracked,
        } => replay(tokens, max_tracked),
    }
}

fn check(path: PathBuf) -> anyhow::Result<()> {
    let config = GatekeeperConfig::from_file(&path)?;

    info!(default = %config.rate_limiting.default, "Default rate limit");
    let mut policies: Vec<_> = config.rate_limiting.policies.iter().collect();
    policies.sort_by(|a, b| a.0.cmp(b.0));
    for (name, limit) in policies {
        info!(policy = %name, limit = %limit, "Rate limit policy");
    }

    let breaker = config.circuit_breaker_config();
    info!(
        failure_threshold = breaker.failure_threshold,
        success_threshold = breaker.success_threshold,
        timeout_secs = breaker.timeout.as_secs(),
        half_open_max_calls = breaker.half_open_max_calls,
        "Circuit breaker"
    );
    info!(
        max_tracked = config.replay_protection.max_tracked,
        "Replay protection"
    );
    info!(path = %path.display(), "Configuration is valid");
    Ok(())
}

async fn simulate(
    limit: RateLimitConfig,
    requests: usize,
    concurrency: usize,
    key: String,
    json: bool,
) -> anyhow::Result<()> {
    let limiter = Arc::new(SlidingWindowRateLimiter::new(limit));
    let concurrency = concurrency.max(1);

    let tasks = (0..concurrency).map(|worker| {
        let limiter = limiter.clone();
        let key = key.clone();
        // Spread the requests as evenly as possible across workers.
        let share = requests / concurrency + usize::from(worker < requests % concurrency);
        tokio::spawn(async move {
            (0..share).filter(|_| limiter.is_allowed(&key).allowed).count()
        })
    });

    let mut allowed = 0;
    for result in futures::future::join_all(tasks).await {
        allowed += result?;
    }

    let summary = SimulationSummary {
        limit: limit.to_string(),
        key,
        requests,
        allowed,
        rejected: requests - allowed,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!(
            limit = %summary.limit,
            key = %summary.key,
            requests = summary.requests,
            allowed = summary.allowed,
            rejected = summary.rejected,
            "Simulation finished"
        );
    }
    Ok(())
}

fn breaker(
    failures: u32,
    failure_threshold: u32,
    success_threshold: u32,
    timeout_secs: u64,
    half_open_max_calls: u32,
) -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let config = CircuitBreakerConfig {
        failure_threshold,
        success_threshold,
        timeout: Duration::from_secs(timeout_secs),
        half_open_max_calls,
    };
    let breaker = CircuitBreaker::with_clock("simulated", config, clock.clone())?;

    for attempt in 1..=failures {
        if breaker.can_execute() {
            breaker.record_failure();
        }
        info!(attempt, state = %breaker.state(), "Recorded failure");
    }

    clock.advance(config.timeout);
    info!(state = %breaker.state(), "Timeout elapsed");

    let mut trial = 0;
    while breaker.state() == CircuitState::HalfOpen && breaker.can_execute() {
        trial += 1;
        breaker.record_success();
        info!(trial, state = %breaker.state(), "Trial call succeeded");
    }

    let snapshot = breaker.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn replay(tokens: usize, max_tracked: usize) -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let tracker = BoundedReplayTracker::with_clock(max_tracked, clock.clone())?;
    let expires_at = clock.now() + chrono::Duration::days(7);

    let issued: Vec<String> = (0..tokens).map(|_| uuid::Uuid::new_v4().to_string()).collect();

    let accepted = issued
        .iter()
        .filter(|token_id| tracker.check_and_mark_used(token_id, expires_at))
        .count();
    let replays_refused = issued
        .iter()
        .filter(|token_id| !tracker.check_and_mark_used(token_id, expires_at))
        .count();

    info!(
        issued = tokens,
        accepted,
        replays_refused,
        tracked = tracker.len(),
        max_tracked = tracker.max_tracked(),
        "Replay run finished"
    );
    Ok(())
}
