//! Availability prober for the bridge.
//!
//! Mirrors the script on the lab page: probe on a fixed interval from start,
//! give up after a bounded window, and let the user trigger a single fresh
//! probe by hand afterwards.

pub mod http;
pub mod status;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

use crate::config::ProbeConfig;
use crate::error::ProbeFailure;
pub use http::HttpProbe;
pub use status::{ConnectionStatus, Indicator, Panel, StatusBoard, SETUP_INSTRUCTIONS};

#[async_trait]
pub trait Probe: Send + Sync {
    /// One reachability attempt. No retries.
    async fn probe(&self) -> Result<(), ProbeFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Automatic probing stops once this much time has passed since start.
    pub window: Duration,
    /// Stop at the first successful probe instead of polling for the whole window.
    pub stop_when_connected: bool,
}

impl PollPolicy {
    /// Probes that fit in the window, counting the immediate one at start.
    pub fn max_checks(&self) -> u32 {
        let interval = self.interval.as_millis().max(1);
        let fits = self.window.as_millis() / interval;
        u32::try_from(fits).unwrap_or(u32::MAX).max(1)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            window: Duration::from_secs(60),
            stop_when_connected: false,
        }
    }
}

pub struct Prober<P> {
    probe: P,
    policy: PollPolicy,
    board: StatusBoard,
    probes_sent: u32,
}

impl<P: Probe> Prober<P> {
    pub fn new(probe: P, policy: PollPolicy) -> Self {
        Self {
            probe,
            policy,
            board: StatusBoard::new(),
            probes_sent: 0,
        }
    }

    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Total probes issued so far, automatic and manual.
    pub fn probes_sent(&self) -> u32 {
        self.probes_sent
    }

    /// Runs the automatic polling loop to completion. `on_update` sees the
    /// board after every completed probe.
    pub async fn poll<F>(&mut self, mut on_update: F) -> ConnectionStatus
    where
        F: FnMut(&StatusBoard),
    {
        let started = Instant::now();
        let mut ticker = interval(self.policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for _ in 0..self.policy.max_checks() {
            ticker.tick().await;
            if started.elapsed() >= self.policy.window {
                break;
            }
            let status = self.check().await;
            on_update(&self.board);
            if status == ConnectionStatus::Connected && self.policy.stop_when_connected {
                return status;
            }
        }
        debug!(
            probes = self.probes_sent,
            status = ?self.board.status(),
            "automatic probing window closed"
        );
        self.board.status()
    }

    /// Manual reconnect: one fresh probe behind a `connecting` state. Does not
    /// restart automatic polling.
    pub async fn reconnect<F>(&mut self, mut on_update: F) -> ConnectionStatus
    where
        F: FnMut(&StatusBoard),
    {
        self.board.begin_reconnect();
        on_update(&self.board);
        let status = self.check().await;
        on_update(&self.board);
        status
    }

    async fn check(&mut self) -> ConnectionStatus {
        self.probes_sent += 1;
        let outcome = self.probe.probe().await;
        if let Err(failure) = &outcome {
            debug!(error = %failure, "probe failed");
        }
        self.board.record(&outcome, OffsetDateTime::now_utc());
        self.board.status()
    }
}

/// `beach-pier probe`: prints every transition, returns the process exit code.
pub async fn run_cli(config: ProbeConfig) -> Result<i32> {
    let probe = HttpProbe::new(config.url.clone(), config.timeout)?;
    let mut prober = Prober::new(probe, config.policy);
    println!("Probing {} every {:?}", config.url, config.policy.interval);

    let mut last_status = None;
    let status = prober
        .poll(|board| {
            if last_status != Some(board.status()) {
                last_status = Some(board.status());
                print_board(board);
            }
        })
        .await;

    if status == ConnectionStatus::Connected {
        return Ok(0);
    }
    println!(
        "Gave up after {} probes. Start the bridge with:",
        prober.probes_sent()
    );
    for command in SETUP_INSTRUCTIONS {
        println!("    {command}");
    }
    Ok(1)
}

fn print_board(board: &StatusBoard) {
    let indicator = board.indicator();
    let at = board
        .last_checked()
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_default();
    match board.last_failure() {
        Some(reason) => println!("{at} [{}] {} ({reason})", indicator.color, indicator.label),
        None => println!("{at} [{}] {}", indicator.color, indicator.label),
    }
}
