//! Peer prober.
//!
//! Probes every configured peer once per tick and keeps a fixed-size
//! ring of results per peer. What leaves this module are smoothed
//! values — the arithmetic mean over the window — so a single timeout
//! or latency spike cannot flip routing decisions on its own.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use trellis_common::telemetry::MetricSample;

use crate::ping::Pinger;

/// One probe result.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// `None` means the probe timed out or errored.
    pub rtt_ms: Option<f64>,
    pub loss_rate: f64,
    pub captured_at: DateTime<Utc>,
}

// ── Sample ring ─────────────────────────────────────────────────────

/// Fixed-capacity ring of measurements; insertion overwrites the oldest.
#[derive(Debug)]
pub struct SampleRing {
    buf: VecDeque<Measurement>,
    capacity: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, m: Measurement) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(m);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Mean RTT over entries that got a reply; `None` if none did.
    pub fn smoothed_rtt(&self) -> Option<f64> {
        let mut sum = 0.0;
        let mut n = 0usize;
        for m in &self.buf {
            if let Some(rtt) = m.rtt_ms {
                sum += rtt;
                n += 1;
            }
        }
        if n == 0 {
            None
        } else {
            Some(sum / n as f64)
        }
    }

    /// Mean loss over all entries; 0.0 when empty.
    pub fn smoothed_loss(&self) -> f64 {
        if self.buf.is_empty() {
            return 0.0;
        }
        self.buf.iter().map(|m| m.loss_rate).sum::<f64>() / self.buf.len() as f64
    }
}

// ── Prober ──────────────────────────────────────────────────────────

struct ProbeStats {
    rings: Vec<SampleRing>,
    last_probe: Option<DateTime<Utc>>,
    probes_sent: u64,
    probes_ok: u64,
}

pub struct Prober<P: Pinger> {
    pinger: Arc<P>,
    peers: Arc<Vec<Ipv4Addr>>,
    interval: Duration,
    probe_timeout: Duration,
    stats: Arc<Mutex<ProbeStats>>,
    running: AtomicBool,
    task: tokio::sync::Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl<P: Pinger> Prober<P> {
    pub fn new(
        pinger: P,
        peers: Vec<Ipv4Addr>,
        interval: Duration,
        probe_timeout: Duration,
        window_size: usize,
    ) -> Self {
        let rings = peers.iter().map(|_| SampleRing::new(window_size)).collect();
        Self {
            pinger: Arc::new(pinger),
            peers: Arc::new(peers),
            interval,
            probe_timeout,
            stats: Arc::new(Mutex::new(ProbeStats {
                rings,
                last_probe: None,
                probes_sent: 0,
                probes_ok: 0,
            })),
            running: AtomicBool::new(false),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Begin the probe loop; the first tick runs immediately. Idempotent.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            self.pinger.clone(),
            self.peers.clone(),
            self.stats.clone(),
            self.interval,
            self.probe_timeout,
            stop_rx,
        ));
        *task = Some((stop_tx, handle));
        self.running.store(true, Ordering::Release);
        tracing::info!(
            peers = self.peers.len(),
            interval_s = self.interval.as_secs_f64(),
            "prober started"
        );
    }

    /// End the probe loop and wait for it. Idempotent, safe when never
    /// started.
    pub async fn stop(&self) {
        let taken = self.task.lock().await.take();
        if let Some((stop_tx, handle)) = taken {
            let _ = stop_tx.send(true);
            let _ = handle.await;
            self.running.store(false, Ordering::Release);
            tracing::info!("prober stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// One sample per peer, in configured peer order, from the current
    /// ring contents.
    pub fn smoothed_metrics(&self) -> Vec<MetricSample> {
        let stats = self.stats.lock().unwrap();
        self.peers
            .iter()
            .zip(&stats.rings)
            .map(|(peer, ring)| MetricSample {
                target_ip: peer.to_string(),
                rtt_ms: ring.smoothed_rtt(),
                loss_rate: ring.smoothed_loss(),
            })
            .collect()
    }

    pub fn last_probe_time(&self) -> Option<DateTime<Utc>> {
        self.stats.lock().unwrap().last_probe
    }

    /// Fraction of probes answered since start; `None` before the first
    /// probe completes.
    pub fn success_rate(&self) -> Option<f64> {
        let stats = self.stats.lock().unwrap();
        if stats.probes_sent == 0 {
            None
        } else {
            Some(stats.probes_ok as f64 / stats.probes_sent as f64)
        }
    }
}

async fn run_loop<P: Pinger>(
    pinger: Arc<P>,
    peers: Arc<Vec<Ipv4Addr>>,
    stats: Arc<Mutex<ProbeStats>>,
    interval: Duration,
    probe_timeout: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // Edge-triggered: a probe round outlasting the period must not queue
    // extra rounds behind it.
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                probe_round(pinger.as_ref(), &peers, &stats, probe_timeout).await;
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
            }
        }
    }
}

/// Probe every peer sequentially, in stable order.
async fn probe_round<P: Pinger>(
    pinger: &P,
    peers: &[Ipv4Addr],
    stats: &Mutex<ProbeStats>,
    probe_timeout: Duration,
) {
    for (i, peer) in peers.iter().enumerate() {
        let rtt = pinger.ping(*peer, probe_timeout).await;
        let measurement = Measurement {
            rtt_ms: rtt,
            loss_rate: if rtt.is_some() { 0.0 } else { 1.0 },
            captured_at: Utc::now(),
        };
        tracing::trace!(peer = %peer, rtt_ms = ?rtt, "probe");

        let mut stats = stats.lock().unwrap();
        stats.rings[i].push(measurement);
        stats.probes_sent += 1;
        if rtt.is_some() {
            stats.probes_ok += 1;
        }
        stats.last_probe = Some(Utc::now());
    }
}
