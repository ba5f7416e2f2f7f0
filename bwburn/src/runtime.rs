use core::{future, sync::atomic::AtomicBool, time::Duration};
use std::{error::Error, pin::pin, process, sync::Arc, thread};

use tokio::{
    signal::unix::{signal, SignalKind},
    time,
};

use crate::{
    cfg::Config,
    client::HttpClient,
    engine::Engine,
    stat::{ThroughputSampler, TrafficStat},
};

/// How often the periodic throughput report is emitted.
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Supervises a run: starts the engine, reports throughput periodically
/// and stops the process on a termination signal or when the configured
/// deadline elapses.
#[derive(Debug)]
pub struct Runtime {
    cfg: Arc<Config>,
    stat: Arc<TrafficStat>,
    is_running: Arc<AtomicBool>,
}

impl Runtime {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg: Arc::new(cfg),
            stat: Arc::new(TrafficStat::default()),
            is_running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Runs until interrupted.
    ///
    /// Termination is abrupt: in-flight requests are neither joined nor
    /// drained. A signal exits with code 1, an elapsed deadline with
    /// code 0.
    pub async fn run(self) -> Result<(), Box<dyn Error>> {
        let client = Arc::new(HttpClient::new(&self.cfg)?);
        let engine = Engine::new(
            self.cfg.clone(),
            client,
            self.stat.clone(),
            self.is_running.clone(),
        );

        thread::Builder::new().name("bwburn:engine".into()).spawn(move || {
            if let Err(err) = engine.run() {
                log::error!("engine terminated: {err}");
                process::exit(1);
            }
        })?;

        let mut sampler = ThroughputSampler::new(self.stat.clone());
        let mut ticker = time::interval(REPORT_INTERVAL);
        ticker.tick().await; // The first tick completes immediately.

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut deadline = pin!(deadline(self.cfg.timeout));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    log::info!("{}", sampler.sample());
                }
                _ = sigint.recv() => {
                    log::info!("received SIGINT, {}", sampler.sample());
                    process::exit(1);
                }
                _ = sigterm.recv() => {
                    log::info!("received SIGTERM, {}", sampler.sample());
                    process::exit(1);
                }
                _ = &mut deadline => {
                    log::info!("deadline reached, {}", sampler.sample());
                    process::exit(0);
                }
            }
        }
    }
}

/// Completes once the configured runtime elapses, or never for an
/// unbounded run.
async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => time::sleep(timeout).await,
        None => future::pending().await,
    }
}
