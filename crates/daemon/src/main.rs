use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use adc_daemon::load_config;
use adc_sched::AdcScheduler;
use adc_types::{LowSpeedResult, Sample};
use boards::sim_board;
use clap::Parser;
use flume::RecvTimeoutError;
use log::{debug, error, info, warn};
use timer_service::{Delay, TimerService};

/// Runs the ADC scheduler on the simulated board and logs what it produces.
#[derive(Parser, Debug)]
#[command(name = "adcd", version, about)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Stop after this many seconds, overriding `run_seconds` from the config
    #[arg(short, long)]
    seconds: Option<u64>,
}

#[derive(Debug, Default)]
struct StreamStats {
    events: u64,
    samples: u64,
    lost: u64,
    errors: u64,
    gaps: u64,
    last_sequence: u64,
}

fn mean(samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|&s| f64::from(s)).sum::<f64>() / samples.len() as f64
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    info!("ADC daemon starting...");

    let config = load_config(&args.config)?;
    debug!("Configuration: {:?}", config);

    // --- Wiring ---
    let timers = TimerService::with_config(&config.timer)?;
    let (driver, board) = sim_board(config.sim.clone());
    let scheduler = AdcScheduler::new(driver, &timers, &config.scheduler)?;
    let mut board = board.spawn(Arc::clone(&scheduler))?;

    scheduler.init_from_config(&config.high_speed)?;
    let events = scheduler.listen();
    scheduler.start()?;

    // --- Periodic low-speed readings ---
    let poller = timers.timer();
    if config.polling.poll_interval_ms > 0 {
        let weak = Arc::downgrade(&scheduler);
        let channels = config.polling.low_speed_channels;
        poller.start(
            move || {
                let Some(scheduler) = weak.upgrade() else { return };
                let logged = move |result: LowSpeedResult| {
                    info!(
                        "Low-speed {}: {:?}{}",
                        result.channels,
                        result.samples,
                        if result.errored { " (after errors)" } else { "" }
                    );
                };
                if let Err(e) = scheduler.request_async(channels, Vec::new(), logged) {
                    debug!("Low-speed poll skipped: {}", e);
                }
            },
            true,
            Delay::from_millis(config.polling.poll_interval_ms),
        );
    }

    // --- Main loop ---
    let run_for = args.seconds.unwrap_or(config.polling.run_seconds);
    let deadline = (run_for > 0).then(|| Instant::now() + Duration::from_secs(run_for));
    let mut stats = StreamStats::default();
    let report_every = u64::from(config.high_speed.frequency.max(1));

    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        match events.recv_timeout(Duration::from_secs(1)) {
            Ok(event) => {
                let result = event.result;
                if stats.last_sequence != 0 && result.sequence != stats.last_sequence + 1 {
                    stats.gaps += 1;
                }
                stats.last_sequence = result.sequence;
                stats.events += 1;
                stats.samples += result.count as u64;
                if result.flags.lost_event {
                    stats.lost += 1;
                }
                if result.flags.error {
                    stats.errors += 1;
                }
                if stats.samples / report_every != (stats.samples - result.count as u64) / report_every {
                    info!(
                        "High-speed #{}: {} samples at {}, mean {:.1} ({} events, {} lost, {} errors)",
                        result.sequence,
                        result.count,
                        result.offset,
                        mean(&event.samples),
                        stats.events,
                        stats.lost,
                        stats.errors
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => warn!("No high-speed event in the last second"),
            Err(RecvTimeoutError::Disconnected) => {
                error!("High-speed listener disconnected. Stopping.");
                break;
            }
        }
    }

    // --- Shutdown ---
    poller.stop();
    scheduler.stop();
    board.shutdown();
    timers.shutdown();
    info!(
        "ADC daemon stopped: {} events, {} samples, {} lost, {} errors, {} skipped by listener",
        stats.events, stats.samples, stats.lost, stats.errors, stats.gaps
    );
    Ok(())
}
