use crate::infra::journal::{JournalEventType, SessionJournal};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry::{self, Metrics};
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tacho_core::hal_sim::{RecordingDisplay, SimulatedEncoder, SimulatedMotor, SimulatedPwm};
use tacho_core::{
    ControlPhase, Orchestrator, SessionOutcome, SnapshotExchange, StopSignal, TimeBase,
};
use tracing::{error, info, warn};

const PHASE_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn run_from_args() -> ExitCode {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tacho-hold: {e}");
            eprintln!("Run with --help for usage.");
            return ExitCode::from(2);
        }
    };
    if config.show_help {
        RuntimeConfig::print_help();
        return ExitCode::SUCCESS;
    }
    run(config)
}

pub fn run(config: RuntimeConfig) -> ExitCode {
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    let journal = match init_journal(config.journal_path.as_deref()) {
        Ok(journal) => journal,
        Err(e) => {
            error!(error = %e, "Journal requested but failed to open");
            return ExitCode::FAILURE;
        }
    };

    let metrics = match config.metrics_addr.as_ref().map(|_| Metrics::new()).transpose() {
        Ok(metrics) => metrics,
        Err(e) => {
            error!(error = %e, "Failed to register metrics");
            return ExitCode::FAILURE;
        }
    };
    if let (Some(metrics), Some(addr)) = (&metrics, &config.metrics_addr) {
        info!(addr = %addr, "Starting metrics server");
        let _metrics_server = telemetry::serve_metrics(metrics.clone(), addr.clone());
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    let timebase = TimeBase::new();
    let session_config = config.session_config();
    let exchange = Arc::new(SnapshotExchange::new());

    let motor = SimulatedMotor::new(config.sim_max_hz).shared();
    let pwm = SimulatedPwm::new(Arc::clone(&motor));
    let encoder = SimulatedEncoder::new(motor, session_config.slots_per_revolution)
        .with_bounce(config.sim_noise);
    let display = RecordingDisplay::new(4);

    let orchestrator = Orchestrator::new(pwm, encoder, display, session_config)
        .with_mode(config.mode)
        .with_exchange(Arc::clone(&exchange));
    let stop = orchestrator.stop_signal();

    let metrics_stop = Arc::new(AtomicBool::new(false));
    let updater = metrics.map(|metrics| {
        telemetry::start_metrics_updater(
            metrics,
            Arc::clone(&exchange),
            orchestrator.frequency(),
            Arc::clone(&metrics_stop),
        )
    });

    info!(
        mode = ?config.mode,
        target_hz = config.target_hz,
        hold_seconds = config.hold_seconds,
        sim_max_hz = config.sim_max_hz,
        "Starting speed hold session"
    );
    record(
        journal.as_deref(),
        timebase,
        JournalEventType::SessionStart,
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "mode": config.mode,
            "target_hz": config.target_hz,
            "hold_seconds": config.hold_seconds,
            "slots": config.slots.get(),
            "carrier_hz": config.carrier_hz,
            "run_seconds": config.run_seconds,
            "sim_max_hz": config.sim_max_hz,
            "sim_noise": config.sim_noise,
        }),
    );

    let result = runtime.block_on(async {
        tokio::spawn(stop_on_ctrl_c(stop.clone()));
        if let Some(seconds) = config.run_seconds {
            info!(seconds, "Running for limited duration");
            tokio::spawn(stop_after(Duration::from_secs(seconds), stop.clone()));
        }

        let watcher_done = StopSignal::new();
        let watcher = journal.clone().map(|journal| {
            tokio::spawn(journal_phases(
                journal,
                Arc::clone(&exchange),
                timebase,
                watcher_done.clone(),
            ))
        });

        let result = orchestrator.run().await;

        watcher_done.set();
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }
        result
    });

    metrics_stop.store(true, Ordering::Relaxed);
    if let Some(updater) = updater {
        let _ = updater.join();
    }

    match result {
        Ok(report) => {
            let event = match report.outcome {
                SessionOutcome::Completed => JournalEventType::SessionCompleted,
                SessionOutcome::Cancelled => JournalEventType::SessionCancelled,
            };
            if let Some(hold) = &report.session.hold {
                info!(
                    mean_hz = hold.mean_hz,
                    min_hz = hold.min_hz,
                    max_hz = hold.max_hz,
                    within_tolerance_pct = hold.within_tolerance * 100.0,
                    "Hold summary"
                );
            }
            info!(outcome = ?report.outcome, "Run complete");
            record(journal.as_deref(), timebase, event, to_details(&report));
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, phase = %e.phase, "Run failed");
            record(
                journal.as_deref(),
                timebase,
                JournalEventType::SessionFailed,
                serde_json::json!({
                    "error": e.to_string(),
                    "phase": e.phase,
                    "session": to_details(&e.session),
                }),
            );
            ExitCode::FAILURE
        }
    }
}

fn init_journal(path: Option<&Path>) -> std::io::Result<Option<Arc<SessionJournal>>> {
    path.map(|path| {
        let journal = SessionJournal::new(path)?;
        info!(path = %path.display(), "Session journal enabled");
        Ok(Arc::new(journal))
    })
    .transpose()
}

fn record(
    journal: Option<&SessionJournal>,
    timebase: TimeBase,
    event_type: JournalEventType,
    details: serde_json::Value,
) {
    let Some(journal) = journal else {
        return;
    };
    if let Err(e) = journal.log_event(timebase.now_us(), timebase.unix_us(), event_type, details) {
        warn!(error = %e, "Failed to write journal entry");
    }
}

fn to_details<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to serialize journal details");
        serde_json::Value::Null
    })
}

async fn stop_on_ctrl_c(stop: StopSignal) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Ctrl-C received, stopping");
            stop.set();
        }
        Err(e) => warn!(error = %e, "Ctrl-C handler unavailable"),
    }
}

async fn stop_after(limit: Duration, stop: StopSignal) {
    tokio::time::sleep(limit).await;
    info!(seconds = limit.as_secs(), "Run limit reached, stopping");
    stop.set();
}

/// Journal every phase change visible in the published snapshots.
async fn journal_phases(
    journal: Arc<SessionJournal>,
    exchange: Arc<SnapshotExchange>,
    timebase: TimeBase,
    done: StopSignal,
) {
    let mut last = ControlPhase::Idle;
    while !done.is_set() {
        let snapshot = exchange.latest();
        if snapshot.phase != last {
            record(
                Some(&*journal),
                timebase,
                JournalEventType::PhaseTransition,
                serde_json::json!({
                    "from": last,
                    "to": snapshot.phase,
                    "duty_pct": snapshot.duty_pct,
                    "measured_hz": snapshot.measured_hz,
                }),
            );
            last = snapshot.phase;
        }
        tokio::select! {
            () = tokio::time::sleep(PHASE_POLL_INTERVAL) => {}
            () = done.wait() => break,
        }
    }
}
