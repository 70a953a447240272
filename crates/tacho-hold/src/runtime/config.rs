use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;
use tacho_core::{SessionConfig, SessionMode};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{flag} expects a value")]
    MissingValue { flag: String },

    #[error("Invalid value {value:?} for {flag}: {reason}")]
    InvalidValue {
        flag: String,
        value: String,
        reason: String,
    },

    #[error("Unknown argument {0:?}")]
    UnknownArgument(String),
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub mode: SessionMode,
    pub target_hz: f32,
    pub hold_seconds: u64,
    pub slots: NonZeroU32,
    pub carrier_hz: u32,
    pub run_seconds: Option<u64>,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub journal_path: Option<PathBuf>,
    pub sim_max_hz: f32,
    /// Contact bounce every N edges on the simulated encoder; 0 disables.
    pub sim_noise: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            show_help: false,
            mode: SessionMode::Hold,
            target_hz: session.control.target_hz,
            hold_seconds: session.control.hold_duration.as_secs(),
            slots: session.slots_per_revolution,
            carrier_hz: session.control.pwm_carrier_hz,
            run_seconds: None,
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            journal_path: None,
            sim_max_hz: 80.0,
            sim_noise: 0,
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, ConfigError> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingValue {
            flag: flag.to_string(),
        })
}

fn parse<T>(raw: &str, flag: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
        flag: flag.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn positive(hz: f32, flag: &str) -> Result<f32, ConfigError> {
    if hz.is_finite() && hz > 0.0 {
        Ok(hz)
    } else {
        Err(ConfigError::InvalidValue {
            flag: flag.to_string(),
            value: hz.to_string(),
            reason: "must be a positive number".to_string(),
        })
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--mode" => {
                    cfg.mode = parse(value(args, i, flag)?, flag)?;
                    i += 1;
                }
                "--target-hz" => {
                    cfg.target_hz = positive(parse(value(args, i, flag)?, flag)?, flag)?;
                    i += 1;
                }
                "--hold-seconds" => {
                    cfg.hold_seconds = parse(value(args, i, flag)?, flag)?;
                    i += 1;
                }
                "--slots" => {
                    cfg.slots = parse(value(args, i, flag)?, flag)?;
                    i += 1;
                }
                "--carrier-hz" => {
                    cfg.carrier_hz = parse(value(args, i, flag)?, flag)?;
                    i += 1;
                }
                "--run-seconds" => {
                    cfg.run_seconds = Some(parse(value(args, i, flag)?, flag)?);
                    i += 1;
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-dir" => {
                    cfg.log_dir = Some(PathBuf::from(value(args, i, flag)?));
                    i += 1;
                }
                "--metrics-addr" => {
                    cfg.metrics_addr = Some(value(args, i, flag)?.to_string());
                    i += 1;
                }
                "--journal" => {
                    cfg.journal_path = Some(PathBuf::from(value(args, i, flag)?));
                    i += 1;
                }
                "--sim-max-hz" => {
                    cfg.sim_max_hz = positive(parse(value(args, i, flag)?, flag)?, flag)?;
                    i += 1;
                }
                "--sim-noise" => {
                    cfg.sim_noise = parse(value(args, i, flag)?, flag)?;
                    i += 1;
                }
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                other => return Err(ConfigError::UnknownArgument(other.to_string())),
            }
            i += 1;
        }
        Ok(cfg)
    }

    /// Library tunables with the command-line overrides applied.
    pub fn session_config(&self) -> SessionConfig {
        let mut session = SessionConfig {
            slots_per_revolution: self.slots,
            ..SessionConfig::default()
        };
        session.control.target_hz = self.target_hz;
        session.control.hold_duration = Duration::from_secs(self.hold_seconds);
        session.control.pwm_carrier_hz = self.carrier_hz;
        session
    }

    pub fn print_help() {
        println!(
            r#"tacho-hold - Closed-loop motor speed hold with tachometer feedback

USAGE:
    tacho-hold [OPTIONS]

OPTIONS:
    --mode <MODE>           hold (calibrate, seek, hold, ramp down) or sweep [default: hold]
    --target-hz <HZ>        Shaft frequency to hold [default: 50]
    --hold-seconds <SECS>   Duration of the hold phase [default: 60]
    --slots <N>             Encoder slots per revolution [default: 5]
    --carrier-hz <HZ>       PWM carrier frequency [default: 60]
    --run-seconds <SECS>    Cancel the session after a fixed duration
    --json-logs             Output logs in JSON format (for log aggregation)
    --log-dir <DIR>         Also write JSON logs to a daily-rotated file in DIR
    --metrics-addr <ADDR>   Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --journal <PATH>        Append session events to the specified JSONL file
    --sim-max-hz <HZ>       Top speed of the simulated motor [default: 80]
    --sim-noise <N>         Inject a contact-bounce edge every N encoder edges [default: 0]
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log filter (e.g., RUST_LOG=debug,tacho_core=trace)

EXAMPLES:
    # Hold 30Hz for two minutes with metrics
    tacho-hold --target-hz 30 --hold-seconds 120 --metrics-addr 0.0.0.0:9090

    # Characterize the rig
    tacho-hold --mode sweep --journal ./sweep.jsonl

    # Short cancelled run
    tacho-hold --run-seconds 5
"#
        );
    }
}
