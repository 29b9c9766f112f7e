use clap::{Args, Parser, Subcommand};
use itertools::Itertools;
use ppgquest::{
    challenge::{ChallengeStateMachine, Phase},
    config::{Config, ConfigStore, FileConfigStore, LinkConfig},
    device::PpgDevice,
    history::HistoryDb,
    link,
    runtime::{ChallengeEvent, FixedTicker, Runner},
};
use std::{
    error::Error,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

const TICK_RATE_MS: u64 = 100;

/// pulse-sensor biofeedback challenge
#[derive(Parser, Debug, Clone)]
#[clap(
    version,
    about,
    long_about = "Reads a pulse sensor over a serial port, calibrates a baseline, then challenges you to keep the signal above a slowly rising target."
)]
pub struct Cli {
    /// path to the config file (defaults to the platform config dir)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// path to the history database
    #[clap(long, global = true)]
    db: Option<PathBuf>,

    /// enable debug logging
    #[clap(long, global = true)]
    debug: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// run one challenge and print the results
    Run(RunArgs),
    /// print samples as they arrive
    Monitor(MonitorArgs),
    /// list available serial ports
    Ports,
    /// show, export or clear past results
    History(HistoryArgs),
    /// print the effective configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct LinkArgs {
    /// serial device, e.g. /dev/ttyACM0 or COM3
    #[clap(short = 'p', long)]
    port: Option<String>,

    /// baud rate
    #[clap(short = 'b', long)]
    baud: Option<u32>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    #[clap(flatten)]
    link: LinkArgs,

    /// seconds discarded at the start of calibration
    #[clap(long)]
    ignore_window: Option<f64>,

    /// seconds of calibration before the challenge starts
    #[clap(long)]
    calibration: Option<f64>,

    /// how far above the baseline the target climbs
    #[clap(long)]
    ramp_delta: Option<f64>,

    /// total run length in seconds
    #[clap(long)]
    max_duration: Option<f64>,

    /// seconds credited per scored sample (the sensor's sampling interval)
    #[clap(long)]
    sample_dt: Option<f64>,

    /// baseline used when calibration collected no values
    #[clap(long)]
    fallback_baseline: Option<f64>,

    /// do not record the result in the history database
    #[clap(long)]
    no_history: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct MonitorArgs {
    #[clap(flatten)]
    link: LinkArgs,

    /// stop after this many seconds
    #[clap(short = 's', long)]
    seconds: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct HistoryArgs {
    /// number of entries to show
    #[clap(short = 'n', long, default_value_t = 10)]
    limit: usize,

    /// write every entry to a CSV file
    #[clap(long)]
    export: Option<PathBuf>,

    /// delete all entries
    #[clap(long)]
    clear: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// write the effective configuration back to the config file
    #[clap(long)]
    save: bool,
}

impl LinkArgs {
    fn apply(&self, link: &mut LinkConfig) {
        if let Some(port) = &self.port {
            link.device = port.clone();
        }
        if let Some(baud) = self.baud {
            link.baud_rate = baud;
        }
    }
}

impl RunArgs {
    fn apply(&self, cfg: &mut Config) {
        self.link.apply(&mut cfg.link);
        let c = &mut cfg.challenge;
        if let Some(v) = self.ignore_window {
            c.ignore_window = v;
        }
        if let Some(v) = self.calibration {
            c.calibration_duration = v;
        }
        if let Some(v) = self.ramp_delta {
            c.ramp_delta = v;
        }
        if let Some(v) = self.max_duration {
            c.max_duration = v;
        }
        if let Some(v) = self.sample_dt {
            c.sample_dt = v;
        }
        if let Some(v) = self.fallback_baseline {
            c.fallback_baseline = v;
        }
    }
}

impl Cli {
    fn config_store(&self) -> FileConfigStore {
        match &self.config {
            Some(path) => FileConfigStore::with_path(path),
            None => FileConfigStore::new(),
        }
    }

    fn open_history(&self) -> Result<HistoryDb, ppgquest::error::HistoryError> {
        match &self.db {
            Some(path) => HistoryDb::open(path),
            None => HistoryDb::open_default(),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let store = cli.config_store();
    let mut cfg = store.load();

    match &cli.command {
        Command::Run(args) => {
            args.apply(&mut cfg);
            run_challenge(&cli, &cfg, args.no_history)
        }
        Command::Monitor(args) => {
            args.link.apply(&mut cfg.link);
            run_monitor(&cfg.link, args.seconds.map(Duration::from_secs))
        }
        Command::Ports => list_ports(),
        Command::History(args) => show_history(&cli, args),
        Command::Config(args) => {
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            if args.save {
                store.save(&cfg)?;
                eprintln!("Saved to {}", store.path().display());
            }
            Ok(())
        }
    }
}

/// Flag flipped by Ctrl-C so the loops can leave through normal cleanup.
fn interrupt_flag() -> Result<Arc<AtomicBool>, Box<dyn Error>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;
    Ok(stop)
}

fn connect(link: &LinkConfig) -> Result<PpgDevice, Box<dyn Error>> {
    let mut device = PpgDevice::new(link.clone());
    device.subscribe_connection(|event| {
        if event.connected {
            log::info!("{}", event.message);
        } else {
            log::warn!("{}", event.message);
        }
    });
    device.connect(true)?;
    Ok(device)
}

fn run_challenge(cli: &Cli, cfg: &Config, no_history: bool) -> Result<(), Box<dyn Error>> {
    let stop = interrupt_flag()?;
    let mut device = connect(&cfg.link)?;

    let runner = Runner::new(
        device.sample_stream(),
        FixedTicker::new(Duration::from_millis(TICK_RATE_MS)),
    );

    let mut machine = ChallengeStateMachine::new(cfg.challenge);
    machine.subscribe(|change| {
        let s = &change.snapshot;
        match change.phase {
            Phase::Calibrating => eprintln!("Calibrating... relax and keep still"),
            Phase::Challenge => eprintln!(
                "Baseline {:.1}. Keep the signal above the target!",
                s.baseline.unwrap_or_default()
            ),
            Phase::Complete => eprintln!("Done."),
            Phase::Idle => {}
        }
    });
    device.clear_data();
    machine.start_game();

    let mut last_report = None;
    loop {
        if stop.load(Ordering::SeqCst) {
            log::info!("Interrupted");
            break;
        }
        match runner.step() {
            ChallengeEvent::Sample(sample) => {
                let Some(snap) = machine.process_data_point(sample.timestamp, sample.value as f64)
                else {
                    continue;
                };
                let second = snap.elapsed.floor() as u64;
                if snap.phase == Phase::Challenge && last_report != Some(second) {
                    last_report = Some(second);
                    eprintln!(
                        "{:>5.1}s  value {:>6.1}  target {:>6.1}  in target {:>5.1}s",
                        snap.elapsed,
                        snap.current_value.unwrap_or_default(),
                        snap.target.unwrap_or_default(),
                        snap.time_in_target
                    );
                }
                if snap.phase == Phase::Complete {
                    break;
                }
            }
            ChallengeEvent::Tick => {
                if !device.is_reading() {
                    log::error!("Sensor stopped delivering data");
                    break;
                }
            }
        }
    }

    drop(runner);
    device.cleanup();

    let Some(results) = machine.get_final_results() else {
        eprintln!("Challenge did not complete ({})", machine.phase());
        return Ok(());
    };

    println!("{}", serde_json::to_string_pretty(&results)?);

    if !no_history {
        // A failed write must not lose the printed result.
        match cli.open_history() {
            Ok(db) => {
                if let Err(e) = db.record(&results, &cfg.challenge) {
                    log::warn!("Failed to record result: {}", e);
                }
            }
            Err(e) => log::warn!("Failed to open history: {}", e),
        }
    }
    Ok(())
}

fn run_monitor(link: &LinkConfig, limit: Option<Duration>) -> Result<(), Box<dyn Error>> {
    let stop = interrupt_flag()?;
    let mut device = connect(link)?;
    let runner = Runner::new(
        device.sample_stream(),
        FixedTicker::new(Duration::from_millis(TICK_RATE_MS)),
    );

    let started = Instant::now();
    while !stop.load(Ordering::SeqCst) && limit.map_or(true, |l| started.elapsed() < l) {
        match runner.step() {
            ChallengeEvent::Sample(sample) => println!(
                "{} - PPG value: {}",
                chrono::Local::now().format("%H:%M:%S"),
                sample.value
            ),
            ChallengeEvent::Tick => {
                if !device.is_reading() {
                    break;
                }
            }
        }
    }

    drop(runner);
    device.cleanup();
    Ok(())
}

fn list_ports() -> Result<(), Box<dyn Error>> {
    let ports = link::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    } else {
        println!("{}", ports.iter().join("\n"));
    }
    Ok(())
}

fn show_history(cli: &Cli, args: &HistoryArgs) -> Result<(), Box<dyn Error>> {
    let db = cli.open_history()?;

    if args.clear {
        db.clear()?;
        println!("History cleared");
        return Ok(());
    }

    if let Some(path) = &args.export {
        let n = db.export_csv(path)?;
        println!("Exported {} entries to {}", n, path.display());
        return Ok(());
    }

    let entries = db.recent(args.limit)?;
    if entries.is_empty() {
        println!("No challenges recorded yet");
        return Ok(());
    }

    println!(
        "{:<26} {:>6} {:>8} {:>9} {:>9}",
        "finished", "score", "in %", "streak s", "baseline"
    );
    for e in &entries {
        println!(
            "{:<26} {:>6} {:>8.1} {:>9.1} {:>9.1}",
            e.finished_at, e.score, e.percent_in_target, e.max_consecutive_target, e.baseline
        );
    }
    if let Some(best) = db.best()? {
        println!(
            "\nBest: {:.1}% in target on {}",
            best.percent_in_target, best.finished_at
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_overrides() {
        let cli = Cli::parse_from([
            "ppgquest",
            "run",
            "--port",
            "COM3",
            "--baud",
            "115200",
            "--max-duration",
            "60",
            "--ramp-delta",
            "25",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let mut cfg = Config::default();
        args.apply(&mut cfg);

        assert_eq!(cfg.link.device, "COM3");
        assert_eq!(cfg.link.baud_rate, 115200);
        assert_eq!(cfg.challenge.max_duration, 60.0);
        assert_eq!(cfg.challenge.ramp_delta, 25.0);
        assert_eq!(cfg.challenge.calibration_duration, 10.0);
        assert!(!args.no_history);
    }

    #[test]
    fn test_run_overrides_sampling_constants() {
        let cli = Cli::parse_from([
            "ppgquest",
            "run",
            "--ignore-window",
            "2",
            "--calibration",
            "8",
            "--sample-dt",
            "0.02",
            "--fallback-baseline",
            "300",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let mut cfg = Config::default();
        args.apply(&mut cfg);

        assert_eq!(cfg.challenge.ignore_window, 2.0);
        assert_eq!(cfg.challenge.calibration_duration, 8.0);
        assert_eq!(cfg.challenge.sample_dt, 0.02);
        assert_eq!(cfg.challenge.fallback_baseline, 300.0);
        assert_eq!(cfg.challenge.max_duration, 40.0);
    }

    #[test]
    fn test_run_without_overrides_keeps_config() {
        let mut cfg = Config::default();
        cfg.link.device = "/dev/ttyUSB1".into();
        RunArgs::default().apply(&mut cfg);
        assert_eq!(cfg.link.device, "/dev/ttyUSB1");
        assert_eq!(cfg.challenge, ppgquest::ChallengeConfig::default());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["ppgquest", "history", "--db", "/tmp/h.db", "--debug"]);
        assert!(cli.debug);
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/h.db")));
        let Command::History(args) = cli.command else {
            panic!("expected history");
        };
        assert_eq!(args.limit, 10);
        assert!(!args.clear);
    }
}
