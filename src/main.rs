//! `synwatchd`: loads configuration, initialises logging, resolves the
//! capture interface, loads the classifier artefact, and runs a
//! `DetectionCoordinator` session until interrupted.
//!
//! Grounded on the teacher's `main.rs`: `env_logger` initialisation, an
//! interactive interface prompt when none is configured, and a `ctrlc`
//! handler wired to a graceful shutdown, now driving a `DetectionCoordinator`
//! instead of the teacher's flat packet loop.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};

use synwatch::classifier::{ModelLoader, ThreatClassifier};
use synwatch::capture::PnetCaptureSource;
use synwatch::config::Config;
use synwatch::coordinator::DetectionCoordinator;
use synwatch::recovery::{RecoveryHooks, RecoveryPolicy};
use synwatch::sink::LoggingEventSink;
use synwatch::SynwatchError;

const EXIT_OK: u8 = 0;
const EXIT_CONFIGURATION: u8 = 2;
const EXIT_CAPTURE_UNAVAILABLE: u8 = 3;
const EXIT_MODEL_UNAVAILABLE: u8 = 4;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIGURATION);
        }
    };

    init_logging(&config.logging.log_level);

    info!("synwatchd starting");

    let classifier = Arc::new(load_classifier(&config));
    if !classifier.load_status().can_score() {
        error!("classifier unavailable: {:?}", classifier.load_status());
        return ExitCode::from(EXIT_MODEL_UNAVAILABLE);
    }

    let capture_source = Arc::new(PnetCaptureSource::new());
    let recovery = Arc::new(RecoveryPolicy::new(RecoveryHooks::default()));
    let coordinator = Arc::new(DetectionCoordinator::new(
        config.clone(),
        capture_source,
        classifier,
        recovery,
    ));
    coordinator.subscribe(Arc::new(LoggingEventSink));

    let interface_id = match resolve_interface(&config, &coordinator) {
        Ok(id) => id,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EXIT_CONFIGURATION);
        }
    };

    let shutdown_coordinator = coordinator.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("shutdown signal received");
        shutdown_coordinator.stop();
    }) {
        error!("failed to install signal handler: {}", e);
    }

    if let Err(e) = coordinator.start(&interface_id) {
        error!("failed to start detection session: {}", e);
        return ExitCode::from(EXIT_CAPTURE_UNAVAILABLE);
    }

    info!("monitoring interface {}", interface_id);
    while coordinator.state() != synwatch::sink::SessionState::Stopped {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    info!("synwatchd exiting");
    ExitCode::from(EXIT_OK)
}

fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| writeln!(buf, "[{}] {}: {}", record.level(), record.target(), record.args()))
        .init();
}

/// Loads the configured classifier/scaler pair. On failure, returns a
/// classifier in `LoadStatus::Failed` rather than panicking; the caller
/// decides the exit code.
fn load_classifier(config: &Config) -> ThreatClassifier {
    let arity = synwatch::features::FEATURE_COUNT;
    match ModelLoader::load(
        &config.detection.model_path,
        config.detection.scaler_path.as_deref(),
        arity,
    ) {
        Ok((backend, scaler)) => {
            ThreatClassifier::new(backend, scaler, config.detection.prob_threshold)
        }
        Err(e) => {
            error!("failed to load classifier artefact: {}", e);
            ThreatClassifier::failed(e.to_string())
        }
    }
}

/// Resolves the interface to monitor: the configured `interface`, or an
/// interactive prompt over the enumerated list when none is set (teacher's
/// `main.rs` prompt, generalised to the coordinator's `list_interfaces`).
fn resolve_interface(
    config: &Config,
    coordinator: &DetectionCoordinator,
) -> Result<String, SynwatchError> {
    if let Some(interface) = &config.network.interface {
        return Ok(interface.clone());
    }

    let interfaces = coordinator.list_interfaces();
    if interfaces.is_empty() {
        return Err(SynwatchError::NotReady {
            cause: "no capture interfaces available".to_string(),
        });
    }

    println!("Available interfaces:");
    for (i, iface) in interfaces.iter().enumerate() {
        println!("  {}: {}", i, iface.display_name);
    }
    print!("Select an interface by index: ");
    std::io::stdout().flush().ok();

    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .map_err(|e| SynwatchError::Io(e.to_string()))?;
    let index: usize = line
        .trim()
        .parse()
        .map_err(|_| SynwatchError::Configuration {
            option: "interface".to_string(),
            reason: "expected a numeric index".to_string(),
        })?;

    interfaces
        .get(index)
        .map(|iface| iface.id.clone())
        .ok_or_else(|| SynwatchError::Configuration {
            option: "interface".to_string(),
            reason: format!("index {} out of range", index),
        })
}
