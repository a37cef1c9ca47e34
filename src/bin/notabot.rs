//! Notabot CLI - Inspect tracker state and score sample windows
//!
//! Commands:
//! - verify: Audit the event chain in a persisted state file
//! - score: Print the score and commit state from a persisted state file
//! - analyze: Score a JSON sample window the way the tracker would

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notabot_engine::chain::{audit_chain, ZERO_HASH};
use notabot_engine::entropy;
use notabot_engine::identity::{Ed25519Verifier, SignatureVerifier};
use notabot_engine::storage::{FileStateStore, PersistedState, StateStore};
use notabot_engine::types::{FocusSample, PointerSample, ScrollSample, TouchSample};
use notabot_engine::{CommitState, NotabotError, Score, TrackerConfig, ENGINE_VERSION, PRODUCER_NAME};

/// Notabot - On-device behavioral legitimacy engine
#[derive(Parser)]
#[command(name = "notabot")]
#[command(version = ENGINE_VERSION)]
#[command(about = "Inspect Notabot ledgers and score behavioral samples", long_about = None)]
struct Cli {
    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Audit hashes, links and signatures of a persisted chain
    Verify {
        /// Persisted state file
        #[arg(short, long)]
        state: PathBuf,
    },

    /// Print the score and commit state of a persisted session
    Score {
        /// Persisted state file
        #[arg(short, long)]
        state: PathBuf,

        /// Pretty-print the output
        #[arg(long)]
        pretty: bool,
    },

    /// Score a window of samples (JSON array)
    Analyze {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Sample channel
        #[arg(long, value_enum)]
        channel: Channel,

        /// Tracker configuration JSON (defaults apply otherwise)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Channel {
    Pointer,
    Scroll,
    Focus,
    Touch,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("notabot_engine={}", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), NotabotCliError> {
    match cli.command {
        Commands::Verify { state } => cmd_verify(&state),
        Commands::Score { state, pretty } => cmd_score(&state, pretty),
        Commands::Analyze {
            input,
            channel,
            config,
        } => cmd_analyze(&input, channel, config.as_deref()),
    }
}

fn load_state(path: &Path) -> Result<PersistedState, NotabotCliError> {
    FileStateStore::new(path)
        .load()?
        .ok_or_else(|| NotabotCliError::NoState(path.display().to_string()))
}

#[derive(Serialize)]
struct VerifyReport {
    producer: &'static str,
    version: &'static str,
    identity_address: String,
    address_matches_key: bool,
    events: usize,
    valid_prefix: usize,
    valid: bool,
    failure: Option<String>,
}

fn cmd_verify(path: &Path) -> Result<(), NotabotCliError> {
    let state = load_state(path)?;
    let public_key = hex::decode(&state.public_key)
        .map_err(|e| NotabotCliError::InvalidState(format!("public key is not hex: {}", e)))?;

    let verifier = Ed25519Verifier;
    let address_matches_key = verifier.address_of(&public_key).as_deref() == Some(state.identity_address.as_str());
    let audit = audit_chain(&state.chain, ZERO_HASH, &public_key, &verifier);

    let report = VerifyReport {
        producer: PRODUCER_NAME,
        version: ENGINE_VERSION,
        identity_address: state.identity_address.clone(),
        address_matches_key,
        events: state.chain.len(),
        valid_prefix: audit.valid_prefix,
        valid: audit.is_valid() && address_matches_key,
        failure: audit.failure.as_ref().map(|f| f.to_string()),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.valid {
        Ok(())
    } else {
        Err(NotabotCliError::ChainInvalid(report.valid_prefix))
    }
}

#[derive(Serialize)]
struct ScoreReport {
    identity_address: String,
    session_start: chrono::DateTime<chrono::Utc>,
    score: Score,
    commit_state: CommitState,
    last_accepted_event_count: Option<u64>,
    pending_event_count: Option<u64>,
}

fn cmd_score(path: &Path, pretty: bool) -> Result<(), NotabotCliError> {
    let state = load_state(path)?;
    let report = ScoreReport {
        identity_address: state.identity_address,
        session_start: state.session_start,
        score: Score {
            points: state.current_points,
            event_count: state.chain.len() as u64,
            last_update: state.chain.last().map(|e| e.timestamp),
        },
        commit_state: state.commit_state,
        last_accepted_event_count: state.last_accepted.map(|c| c.event_count),
        pending_event_count: state.pending_commit.map(|p| p.commitment.event_count),
    };

    let json = if pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", json);
    Ok(())
}

#[derive(Serialize)]
struct AnalyzeReport {
    samples: usize,
    threshold: f64,
    observations: Vec<Observation>,
}

#[derive(Serialize)]
struct Observation {
    event_type: &'static str,
    score: f64,
    qualifies: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

fn cmd_analyze(input: &Path, channel: Channel, config: Option<&Path>) -> Result<(), NotabotCliError> {
    let config = match config {
        Some(path) => TrackerConfig::from_json(&fs::read_to_string(path)?)?,
        None => TrackerConfig::default(),
    };

    let input_data = if input.to_string_lossy() == "-" {
        if atty::is(atty::Stream::Stdin) {
            return Err(NotabotCliError::NoInput);
        }
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(input)?
    };

    let threshold = config.entropy_threshold;
    let observation = |event_type: &'static str, score: f64, detail: Option<serde_json::Value>| Observation {
        event_type,
        score,
        qualifies: score >= threshold,
        detail,
    };

    let (samples, observations) = match channel {
        Channel::Pointer => {
            let samples: Vec<PointerSample> = serde_json::from_str(&input_data)?;
            let score = entropy::pointer_score(&samples);
            let detail = serde_json::to_value(score)?;
            (samples.len(), vec![observation("mouse_entropy", score.composite, Some(detail))])
        }
        Channel::Scroll => {
            let samples: Vec<ScrollSample> = serde_json::from_str(&input_data)?;
            (samples.len(), vec![observation("scroll_pattern", entropy::scroll_score(&samples), None)])
        }
        Channel::Focus => {
            let samples: Vec<FocusSample> = serde_json::from_str(&input_data)?;
            let score = entropy::focus_score(&samples, config.focus_window());
            (samples.len(), vec![observation("focus_pattern", score, None)])
        }
        Channel::Touch => {
            let samples: Vec<TouchSample> = serde_json::from_str(&input_data)?;
            let scores = entropy::touch_scores(&samples);
            let mut observations = vec![observation(
                "touch_path",
                scores.path.composite,
                Some(serde_json::to_value(scores.path)?),
            )];
            if let Some(pressure) = scores.pressure {
                observations.push(observation("touch_pressure", pressure, None));
            }
            if let Some(multitouch) = scores.multitouch {
                observations.push(observation("multitouch_gesture", multitouch, None));
            }
            (samples.len(), observations)
        }
    };

    if samples == 0 {
        return Err(NotabotCliError::NoSamples);
    }

    let report = AnalyzeReport {
        samples,
        threshold,
        observations,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// Error types

#[derive(Debug)]
enum NotabotCliError {
    Io(io::Error),
    Engine(NotabotError),
    Json(serde_json::Error),
    NoState(String),
    InvalidState(String),
    ChainInvalid(usize),
    NoInput,
    NoSamples,
}

impl From<io::Error> for NotabotCliError {
    fn from(e: io::Error) -> Self {
        NotabotCliError::Io(e)
    }
}

impl From<NotabotError> for NotabotCliError {
    fn from(e: NotabotError) -> Self {
        NotabotCliError::Engine(e)
    }
}

impl From<serde_json::Error> for NotabotCliError {
    fn from(e: serde_json::Error) -> Self {
        NotabotCliError::Json(e)
    }
}

#[derive(Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<NotabotCliError> for CliError {
    fn from(e: NotabotCliError) -> Self {
        match e {
            NotabotCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            NotabotCliError::Engine(e) => CliError {
                code: "ENGINE_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            NotabotCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax and sample fields".to_string()),
            },
            NotabotCliError::NoState(path) => CliError {
                code: "NO_STATE".to_string(),
                message: format!("No persisted state at {}", path),
                hint: Some("Point --state at a tracker state file".to_string()),
            },
            NotabotCliError::InvalidState(msg) => CliError {
                code: "INVALID_STATE".to_string(),
                message: msg,
                hint: None,
            },
            NotabotCliError::ChainInvalid(prefix) => CliError {
                code: "CHAIN_INVALID".to_string(),
                message: format!("Chain verification failed after {} valid events", prefix),
                hint: Some("Events from the failure point onward cannot be trusted".to_string()),
            },
            NotabotCliError::NoInput => CliError {
                code: "NO_INPUT".to_string(),
                message: "No input on stdin".to_string(),
                hint: Some("Pipe a JSON sample array or pass --input <file>".to_string()),
            },
            NotabotCliError::NoSamples => CliError {
                code: "NO_SAMPLES".to_string(),
                message: "Sample window is empty".to_string(),
                hint: Some("Provide a non-empty JSON array of samples".to_string()),
            },
        }
    }
}
