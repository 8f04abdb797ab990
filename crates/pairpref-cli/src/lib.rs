//! Command surface over the preference store.
//!
//! Every command opens its own [`RemoteStore`] (pulling the latest database
//! blob), does its work, and pushes the blob back when it wrote anything.
//! Results are printed to stdout as pretty JSON; logs go to stderr.

pub mod config;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pairpref_blob::{next_rater_id, open_store, BlobStore, CacheSync, RaterFile, RequestCounter};
use pairpref_core::{
    parse_rfc3339, questions_remaining, Answer, Demographics, HazardMarker, Modality, NewQuestion,
    PairValidator, QuestionAlgorithm, State, Trajectory,
};
use pairpref_store_sqlite::{RemoteStore, SampleRequest, DEFAULT_CREATE_USER_RETRIES};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "pairpref")]
#[command(about = "Paired-trajectory preference store")]
pub struct Cli {
    /// TOML configuration file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    remote: Option<String>,

    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[arg(long)]
    database: Option<String>,

    #[arg(long)]
    raters: Option<String>,

    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create an empty database at the remote if none exists.
    Init,
    /// Draw random questions matching the given constraints.
    Sample(SampleArgs),
    /// Fetch a question by label.
    Named(NamedArgs),
    AddTrajectory(FileArgs),
    AddQuestion(AddQuestionArgs),
    AddAnswers(AddAnswersArgs),
    CreateUser(CreateUserArgs),
    PaymentCode(UserArgs),
    /// Row counts for every table.
    Counts,
    Rater {
        #[command(subcommand)]
        command: Box<RaterCommand>,
    },
}

#[derive(Debug, Args)]
pub struct SampleArgs {
    #[arg(long)]
    env: String,
    /// Defaults to `max_questions`, or to what the rater has left with `--rater`.
    #[arg(long)]
    n: Option<usize>,
    #[arg(long)]
    modality: Option<String>,
    #[arg(long)]
    length: Option<i64>,
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<i64>,
    /// Exclude everything this rater has already answered.
    #[arg(long, requires = "payment_code")]
    rater: Option<i64>,
    #[arg(long)]
    payment_code: Option<String>,
}

#[derive(Debug, Args)]
pub struct NamedArgs {
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
pub struct FileArgs {
    /// JSON input file.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct AddQuestionArgs {
    #[arg(long)]
    first: i64,
    #[arg(long)]
    second: i64,
    #[arg(long, value_enum)]
    algorithm: AlgorithmArg,
    #[arg(long)]
    env: String,
    #[arg(long)]
    label: Option<String>,
}

#[derive(Debug, Args)]
pub struct AddAnswersArgs {
    /// JSON array of answers.
    #[arg(long)]
    file: PathBuf,
    /// Applied to answers that carry no `user_id` of their own.
    #[arg(long)]
    user_id: Option<i64>,
}

#[derive(Debug, Args)]
pub struct CreateUserArgs {
    /// Generated when omitted.
    #[arg(long)]
    payment_code: Option<String>,
    #[arg(long, default_value_t = DEFAULT_CREATE_USER_RETRIES)]
    max_retries: u32,
}

#[derive(Debug, Args)]
pub struct UserArgs {
    #[arg(long)]
    user_id: i64,
}

#[derive(Debug, Subcommand)]
pub enum RaterCommand {
    /// Allocate the next rater id and create its file.
    Create(RaterCreateArgs),
    Answer(RaterAnswerArgs),
    /// Question ids already answered and how many remain.
    Used(RaterArgs),
    Interact(RaterInteractArgs),
}

#[derive(Debug, Args)]
pub struct RaterCreateArgs {
    #[arg(long)]
    payment_code: Option<String>,
}

#[derive(Debug, Args)]
pub struct RaterArgs {
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    payment_code: String,
}

#[derive(Debug, Args)]
pub struct RaterAnswerArgs {
    #[command(flatten)]
    rater: RaterArgs,
    #[arg(long)]
    question_id: i64,
    #[arg(long, value_enum)]
    prefer: SideArg,
    #[arg(long)]
    start: String,
    #[arg(long)]
    end: String,
    #[arg(long, requires = "max_steps_second")]
    max_steps_first: Option<i64>,
    #[arg(long, requires = "max_steps_first")]
    max_steps_second: Option<i64>,
}

#[derive(Debug, Args)]
pub struct RaterInteractArgs {
    #[command(flatten)]
    rater: RaterArgs,
    #[arg(long)]
    start: String,
    #[arg(long)]
    end: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AlgorithmArg {
    Random,
    Infogain,
    Manual,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SideArg {
    Left,
    Right,
}

/// A trajectory as submitted by the recording front end.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TrajectoryInput {
    start_state: Value,
    #[serde(default)]
    actions: Option<Vec<i64>>,
    env_name: String,
    modality: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    cstates: Option<Value>,
}

impl TrajectoryInput {
    fn into_trajectory(self) -> Result<Trajectory> {
        Ok(Trajectory {
            start_state: State::from_json(&self.start_state)?,
            actions: self.actions,
            env_name: self.env_name,
            modality: Modality::from_request(&self.modality)?,
            reason: self.reason,
            cstates: self.cstates,
        })
    }
}

/// Resolved configuration plus the blob stores and request counter shared by
/// every step of this run. Stores are opened once so an in-memory remote
/// lives as long as the runtime.
struct Runtime {
    config: Config,
    counter: Arc<RequestCounter>,
    remote: Arc<dyn BlobStore>,
    raters: Arc<dyn BlobStore>,
}

impl Runtime {
    fn new(config: Config) -> Result<Self> {
        let counter = Arc::new(RequestCounter::new(config.prices));
        let remote = open_store(&config.remote, Some(Arc::clone(&counter)))
            .with_context(|| format!("failed to open remote {}", config.remote))?;
        let raters = open_store(&config.raters, Some(Arc::clone(&counter)))
            .with_context(|| format!("failed to open rater store {}", config.raters))?;
        Ok(Self {
            config,
            counter,
            remote,
            raters,
        })
    }

    fn database_sync(&self) -> CacheSync {
        CacheSync::new(
            Arc::clone(&self.remote),
            &self.config.cache_dir,
            &self.config.database,
        )
    }

    fn raters(&self) -> Arc<dyn BlobStore> {
        Arc::clone(&self.raters)
    }

    fn open_rater(&self, args: &RaterArgs) -> Result<RaterFile> {
        Ok(RaterFile::open(
            self.raters(),
            args.user_id,
            &args.payment_code,
        )?)
    }

    /// Opens a fresh copy of the database for one command.
    fn open_database(&self) -> Result<RemoteStore> {
        RemoteStore::open(self.database_sync(), true).context("failed to open remote database")
    }

    fn log_requests(&self) {
        let (cheap, expensive) = self.counter.counts();
        tracing::info!(
            cheap,
            expensive,
            cost_cents = ?self.counter.cost_cents(),
            "object store requests"
        );
    }
}

/// Installs the stderr log subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Merges the optional config file with command-line overrides.
///
/// # Errors
/// Returns an error when the file cannot be loaded or the merged result is
/// invalid.
pub fn resolve_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => config::load(path)?,
        None => Config::default(),
    };
    if let Some(remote) = &cli.remote {
        config.remote.clone_from(remote);
    }
    if let Some(cache_dir) = &cli.cache_dir {
        config.cache_dir.clone_from(cache_dir);
    }
    if let Some(database) = &cli.database {
        config.database.clone_from(database);
    }
    if let Some(raters) = &cli.raters {
        config.raters.clone_from(raters);
    }
    if let Some(log_level) = &cli.log_level {
        config.log_level.clone_from(log_level);
    }
    config::validate(&config)?;
    Ok(config)
}

/// Executes the parsed command line.
///
/// # Errors
/// Returns an error when configuration, storage or the command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;
    init_tracing(&config.log_level);

    let runtime = Runtime::new(config)?;
    let output = run_command(cli.command, &runtime);
    runtime.log_requests();

    println!("{}", serde_json::to_string_pretty(&output?)?);
    Ok(())
}

fn run_command(command: Command, runtime: &Runtime) -> Result<Value> {
    match command {
        Command::Init => {
            let sync = runtime.database_sync();
            let created = RemoteStore::bootstrap(&sync)?;
            Ok(json!({
                "created": created,
                "remote": sync.remote().describe(),
                "database": sync.name(),
            }))
        }
        Command::Sample(args) => run_sample(&args, runtime),
        Command::Named(args) => {
            let db = runtime.open_database()?;
            let question = db.store().get_named_question(&args.name)?;
            Ok(serde_json::to_value(question)?)
        }
        Command::AddTrajectory(args) => {
            let input: TrajectoryInput = read_json_file(&args.file)?;
            let trajectory = input.into_trajectory()?;
            let db = runtime.open_database()?;
            let id = db.store().insert_trajectory(&trajectory)?;
            db.publish(true)?;
            Ok(json!({ "trajectory_id": id }))
        }
        Command::AddQuestion(args) => {
            let db = runtime.open_database()?;
            let id = db.store().insert_question(&NewQuestion {
                first_traj_id: args.first,
                second_traj_id: args.second,
                algorithm: map_algorithm(args.algorithm),
                env_name: args.env,
                label: args.label,
            })?;
            db.publish(true)?;
            Ok(json!({ "question_id": id }))
        }
        Command::AddAnswers(args) => {
            let mut answers: Vec<Answer> = read_json_file(&args.file)?;
            for answer in &mut answers {
                if answer.user_id.is_none() {
                    answer.user_id = args.user_id;
                }
            }
            let mut db = runtime.open_database()?;
            db.store_mut().insert_answers(&answers)?;
            db.publish(true)?;
            Ok(json!({ "inserted": answers.len() }))
        }
        Command::CreateUser(args) => {
            let payment_code = args.payment_code.unwrap_or_else(new_payment_code);
            let db = runtime.open_database()?;
            let user_id =
                db.store()
                    .create_user(&Demographics::default(), &payment_code, args.max_retries)?;
            db.publish(true)?;
            Ok(json!({ "user_id": user_id, "payment_code": payment_code }))
        }
        Command::PaymentCode(args) => {
            let db = runtime.open_database()?;
            let payment_code = db.store().get_payment_code(args.user_id)?;
            Ok(json!({ "user_id": args.user_id, "payment_code": payment_code }))
        }
        Command::Counts => {
            let db = runtime.open_database()?;
            Ok(serde_json::to_value(db.store().table_counts()?)?)
        }
        Command::Rater { command } => run_rater(*command, runtime),
    }
}

fn run_sample(args: &SampleArgs, runtime: &Runtime) -> Result<Value> {
    let mut exclude_ids: BTreeSet<i64> = args.exclude.iter().copied().collect();
    let mut default_n = runtime.config.max_questions;

    if let (Some(user_id), Some(payment_code)) = (args.rater, &args.payment_code) {
        let rater = runtime.open_rater(&RaterArgs {
            user_id,
            payment_code: payment_code.clone(),
        })?;
        let used = rater.used_question_ids()?;
        default_n = questions_remaining(runtime.config.max_questions, &used);
        exclude_ids.extend(used);
    }

    let request = SampleRequest {
        n: args.n.unwrap_or(default_n),
        env: args.env.clone(),
        modality: args
            .modality
            .as_deref()
            .map(Modality::from_request)
            .transpose()?,
        length: args.length,
        exclude_ids,
    };

    let marker = HazardMarker {
        cell_value: runtime.config.hazard_marker,
    };
    let validators: [&dyn PairValidator; 1] = [&marker];

    let db = runtime.open_database()?;
    let questions = db.store().sample_random_pairs(&request, &validators)?;
    Ok(serde_json::to_value(questions)?)
}

fn run_rater(command: RaterCommand, runtime: &Runtime) -> Result<Value> {
    match command {
        RaterCommand::Create(args) => {
            let store = runtime.raters();
            let user_id = next_rater_id(store.as_ref())?;
            let payment_code = args.payment_code.unwrap_or_else(new_payment_code);
            let rater = RaterFile::open(store, user_id, &payment_code)?;
            Ok(serde_json::to_value(rater.get()?)?)
        }
        RaterCommand::Answer(args) => {
            let rater = runtime.open_rater(&args.rater)?;
            let answer = Answer {
                question_id: args.question_id,
                user_id: None,
                answer: matches!(args.prefer, SideArg::Right),
                start_time: parse_rfc3339(&args.start)?,
                end_time: parse_rfc3339(&args.end)?,
                max_steps: args.max_steps_first.zip(args.max_steps_second),
            };
            Ok(serde_json::to_value(rater.record_answer(answer)?)?)
        }
        RaterCommand::Used(args) => {
            let rater = runtime.open_rater(&args)?;
            let used = rater.used_question_ids()?;
            Ok(json!({
                "user_id": rater.user_id(),
                "used": used,
                "remaining": questions_remaining(runtime.config.max_questions, &used),
            }))
        }
        RaterCommand::Interact(args) => {
            let rater = runtime.open_rater(&args.rater)?;
            let user =
                rater.record_interact_times(parse_rfc3339(&args.start)?, parse_rfc3339(&args.end)?)?;
            Ok(serde_json::to_value(user)?)
        }
    }
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn map_algorithm(value: AlgorithmArg) -> QuestionAlgorithm {
    match value {
        AlgorithmArg::Random => QuestionAlgorithm::Random,
        AlgorithmArg::Infogain => QuestionAlgorithm::Infogain,
        AlgorithmArg::Manual => QuestionAlgorithm::Manual,
    }
}

fn new_payment_code() -> String {
    Ulid::new().to_string()
}
