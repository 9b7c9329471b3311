use clap::{ArgAction, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use slurm_broker::{
    logging, CallError, ConfigErrors, RunCapsule, Task, TaskConfig, TaskRegistry,
};
use std::{
    convert::Infallible,
    path::{Path, PathBuf},
    process::ExitCode,
};
use thiserror::Error;
use tracing::{debug, error};

/// Run the example tasks locally or as Slurm jobs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Task config in YAML, without one every task runs in-process unless SLURM_REMOTE is set
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity, RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add two integers
    Add { a: i64, b: i64 },
    /// Greet someone by name
    Greet {
        name: String,
        #[arg(long)]
        excited: bool,
    },
    /// Print text on whichever host runs the task
    Write { text: String },
    /// List the registered tasks
    Tasks,
    /// Run a call capsule on this host, the job script invokes this
    RunCapsule(RunCapsule),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Greeting {
    name: String,
    excited: bool,
}

#[derive(Error, Debug)]
enum GreetError {
    #[error("Cannot greet someone without a name")]
    EmptyName,
}

fn add((a, b): (i64, i64)) -> Result<i64, Infallible> {
    Ok(a + b)
}

fn greet(greeting: Greeting) -> Result<String, GreetError> {
    let name = greeting.name.trim();

    if name.is_empty() {
        return Err(GreetError::EmptyName);
    }

    Ok(match greeting.excited {
        true => format!("Hello, {name}!"),
        false => format!("Hello, {name}."),
    })
}

fn write(text: String) -> Result<(), Infallible> {
    println!("Writing to standard output: {text}");
    Ok(())
}

struct Tasks {
    add: Task<(i64, i64), i64, Infallible>,
    greet: Task<Greeting, String, GreetError>,
    write: Task<String, (), Infallible>,
}

/// The registry has to look the same on both ends, both sides build it here.
fn register(config: &TaskConfig) -> (TaskRegistry, Tasks) {
    let mut registry = TaskRegistry::new();
    let tasks = Tasks {
        add: registry.task("add", config.clone(), add),
        greet: registry.task("greet", config.clone(), greet),
        write: registry.task("write", config.clone(), write),
    };

    (registry, tasks)
}

fn load_config(path: Option<&Path>) -> Result<TaskConfig, ConfigErrors> {
    let mut config = match path {
        Some(path) => TaskConfig::load(path)?,
        None => TaskConfig::default(),
    };
    config.apply_env()?;

    if config.preflight_checks() {
        return Err(ConfigErrors::PreflightFailed);
    }

    Ok(config)
}

fn finish<R, E: std::fmt::Display>(
    result: Result<R, CallError<E>>,
    show: impl FnOnce(R),
) -> ExitCode {
    match result {
        Ok(value) => {
            show(value);
            ExitCode::SUCCESS
        }
        Err(CallError::Task(task_error)) => {
            error!("Task failed: {task_error}");
            ExitCode::FAILURE
        }
        Err(CallError::Broker(broker_error)) => {
            error!(stage = broker_error.stage(), "{broker_error}");
            ExitCode::FAILURE
        }
    }
}

/// Load `.env`, from `env_file` or the current directory upwards, then start logging.
/// RUST_LOG may come from the file, so the order matters.
fn start(verbose: u8, env_file: Option<&Path>) {
    let loaded = match env_file {
        Some(path) => dotenvy::from_path(path),
        None => dotenvy::dotenv().map(|_| ()),
    };
    logging::init(verbose);

    if let Err(dotenv_error) = loaded {
        debug!("No .env file loaded: {dotenv_error}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    start(cli.verbose, None);

    // the worker side only needs the registry, never a remote
    if let Command::RunCapsule(ref run) = cli.command {
        let (registry, _) = register(&TaskConfig::default());
        return run.execute(&registry);
    }

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(config_error) => {
            error!("{config_error}");
            return ExitCode::FAILURE;
        }
    };
    let (registry, tasks) = register(&config);

    match cli.command {
        Command::Add { a, b } => finish(tasks.add.call((a, b)), |sum| println!("{sum}")),
        Command::Greet { name, excited } => finish(
            tasks.greet.call(Greeting { name, excited }),
            |greeting| println!("{greeting}"),
        ),
        Command::Write { text } => finish(tasks.write.call(text), |()| ()),
        Command::Tasks => {
            for name in registry.names() {
                println!("{name}");
            }
            ExitCode::SUCCESS
        }
        Command::RunCapsule(_) => ExitCode::SUCCESS,
    }
}
