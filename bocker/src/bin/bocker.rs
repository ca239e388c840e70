//! Command-line entry point.
//!
//! Thin dispatch over the library runtime: parse, run, print, map errors to
//! exit codes. 0 on success, 1 on usage or semantic errors, 130 when the
//! user interrupts. Diagnostics go to stderr; stdout carries only command
//! output (tables, streamed logs, `Created:` lines).

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use bocker::{Bocker, BockerResult, RuntimeConfig, render_containers, render_images};

#[derive(Parser)]
#[command(name = "bocker", about = "Docker-style containers from Linux primitives", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull an image from the registry origin
    Pull { name: String, tag: String },
    /// Create an image from a directory
    Init { directory: PathBuf },
    /// List images
    Images,
    /// List containers
    Ps,
    /// Create a container from an image and run a command in it
    Run {
        image: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Execute a command in a running container
    Exec {
        container: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// View logs from a container
    Logs { container: String },
    /// Commit a container to an image
    Commit { container: String, image: String },
    /// Delete an image or container
    Rm { id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    let runtime = match Bocker::new(RuntimeConfig::from_env()) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("bocker: {e}");
            return ExitCode::from(1);
        }
    };

    let outcome = tokio::select! {
        outcome = dispatch(&runtime, cli.command) => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("bocker: interrupted");
            return ExitCode::from(130);
        }
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("bocker: {e}");
            ExitCode::from(1)
        }
    }
}

async fn dispatch(runtime: &Bocker, command: Command) -> BockerResult<ExitCode> {
    match command {
        Command::Pull { name, tag } => {
            let id = runtime.pull(&name, &tag).await?;
            println!("Created: {id}");
        }
        Command::Init { directory } => {
            let id = runtime.init_directory(&directory)?;
            println!("Created: {id}");
        }
        Command::Images => {
            print!("{}", render_images(&runtime.images()?));
        }
        Command::Ps => {
            print!("{}", render_containers(&runtime.containers()?));
        }
        Command::Run { image, command } => {
            runtime.run(&image, &command).await?;
        }
        Command::Exec { container, command } => {
            let status = runtime.exec(&container, &command).await?;
            return Ok(exit_code_of(status));
        }
        Command::Logs { container } => {
            let log = runtime.logs(&container)?;
            std::io::stdout().write_all(&log)?;
        }
        Command::Commit { container, image } => {
            runtime.commit(&container, &image)?;
            println!("Created: {image}");
        }
        Command::Rm { id } => {
            runtime.remove(&id)?;
            println!("Removed: {id}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Propagate the exec'd command's own status, shell-style.
fn exit_code_of(status: std::process::ExitStatus) -> ExitCode {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => ExitCode::from(code.clamp(0, 255) as u8),
        None => ExitCode::from(128 + status.signal().unwrap_or(0).clamp(0, 127) as u8),
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}
