#![forbid(unsafe_code)]

//! `storyloop-ctl`: operator controls for a running `storyloop` engine.
//!
//! Sends one JSON line over the engine's local socket and prints the reply.
//! Controls are queued and applied between iterations, never mid-dispatch.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};
use serde_json::Value;
use storyloop::ipc::server::{IpcRequest, IpcResponse};
use storyloop::EngineConfig;

#[derive(Debug, Parser)]
#[command(
    name = "storyloop-ctl",
    about = "Pause, resume, skip, or stop a running storyloop engine",
    version
)]
struct Cli {
    /// Socket name of the engine. Overrides `ipc_name` from `--config`.
    #[arg(long)]
    ipc_name: Option<String>,

    /// Read `ipc_name` from this engine config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the raw JSON reply instead of a summary.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Show iteration, current job, retry budgets, and queue counts.
    Status,
    /// Hold before the next iteration.
    Pause,
    /// Leave the paused state.
    Resume,
    /// Rotate the head job to the tail of `pending`.
    Skip,
    /// Stop the engine between iterations (exit 130).
    Quit,
}

impl Command {
    fn verb(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Skip => "skip",
            Self::Quit => "quit",
        }
    }
}

type CtlResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn main() -> ExitCode {
    let args = Cli::parse();

    let ipc_name = match resolve_ipc_name(&args) {
        Ok(name) => name,
        Err(err) => {
            eprintln!("storyloop-ctl: {err}");
            return ExitCode::from(2);
        }
    };

    let request = IpcRequest {
        command: args.command.verb().to_owned(),
    };

    let response = match roundtrip(&ipc_name, &request) {
        Ok(response) => response,
        Err(err) => {
            eprintln!("storyloop-ctl: cannot reach engine on '{ipc_name}': {err}");
            return ExitCode::FAILURE;
        }
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&response).unwrap_or_default()
        );
    } else if response.ok {
        print_success(args.command, response.data.as_ref());
    } else {
        eprintln!(
            "storyloop-ctl: {}",
            response.error.as_deref().unwrap_or("engine rejected the command")
        );
    }

    if response.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn resolve_ipc_name(args: &Cli) -> CtlResult<String> {
    if let Some(name) = &args.ipc_name {
        return Ok(name.clone());
    }
    if let Some(path) = &args.config {
        return Ok(EngineConfig::load_from_path(path)?.ipc_name);
    }
    Ok("storyloop".to_owned())
}

fn roundtrip(ipc_name: &str, request: &IpcRequest) -> CtlResult<IpcResponse> {
    let mut stream = Stream::connect(ipc_name.to_ns_name::<GenericNamespaced>()?)?;

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    stream.write_all(line.as_bytes())?;
    stream.flush()?;

    let mut reply = String::new();
    BufReader::new(&stream).read_line(&mut reply)?;
    if reply.trim().is_empty() {
        return Err("engine closed the connection without replying".into());
    }
    Ok(serde_json::from_str(reply.trim())?)
}

fn print_success(command: Command, data: Option<&Value>) {
    match command {
        Command::Status => match data {
            Some(data) => print_status(data),
            None => println!("no status available"),
        },
        other => println!("{} queued; applied before the next iteration", other.verb()),
    }
}

fn print_status(data: &Value) {
    let status = &data["status"];
    let field = |key: &str| match &status[key] {
        Value::Null => "-".to_owned(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    println!("iteration      {}/{}", field("iteration"), field("max_iterations"));
    println!("current job    {}", field("current_job"));
    println!("last outcome   {}", field("last_outcome"));
    println!("last error     {}", field("last_error"));
    println!(
        "retries left   general {} / no-response {}",
        field("general_remaining"),
        field("no_response_remaining")
    );
    println!("queue          {} pending, {} blocked", field("pending"), field("blocked"));
    if status["paused"].as_bool() == Some(true) {
        println!("state          paused");
    }
    if let Some(terminal) = status["terminal"].as_str() {
        println!("finished       {terminal}");
    }

    if let Some(next) = data["queue"]["nextJob"].as_str() {
        println!("next job       {next}");
    }
}
