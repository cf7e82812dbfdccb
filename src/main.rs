//! QGA CLI
//!
//! Entry point for the `qga` command-line tool.

use clap::{Parser, Subcommand};
use qga_client::{QgaClient, UnixTransport};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "qga")]
#[command(about = "QEMU guest agent helper", version)]
struct Cli {
    /// Path to the guest agent socket
    #[arg(long)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a shell command in the guest and wait for it
    Exec {
        /// Seconds to wait for the command to exit
        #[arg(long, default_value_t = 300)]
        timeout: u64,

        /// The command to run (after --)
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },

    /// Push a local file into the guest
    Push {
        /// Local source file
        #[arg(long)]
        src: PathBuf,

        /// Destination path in the guest
        #[arg(long)]
        dest: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = QgaClient::new(Arc::new(UnixTransport::new(&cli.socket)));

    let code = match cli.command {
        Commands::Exec { timeout, cmd } => run_exec(&client, &cmd, timeout),
        Commands::Push { src, dest } => run_push(&client, &src, &dest),
    };
    process::exit(code);
}

fn run_exec(client: &QgaClient, cmd: &[String], timeout: u64) -> i32 {
    let command = cmd.join(" ");

    let result = match client.exec(&command, Duration::from_secs(timeout)) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    // Raw decoded bytes, no re-encoding
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    if stdout
        .write_all(&result.stdout)
        .and_then(|_| stdout.flush())
        .is_err()
        || stderr
            .write_all(&result.stderr)
            .and_then(|_| stderr.flush())
            .is_err()
    {
        return 1;
    }

    result.exit_code
}

fn run_push(client: &QgaClient, src: &Path, dest: &str) -> i32 {
    match client.push(src, dest) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}
