use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

mod handlers;

#[derive(Parser)]
#[command(name = "siphon")]
#[command(about = "Serve one terminal session to many clients", long_about = None)]
#[command(version)]
struct Cli {
    /// Print debug diagnostics
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Append diagnostics to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Endpoint {
    /// Transport: unix or tcp
    #[arg(long, default_value = "unix")]
    proto: String,

    /// Socket path or host:port (default: ~/.siphon/siphon.sock)
    #[arg(long)]
    addr: Option<String>,

    /// Name used in diagnostics
    #[arg(long, default_value = "siphon")]
    label: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command on a PTY and serve it
    #[command(aliases = &["h"])]
    Host {
        #[command(flatten)]
        endpoint: Endpoint,

        /// Command and arguments to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Attach the local terminal to a served session
    #[command(aliases = &["a", "at"])]
    Attach {
        #[command(flatten)]
        endpoint: Endpoint,
    },

    /// Send every client that connects here on to another address
    Redirect {
        #[command(flatten)]
        endpoint: Endpoint,

        /// Transport of the target: unix or tcp
        #[arg(long, default_value = "unix")]
        to_proto: String,

        /// Socket path or host:port to redirect to
        #[arg(long)]
        to_addr: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let diag = match handlers::init_diagnostics(cli.verbose, cli.log_file.as_deref()) {
        Ok(diag) => diag,
        Err(e) => {
            eprintln!("siphon: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Host { endpoint, command } => handlers::handle_host(
            &endpoint.proto,
            endpoint.addr,
            endpoint.label,
            command,
            &diag,
        ),
        Commands::Attach { endpoint } => {
            handlers::handle_attach(&endpoint.proto, endpoint.addr, endpoint.label, &diag)
        }
        Commands::Redirect {
            endpoint,
            to_proto,
            to_addr,
        } => handlers::handle_redirect(
            &endpoint.proto,
            endpoint.addr,
            endpoint.label,
            &to_proto,
            to_addr,
            &diag,
        ),
    };

    if let Err(e) = result {
        eprintln!("siphon: {}", e);
        std::process::exit(1);
    }
}
