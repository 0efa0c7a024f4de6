//! host-agent server binary: parse flags, install the log sinks, serve.

use clap::Parser;
use nix::sys::signal::{self, SigHandler, Signal};

use host_agent::{logging, server};

/// Remote-control agent: exposes this host's process, memory and loader
/// surface to a trusted client over TCP.
#[derive(Parser, Debug)]
#[command(name = "host-agent", version)]
struct Args {
    /// TCP port to listen on.
    #[arg(short = 'p', long = "port", default_value_t = 5910)]
    port: u16,

    /// Log sink: stdout, syslog or file:<path>. May be given multiple times.
    #[arg(short = 'o', long = "output")]
    output: Vec<logging::Sink>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.output)?;

    // a client vanishing mid-write must not kill the server
    unsafe {
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn).ok();
    }

    let listener = server::bind(args.port)?;
    server::serve(listener)?;
    Ok(())
}
