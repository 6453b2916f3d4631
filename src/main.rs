//! `daqctld`: the control-plane intermediary daemon.
//!
//! Wires a [`daqctl::ControlSession`] up to CLI-configured ports and runs
//! it until a fatal error (or a signal that kills the process outright).
//! The concrete client-protocol and data-node-protocol implementations are
//! pluggable and out of scope for this crate, so this binary uses
//! [`daqctl::NoopHandler`] on both sides. That's enough to accept a client,
//! connect to a data node, and accept/refuse connections per the single-
//! session rule, but no actual command translation.

use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use fork::{daemon, Fork};

use daqctl::{ControlSession, NoopHandler, DEFAULT_DNODE_HOST, DEFAULT_DNODE_PORT, DEFAULT_SAMPLE_PORT};

/// Control-plane intermediary between a commanding client and a
/// data-acquisition node.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Don't daemonize; run in the foreground with logs on stderr.
    #[clap(short = 'N', long)]
    dont_daemonize: bool,

    /// TCP port the client control connection listens on.
    #[clap(long, default_value_t = 7849)]
    client_port: u16,

    /// Hostname or address of the data node.
    #[clap(long, default_value_t = DEFAULT_DNODE_HOST.to_string())]
    dnode_host: String,

    /// TCP port of the data node's command/response socket.
    #[clap(long, default_value_t = DEFAULT_DNODE_PORT)]
    dnode_port: u16,

    /// UDP port the sample-ingress socket binds to.
    #[clap(long, default_value_t = DEFAULT_SAMPLE_PORT)]
    sample_port: u16,
}

fn run(args: &Args) -> Result<()> {
    let mut session = ControlSession::new(
        args.client_port,
        &args.dnode_host,
        args.dnode_port,
        args.sample_port,
        Box::new(NoopHandler),
        Box::new(NoopHandler),
    )
    .wrap_err("failed to start control session")?;

    log::info!(
        "control session up: client port {}, data node {}:{}, sample port {}",
        args.client_port,
        args.dnode_host,
        args.dnode_port,
        args.sample_port
    );

    session.run().wrap_err("control session terminated")
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();

    if args.dont_daemonize {
        if let Err(err) = run(&args) {
            log::error!("{err:?}");
            std::process::exit(1);
        }
        return Ok(());
    }

    match daemon(false, false) {
        Ok(Fork::Child) => {
            if let Err(err) = run(&args) {
                log::error!("{err:?}");
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(Fork::Parent(_)) => Ok(()),
        Err(_) => {
            log::error!("failed to daemonize");
            std::process::exit(1);
        }
    }
}
