mod error;
mod modes;

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use iox_core::config::Config;
use iox_core::socket::Descriptor;

use error::Result;

/// iox: TCP/UDP relay, SOCKS5 proxy, and reverse-proxy rendezvous.
#[derive(Parser)]
#[command(name = "iox", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Transparent forward of a stream or datagram flow between two endpoints.
    Fwd(ModeArgs),
    /// SOCKS5 proxy, direct or reverse through a persistent control link.
    Proxy(ModeArgs),
}

#[derive(Args)]
struct ModeArgs {
    /// Hexadecimal raw key. Required if any descriptor enables encryption
    /// with the `s` option.
    #[arg(short = 'k', long = "key")]
    key: Option<String>,

    /// Dial timeout in milliseconds.
    #[arg(short = 't', long = "timeout", default_value_t = 5000)]
    timeout: u64,

    /// Enable verbose (info-level) log output.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// One or two socket descriptors: `[options '@'] proto['-l'] ':' addr`.
    descriptors: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.mode {
        Mode::Fwd(args) => run_fwd(args),
        Mode::Proxy(args) => run_proxy(args),
    }
}

fn build_config(args: &ModeArgs, descriptors: &[Descriptor]) -> Result<Config> {
    let raw_key = match &args.key {
        Some(hex_str) => Some(hex::decode(hex_str)?),
        None => None,
    };

    if raw_key.is_none() && descriptors.iter().any(|d| d.secret) {
        return Err(iox_core::DescriptorError::MissingKey.into());
    }

    Ok(Config::new(
        raw_key.as_deref(),
        Duration::from_millis(args.timeout),
        args.verbose,
    ))
}

fn parse_descriptors(raw: &[String]) -> Result<Vec<Descriptor>> {
    raw.iter()
        .map(|s| Descriptor::parse(s).map_err(Into::into))
        .collect()
}

fn run_fwd(args: ModeArgs) -> Result<()> {
    let descriptors = parse_descriptors(&args.descriptors)?;
    let cfg = build_config(&args, &descriptors)?;
    let plan = modes::select_fwd(&descriptors)?;
    match plan {
        modes::FwdPlan::L2R(local, remote) => modes::local_to_remote(&cfg, &local, &remote),
        modes::FwdPlan::L2L(a, b) => modes::local_to_local(&cfg, &a, &b),
        modes::FwdPlan::R2R(a, b) => modes::remote_to_remote(&cfg, &a, &b),
    }
}

fn run_proxy(args: ModeArgs) -> Result<()> {
    let descriptors = parse_descriptors(&args.descriptors)?;
    let cfg = build_config(&args, &descriptors)?;
    let plan = modes::select_proxy(&descriptors)?;
    match plan {
        modes::ProxyPlan::Lp(local) => modes::proxy_local(&cfg, &local),
        modes::ProxyPlan::Rp(remote) => modes::proxy_remote(&cfg, &remote),
        modes::ProxyPlan::Rpl2l(control_desc, local_desc) => {
            modes::proxy_rendezvous(&cfg, &control_desc, &local_desc)
        }
    }
}
