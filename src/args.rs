use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgMatches, Command};
use clap_complete::Shell;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

pub fn build_cli() -> Command {
    Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("calendar-dir")
                .value_parser(value_parser!(PathBuf))
                .help("Calendar data directory (journal/, index/, uri, hmac-key)"),
        )
        .arg(
            Arg::new("chain")
                .long("chain")
                .env("OTS_CALENDAR_CHAIN")
                .default_value("mainnet")
                .value_parser(["mainnet", "testnet", "regtest"])
                .help("Chain the calendar anchors into; must match the node"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .default_value("127.0.0.1")
                .value_parser(value_parser!(IpAddr))
                .help("Address to listen on"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .default_value("14788")
                .value_parser(value_parser!(u16))
                .help("Port to listen on"),
        )
        .arg(
            Arg::new("round-interval")
                .long("round-interval")
                .default_value("1")
                .value_parser(value_parser!(u64).range(1..))
                .help("Seconds per aggregation round"),
        )
        .arg(
            Arg::new("anchor-interval")
                .long("anchor-interval")
                .default_value("3600")
                .value_parser(value_parser!(u64).range(1..))
                .help("Minimum seconds between anchor transactions"),
        )
        .arg(
            Arg::new("min-relay-feerate")
                .long("min-relay-feerate")
                .default_value("1")
                .value_parser(value_parser!(u64).range(1..))
                .help("Feerate floor in sat/vB"),
        )
        .arg(
            Arg::new("max-fee")
                .long("max-fee")
                .default_value("50000")
                .value_parser(value_parser!(u64).range(1..))
                .help("Absolute fee ceiling per anchor, in satoshis"),
        )
        .arg(
            Arg::new("conf-target")
                .long("conf-target")
                .default_value("2")
                .value_parser(value_parser!(u16).range(1..))
                .help("Confirmation target for fee estimation, in blocks"),
        )
        .arg(
            Arg::new("confirmations")
                .long("confirmations")
                .default_value("6")
                .value_parser(value_parser!(i64).range(1..))
                .help("Depth required before block attestations are published"),
        )
        .arg(
            Arg::new("buffer-cap")
                .long("buffer-cap")
                .default_value("65536")
                .value_parser(value_parser!(usize))
                .help("Maximum digests buffered per round before submissions are refused"),
        )
        .arg(
            Arg::new("rpc-url")
                .long("rpc-url")
                .env("OTS_CALENDAR_RPC_URL")
                .help("Node RPC endpoint [default: http://127.0.0.1:<chain port>]"),
        )
        .arg(
            Arg::new("rpc-user")
                .long("rpc-user")
                .env("OTS_CALENDAR_RPC_USER")
                .help("Node RPC username"),
        )
        .arg(
            Arg::new("rpc-pass")
                .long("rpc-pass")
                .env("OTS_CALENDAR_RPC_PASS")
                .help("Node RPC password"),
        )
        .arg(
            Arg::new("rpc-cookie")
                .long("rpc-cookie")
                .value_parser(value_parser!(PathBuf))
                .conflicts_with_all(["rpc-user", "rpc-pass"])
                .help("Node RPC cookie file, as an alternative to user/pass"),
        )
        .arg(
            Arg::new("completions")
                .long("completions")
                .value_name("shell")
                .value_parser(value_parser!(Shell))
                .help("Print shell completion script for <shell>"),
        )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Mainnet,
    Testnet,
    Regtest,
}

impl Chain {
    /// Name the node reports in getblockchaininfo.
    pub fn core_name(self) -> &'static str {
        match self {
            Chain::Mainnet => "main",
            Chain::Testnet => "test",
            Chain::Regtest => "regtest",
        }
    }

    pub fn default_rpc_port(self) -> u16 {
        match self {
            Chain::Mainnet => 8332,
            Chain::Testnet => 18332,
            Chain::Regtest => 18443,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Args {
    pub calendar_dir: PathBuf,
    pub chain: Chain,
    pub bind: IpAddr,
    pub port: u16,
    pub round_interval: Duration,
    pub anchor_interval: Duration,
    pub min_relay_feerate: u64,
    pub max_fee: u64,
    pub conf_target: u16,
    pub confirmations: i64,
    pub buffer_cap: usize,
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
}

impl Args {
    pub fn parse(matches: ArgMatches) -> Result<Args> {
        let calendar_dir = matches
            .get_one::<PathBuf>("calendar-dir")
            .context("calendar data directory argument is required")?
            .clone();
        let chain = match matches.get_one::<String>("chain").unwrap().as_str() {
            "mainnet" => Chain::Mainnet,
            "testnet" => Chain::Testnet,
            _ => Chain::Regtest,
        };
        let rpc_url = matches
            .get_one::<String>("rpc-url")
            .cloned()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", chain.default_rpc_port()));

        let (rpc_user, rpc_password) = match matches.get_one::<PathBuf>("rpc-cookie") {
            Some(cookie) => {
                let contents = std::fs::read_to_string(cookie).with_context(|| {
                    format!("failed to read rpc cookie {}", cookie.display())
                })?;
                let (user, password) = contents
                    .trim()
                    .split_once(':')
                    .context("rpc cookie is not in user:password form")?;
                (user.to_string(), password.to_string())
            }
            None => {
                match (
                    matches.get_one::<String>("rpc-user"),
                    matches.get_one::<String>("rpc-pass"),
                ) {
                    (Some(user), Some(password)) => (user.clone(), password.clone()),
                    _ => bail!(
                        "node RPC credentials required: --rpc-user/--rpc-pass or --rpc-cookie"
                    ),
                }
            }
        };

        Ok(Args {
            calendar_dir,
            chain,
            bind: *matches.get_one::<IpAddr>("bind").unwrap(),
            port: *matches.get_one::<u16>("port").unwrap(),
            round_interval: Duration::from_secs(*matches.get_one::<u64>("round-interval").unwrap()),
            anchor_interval: Duration::from_secs(
                *matches.get_one::<u64>("anchor-interval").unwrap(),
            ),
            min_relay_feerate: *matches.get_one::<u64>("min-relay-feerate").unwrap(),
            max_fee: *matches.get_one::<u64>("max-fee").unwrap(),
            conf_target: *matches.get_one::<u16>("conf-target").unwrap(),
            confirmations: *matches.get_one::<i64>("confirmations").unwrap(),
            buffer_cap: *matches.get_one::<usize>("buffer-cap").unwrap(),
            rpc_url,
            rpc_user,
            rpc_password,
        })
    }
}
