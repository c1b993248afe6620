//! tcprelay - transparent TCP forwarder
//!
//! Accepts connections on a local address and relays each one to a fixed
//! remote address until both directions are exhausted.

use anyhow::{Context, Result};
use clap::Parser;
use std::ffi::OsString;
use tcprelay_core::{AddressFamily, RelayOptions, RelayServer};
use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Long flags that may also be written with a single dash (`-lport 8080`).
const SINGLE_DASH_FLAGS: &[&str] = &["verbose", "lhost", "lport", "rhost", "rport"];

/// tcprelay - relay TCP connections from a local port to a remote address
#[derive(Parser, Debug)]
#[command(name = "tcprelay")]
#[command(about = "Relay TCP connections from a local port to a remote address")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
Accepts TCP connections on a local address and relays each one, unmodified,
to a fixed remote address. Half-closes are propagated in both directions.

EXAMPLES:
  # Relay local port 5433 to a PostgreSQL server
  tcprelay -lport 5433 -rhost db.internal -rport 5432

  # Listen on loopback only, IPv4, with connection tracing
  tcprelay -verbose -4 -lhost 127.0.0.1 -lport 8080 -rport 80

ENVIRONMENT VARIABLES:
  RELAY_LOCAL_HOST   Local listen host (default: any)
  RELAY_LOCAL_PORT   Local listen port
  RELAY_REMOTE_HOST  Remote host (default: 127.0.0.1)
  RELAY_REMOTE_PORT  Remote port
"#)]
struct Cli {
    /// Output connection state changes
    #[arg(long)]
    verbose: bool,

    /// Use IPv4 only (takes precedence over -6)
    #[arg(short = '4')]
    ipv4: bool,

    /// Use IPv6 only
    #[arg(short = '6')]
    ipv6: bool,

    /// Local listen host (optional, default: any)
    #[arg(long, env = "RELAY_LOCAL_HOST")]
    lhost: Option<String>,

    /// Local listen port
    #[arg(long, env = "RELAY_LOCAL_PORT")]
    lport: u16,

    /// Remote host
    #[arg(long, env = "RELAY_REMOTE_HOST", default_value = "127.0.0.1")]
    rhost: String,

    /// Remote port
    #[arg(long, env = "RELAY_REMOTE_PORT")]
    rport: u16,
}

impl Cli {
    fn into_options(self) -> RelayOptions {
        RelayOptions {
            family: AddressFamily::from_flags(self.ipv4, self.ipv6),
            local_host: self.lhost.filter(|host| !host.is_empty()),
            local_port: self.lport,
            remote_host: self.rhost,
            remote_port: self.rport,
        }
    }
}

/// Rewrite `-name` / `-name=value` into `--name` for the single-dash flags.
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut passthrough = false;

    args.into_iter()
        .map(|arg| {
            if passthrough {
                return arg;
            }
            let text = match arg.to_str() {
                Some(text) => text.to_string(),
                None => return arg,
            };
            if text == "--" {
                passthrough = true;
                return arg;
            }
            match text.strip_prefix('-') {
                Some(rest) if !rest.starts_with('-') => {
                    let name = rest.split('=').next().unwrap_or(rest);
                    if SINGLE_DASH_FLAGS.contains(&name) {
                        OsString::from(format!("-{}", text))
                    } else {
                        arg
                    }
                }
                _ => arg,
            }
        })
        .collect()
}

/// Setup logging: warnings and errors to stderr, everything else to stdout
fn setup_logging(verbose: bool) -> Result<()> {
    let default_filter = if verbose {
        "tcprelay=debug,tcprelay_core=debug"
    } else {
        "tcprelay=warn,tcprelay_core=warn"
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("Failed to initialize logging filter")?;

    let writer = std::io::stderr
        .with_max_level(tracing::Level::WARN)
        .or_else(std::io::stdout);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(writer))
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_from(normalize_args(std::env::args_os()));

    setup_logging(cli.verbose)?;

    let options = cli.into_options();

    let config = options.resolve().await.with_context(|| {
        format!(
            "Invalid relay configuration ({} -> {})",
            options.local_address(),
            options.remote_address()
        )
    })?;

    let server = RelayServer::bind(&config)
        .await
        .context("Failed to start listener")?;

    info!(
        "Listening for connections on {} for relay to {}",
        server.local_addr(),
        server.remote_addr()
    );

    server.run().await.context("Accept failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_normalize_single_dash_flags() {
        let normalized = normalize_args(args(&[
            "tcprelay", "-verbose", "-4", "-lport", "8080", "-rhost=example.com", "--rport", "80",
        ]));
        assert_eq!(
            normalized,
            args(&[
                "tcprelay",
                "--verbose",
                "-4",
                "--lport",
                "8080",
                "--rhost=example.com",
                "--rport",
                "80",
            ])
        );
    }

    #[test]
    fn test_normalize_stops_at_terminator() {
        let normalized = normalize_args(args(&["tcprelay", "--", "-lport"]));
        assert_eq!(normalized, args(&["tcprelay", "--", "-lport"]));
    }

    #[test]
    fn test_parse_go_style_command_line() {
        let cli = Cli::try_parse_from(normalize_args(args(&[
            "tcprelay", "-6", "-lhost", "::1", "-lport", "9000", "-rhost", "::1", "-rport", "9001",
        ])))
        .unwrap();

        let options = cli.into_options();
        assert_eq!(options.family, AddressFamily::V6);
        assert_eq!(options.local_host.as_deref(), Some("::1"));
        assert_eq!(options.local_port, 9000);
        assert_eq!(options.remote_host, "::1");
        assert_eq!(options.remote_port, 9001);
        assert!(!cli_verbose(&["tcprelay", "-lport", "1", "-rport", "2"]));
        assert!(cli_verbose(&["tcprelay", "-verbose", "-lport", "1", "-rport", "2"]));
    }

    fn cli_verbose(list: &[&str]) -> bool {
        Cli::try_parse_from(normalize_args(args(list))).unwrap().verbose
    }

    #[test]
    fn test_ipv4_takes_precedence_over_ipv6() {
        let cli = Cli::try_parse_from(normalize_args(args(&[
            "tcprelay", "-4", "-6", "-lport", "9000", "-rport", "9001",
        ])))
        .unwrap();
        assert_eq!(cli.into_options().family, AddressFamily::V4);
    }

    #[test]
    fn test_invalid_port_rejected() {
        let result = Cli::try_parse_from(normalize_args(args(&[
            "tcprelay", "-lport", "http", "-rport", "9001",
        ])));
        assert!(result.is_err());
    }
}
