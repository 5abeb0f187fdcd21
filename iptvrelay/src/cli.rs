use clap::{Parser, Subcommand};
use iptvrelay_stream::{RelayMode, SessionKind};

#[derive(Parser, Debug)]
#[command(name = "iptvrelay")]
#[command(about = "Local relay between IPTV providers and players or cast receivers", long_about = None)]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(long, short, global = true, env = "IPTVRELAY_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the control API (default)
    Serve,

    /// Relay a single source and print its local URL
    Relay {
        /// Upstream stream URL
        url: String,

        /// Force a relay mode instead of classifying the source
        #[arg(long, value_parser = parse_mode)]
        mode: Option<RelayMode>,

        /// `live` restarts on EOF, `catch-up` ends there
        #[arg(long, default_value = "live", value_parser = parse_kind)]
        kind: SessionKind,

        /// The consumer is a cast receiver
        #[arg(long)]
        cast: bool,

        /// Receiver quality ceiling in kbps
        #[arg(long)]
        max_bitrate: Option<u32>,

        /// Extra upstream header, `Name: value` (repeatable)
        #[arg(long = "header", short = 'H', value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },
}

fn parse_mode(s: &str) -> Result<RelayMode, String> {
    s.parse::<RelayMode>().map_err(|e| e.to_string())
}

fn parse_kind(s: &str) -> Result<SessionKind, String> {
    s.parse::<SessionKind>().map_err(|e| e.to_string())
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("expected 'Name: value', got '{s}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in '{s}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}
