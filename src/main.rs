use anyhow::anyhow;
use clap::{Parser, Subcommand, ValueEnum};
use sniffjoke::config::Config;
use sniffjoke::packet::Direction;
use sniffjoke::scramble::Scramble;
use sniffjoke::session::{ConnectionPhase, SessionTrack};
use sniffjoke::ttlfocus::{TtlFocus, TtlFocusMap};
use sniffjoke::{logging, HackEngine};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// SniffJoke packet hacking engine
#[derive(Parser)]
#[command(name = "sniffjoke")]
#[command(about = "Confuses passive traffic analysis by injecting forged packets")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "config/sniffjoke.yml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List plugins and option injectors with their load state
    Plugins,
    /// Validate the configuration file and exit
    CheckConfig,
    /// Run hex-encoded IPv4 frames (one per line) through the engine
    Process {
        /// File with one hex frame per line; '#' starts a comment
        #[arg(long)]
        input: PathBuf,

        /// Direction of the frames
        #[arg(long, value_enum, default_value = "outgoing")]
        direction: DirectionArg,

        /// Scramble classes the session policy permits (comma-separated)
        #[arg(long, default_value = "ttl,checksum,malformed,innocent")]
        session_scrambles: String,

        /// Known hop count of a destination, as ADDR=TTL (repeatable)
        #[arg(long = "known-ttl")]
        known_ttl: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    Outgoing,
    Incoming,
}

impl From<DirectionArg> for Direction {
    fn from(d: DirectionArg) -> Self {
        match d {
            DirectionArg::Outgoing => Direction::Outgoing,
            DirectionArg::Incoming => Direction::Incoming,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config).await?;

    logging::init_logging(&config).await?;

    match cli.command {
        Commands::CheckConfig => {
            let scrambles = config.configured_scrambles()?;
            println!(
                "Configuration '{}' is valid: location '{}', scrambles {}",
                cli.config.display(),
                config.location,
                scrambles
            );
        }
        Commands::Plugins => {
            let engine = HackEngine::from_config(&config)?;
            println!("Plugins:");
            for status in engine.pool().status() {
                println!(
                    "  {:<24} {:<8} supports {}",
                    status.name,
                    if status.enabled { "enabled" } else { "disabled" },
                    status.supported
                );
            }
            println!("Option injectors:");
            for d in engine.composer().descriptors() {
                println!(
                    "  {:>2} {:<24} {:<3} code {:>3} {}{}",
                    d.index,
                    d.name,
                    d.proto.to_string(),
                    d.opcode,
                    format!("{:?}", d.corruption),
                    if d.enabled { "" } else { " (disabled)" }
                );
            }
        }
        Commands::Process {
            input,
            direction,
            session_scrambles,
            known_ttl,
        } => {
            let mut engine = HackEngine::from_config(&config)?;
            let ttl_map = match config.ttl.cache_path {
                Some(ref path) => TtlFocusMap::load(path).await?,
                None => TtlFocusMap::new(),
            };
            for entry in &known_ttl {
                let (daddr, ttl) = parse_known_ttl(entry)?;
                ttl_map.insert(TtlFocus::known(daddr, ttl));
            }

            let mut permitted = Scramble::NONE;
            for name in session_scrambles.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                permitted = permitted | name.parse::<Scramble>()?;
            }
            let session = SessionTrack::new(ConnectionPhase::Established, permitted);

            let contents = tokio::fs::read_to_string(&input)
                .await
                .map_err(|e| anyhow!("Failed to read input '{}': {}", input.display(), e))?;

            for (lineno, line) in contents.lines().enumerate() {
                let line = line.split('#').next().unwrap_or("").trim();
                if line.is_empty() {
                    continue;
                }
                let frame = decode_hex(line)
                    .map_err(|e| anyhow!("{}:{}: {}", input.display(), lineno + 1, e))?;
                println!("frame {}:", lineno + 1);
                for out in engine.process(frame, direction.into(), &session, &ttl_map) {
                    let wtf = out
                        .wtf
                        .map(|j| format!("{:?}", j))
                        .unwrap_or_else(|| "original".to_string());
                    let hint = format!("{:?}", out.hint);
                    println!("  {:<14} {:<12} {}", hint, wtf, encode_hex(&out.bytes));
                }
            }

            let expired = ttl_map.expire(Duration::from_secs(config.ttl.idle_expiry_secs));
            if expired > 0 {
                tracing::info!("Expired {} idle TTL foci", expired);
            }
            if let Some(ref path) = config.ttl.cache_path {
                ttl_map.save(path).await?;
            }
        }
    }

    Ok(())
}

fn parse_known_ttl(entry: &str) -> anyhow::Result<(Ipv4Addr, u8)> {
    let (addr, ttl) = entry
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected ADDR=TTL, got '{}'", entry))?;
    let addr = addr
        .trim()
        .parse::<Ipv4Addr>()
        .map_err(|e| anyhow!("Invalid address in '{}': {}", entry, e))?;
    let ttl = ttl
        .trim()
        .parse::<u8>()
        .map_err(|e| anyhow!("Invalid TTL in '{}': {}", entry, e))?;
    Ok((addr, ttl))
}

fn decode_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    let digits: Vec<char> = s.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    if digits.len() % 2 != 0 {
        return Err(anyhow!("Odd number of hex digits"));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let byte: String = pair.iter().collect();
            u8::from_str_radix(&byte, 16).map_err(|e| anyhow!("Invalid hex byte '{}': {}", byte, e))
        })
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
