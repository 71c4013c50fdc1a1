// avlink command-line driver -- opens one link to a switcher over serial,
// TCP (client or listening), HTTP, or an IR gateway and pushes commands
// through the priority queues.
//
// Usage:
//   avlink-cli --serial /dev/ttyUSB0 --serial-settings 19200,8N1 send "OUT1 IN3" "OUT2 IN3"
//   avlink-cli --tcp 192.168.1.50:23 --require-ack --ack-prefix OK send -p p1 "MUTE ON"
//   avlink-cli --tcp 192.168.1.50:23 --keep-alive "?" monitor --duration 120
//   avlink-cli --listen 0.0.0.0:4001 interactive
//   avlink-cli --url http://192.168.1.60 send "/cgi-bin/route?out=1&in=2"
//   avlink-cli --ir-gateway 192.168.1.70:4998 --ir-port 2 send "0000 006D 0022"
//   avlink-cli --tcp 192.168.1.50:23 stress --count 200 --priority p2
//
// Interactive mode reads one command per line from stdin. A line may start
// with a tier ("p1 ", "p2 ") to jump the queue; ":status", ":clear", and
// ":quit" are handled locally.
//
// Set RUST_LOG=avlink_dispatch=debug to watch the dispatcher state machine.

use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use avlink::dispatch::{Delimiter, Framing, LinkBuilder, LinkHandle, LinkStatus, MessageKind};
use avlink::transport::{SerialConfig, TransportFactory, TransportSettings};
use avlink::{BindingKind, LinkEvent, NetworkMode, Priority};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "avlink-cli", about = "Drive an AV switcher control link")]
struct Cli {
    /// Serial device path (e.g. /dev/ttyUSB0, COM3).
    #[arg(long)]
    serial: Option<String>,

    /// Serial line settings, baud rate and character format (e.g. 19200,7E1).
    #[arg(long, default_value = "9600,8N1")]
    serial_settings: SerialConfig,

    /// Connect out to the switcher's control port (host:port).
    #[arg(long, conflicts_with = "listen")]
    tcp: Option<String>,

    /// Listen for the switcher to connect in (host:port).
    #[arg(long)]
    listen: Option<String>,

    /// Base URL of the switcher's HTTP API. Payloads are appended to it.
    #[arg(long)]
    url: Option<String>,

    /// IR gateway address (host:port).
    #[arg(long)]
    ir_gateway: Option<String>,

    /// Emitter output on a multi-port IR gateway.
    #[arg(long)]
    ir_port: Option<u8>,

    /// Wait for an acknowledgement after each command.
    #[arg(long)]
    require_ack: bool,

    /// Inbound messages starting with this text acknowledge the in-flight
    /// command.
    #[arg(long)]
    ack_prefix: Option<String>,

    /// Gap between commands when not waiting for ACKs, in milliseconds.
    #[arg(long, default_value_t = 250)]
    delay_ms: u64,

    /// ACK wait before a resend, in milliseconds.
    #[arg(long, default_value_t = 4000)]
    ack_timeout_ms: u64,

    /// Resends before an unacknowledged command is dropped.
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Keep-alive poll sent on network links (escapes such as \r are decoded).
    #[arg(long)]
    keep_alive: Option<String>,

    /// Keep-alive period in seconds.
    #[arg(long, default_value_t = 30)]
    keep_alive_secs: u64,

    /// Suffix appended to stream payloads (escapes such as \r\n are decoded).
    #[arg(long, default_value = "!\\r\\n")]
    suffix: String,

    /// Prefix prepended to stream payloads.
    #[arg(long, default_value = "")]
    prefix: String,

    /// Inbound message delimiter. Defaults to any line ending.
    #[arg(long)]
    delimiter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue each argument as one command, then wait for the queues to drain.
    Send {
        /// Tier: p1, p2, or normal.
        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Seconds to wait for the queues to drain before giving up.
        #[arg(long, default_value_t = 30)]
        timeout: u64,

        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Read commands from stdin, one per line.
    Interactive,

    /// Print link events and inbound traffic without sending anything.
    Monitor {
        /// Seconds to watch (0 = until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },

    /// Print the link status once the transport settles.
    Status,

    /// Queue a burst of numbered commands and time how long they take to drain.
    Stress {
        #[arg(long, default_value_t = 100)]
        count: u32,

        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Command text; the sequence number is appended.
        #[arg(long, default_value = "PING")]
        command: String,
    },
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Decode `\r`, `\n`, `\t`, `\\`, and `\xNN` escapes.
fn unescape(s: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('r') => out.push(b'\r'),
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('\\') => out.push(b'\\'),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                let byte = u8::from_str_radix(&hex, 16)
                    .with_context(|| format!("invalid \\x escape: \\x{hex}"))?;
                out.push(byte);
            }
            Some(other) => bail!("unknown escape: \\{other}"),
            None => bail!("trailing backslash in {s:?}"),
        }
    }
    Ok(out)
}

/// Split an interactive line into an optional tier and the command text.
fn parse_line(line: &str) -> (Priority, &str) {
    if let Some((head, rest)) = line.split_once(' ') {
        if let Ok(tier) = head.parse::<Priority>() {
            return (tier, rest.trim_start());
        }
    }
    (Priority::Normal, line)
}

fn print_status(status: &LinkStatus) {
    println!("Transport:  {:?}", status.active);
    println!("Online:     {}", status.online);
    println!("Dispatch:   {:?}", status.state);
    println!(
        "Queued:     P1={} P2={} normal={}",
        status.depths[0], status.depths[1], status.depths[2]
    );
    println!("Retries:    {}", status.retries);
    match &status.in_flight {
        Some(name) => println!("In flight:  {name}"),
        None => println!("In flight:  -"),
    }
}

fn print_event(result: std::result::Result<LinkEvent, broadcast::error::RecvError>) -> bool {
    match result {
        Ok(event) => {
            println!("[event] {event:?}");
            true
        }
        Err(broadcast::error::RecvError::Lagged(n)) => {
            println!("[warning] missed {n} events (consumer too slow)");
            true
        }
        Err(broadcast::error::RecvError::Closed) => {
            println!("Event channel closed.");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Link construction
// ---------------------------------------------------------------------------

fn transport_settings(cli: &Cli) -> TransportSettings {
    TransportSettings {
        serial_path: cli.serial.clone(),
        tcp_addr: cli.tcp.clone(),
        listen_addr: cli.listen.clone(),
        base_url: cli.url.clone(),
        ir_gateway: cli.ir_gateway.clone(),
        ir_port: cli.ir_port,
        serial: cli.serial_settings.clone(),
        ..Default::default()
    }
}

fn bindings(cli: &Cli) -> Result<Vec<BindingKind>> {
    let mut bound = Vec::new();
    if cli.tcp.is_some() || cli.listen.is_some() {
        bound.push(BindingKind::Network);
    }
    if cli.url.is_some() {
        bound.push(BindingKind::Url);
    }
    if cli.serial.is_some() {
        bound.push(BindingKind::Serial);
    }
    if cli.ir_gateway.is_some() {
        bound.push(BindingKind::Ir);
    } else if cli.ir_port.is_some() {
        bail!("--ir-port requires --ir-gateway");
    }
    if bound.is_empty() {
        bail!("no transport given; use --serial, --tcp, --listen, --url, or --ir-gateway");
    }
    Ok(bound)
}

async fn open_link(cli: &Cli) -> Result<LinkHandle> {
    let bound = bindings(cli)?;
    if cli.require_ack && cli.ack_prefix.is_none() {
        bail!("--require-ack needs --ack-prefix to recognise acknowledgements");
    }

    let ack_prefix = cli.ack_prefix.as_ref().map(|p| p.as_bytes().to_vec());
    let handler = move |message: &[u8]| -> avlink::Result<MessageKind> {
        println!("<< {}", String::from_utf8_lossy(message));
        match &ack_prefix {
            Some(prefix) if message.starts_with(prefix) => Ok(MessageKind::Ack),
            _ => Ok(MessageKind::Unsolicited),
        }
    };

    let mut builder = LinkBuilder::new()
        .command_delay(Duration::from_millis(cli.delay_ms))
        .ack_timeout(Duration::from_millis(cli.ack_timeout_ms))
        .max_retries(cli.retries)
        .require_ack(cli.require_ack)
        .keep_alive_interval(Duration::from_secs(cli.keep_alive_secs))
        .framing(Framing::new(unescape(&cli.prefix)?, unescape(&cli.suffix)?))
        .network_mode(if cli.listen.is_some() {
            NetworkMode::Server
        } else {
            NetworkMode::Client
        })
        .handler(handler);

    if let Some(keep_alive) = &cli.keep_alive {
        builder = builder.keep_alive_command(Bytes::from(unescape(keep_alive)?));
    }
    if let Some(delimiter) = &cli.delimiter {
        builder = builder.delimiter(Delimiter::Sequence(Bytes::from(unescape(delimiter)?)));
    }
    for binding in bound {
        builder = builder.bind(binding);
    }

    let factory = TransportFactory::new(transport_settings(cli));
    builder
        .spawn(Box::new(factory))
        .await
        .context("failed to start link")
}

/// Poll until every queue is empty and nothing is in flight.
async fn wait_drained(link: &LinkHandle, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let status = link.status().await?;
        if status.depths.iter().all(|d| *d == 0) && status.in_flight.is_none() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            print_status(&status);
            bail!("queues did not drain within {}s", timeout.as_secs());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_send(link: &LinkHandle, tier: Priority, commands: &[String], timeout: u64) -> Result<()> {
    for command in commands {
        println!(">> [{tier}] {command}");
        link.send(tier, command.clone()).await?;
    }
    wait_drained(link, Duration::from_secs(timeout)).await
}

async fn cmd_interactive(link: &LinkHandle) -> Result<()> {
    let mut events = link.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Enter commands (\"p1 CMD\", \"p2 CMD\", or \"CMD\"); :status, :clear, :quit");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                match line {
                    "" => continue,
                    ":quit" | ":q" => break,
                    ":status" => print_status(&link.status().await?),
                    ":clear" => {
                        link.clear().await?;
                        println!("Queues cleared.");
                    }
                    _ => {
                        let (tier, command) = parse_line(line);
                        link.send(tier, command.to_string()).await?;
                    }
                }
            }
            event = events.recv() => {
                if !print_event(event) {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn cmd_monitor(link: &LinkHandle, duration_secs: u64) -> Result<()> {
    let mut events = link.subscribe();
    println!("Monitoring link events (Ctrl-C to stop)...");

    let deadline = (duration_secs > 0).then(|| Instant::now() + Duration::from_secs(duration_secs));

    loop {
        let remaining = match deadline {
            Some(dl) => {
                let remaining = dl.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    println!("Monitor duration elapsed.");
                    break;
                }
                remaining
            }
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            result = tokio::time::timeout(remaining, events.recv()) => match result {
                Ok(event) => {
                    if !print_event(event) {
                        break;
                    }
                }
                Err(_) => {
                    if deadline.is_some() {
                        println!("Monitor duration elapsed.");
                        break;
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted.");
                break;
            }
        }
    }
    Ok(())
}

async fn cmd_status(link: &LinkHandle) -> Result<()> {
    // Give connect-time events a moment to land.
    tokio::time::sleep(Duration::from_millis(500)).await;
    print_status(&link.status().await?);
    Ok(())
}

async fn cmd_stress(link: &LinkHandle, count: u32, tier: Priority, command: &str) -> Result<()> {
    println!("Queueing {count} commands at {tier}...");
    let start = Instant::now();
    for seq in 1..=count {
        link.send(tier, format!("{command} {seq}")).await?;
    }
    wait_drained(link, Duration::from_secs(u64::from(count) * 10 + 10)).await?;
    let elapsed = start.elapsed();

    println!(
        "Drained {count} commands in {:.2}s ({:.1} ms/command)",
        elapsed.as_secs_f64(),
        elapsed.as_secs_f64() * 1000.0 / f64::from(count.max(1))
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let link = open_link(&cli).await?;

    let result = match &cli.command {
        Command::Send {
            priority,
            timeout,
            commands,
        } => cmd_send(&link, *priority, commands, *timeout).await,
        Command::Interactive => cmd_interactive(&link).await,
        Command::Monitor { duration } => cmd_monitor(&link, *duration).await,
        Command::Status => cmd_status(&link).await,
        Command::Stress {
            count,
            priority,
            command,
        } => cmd_stress(&link, *count, *priority, command).await,
    };

    link.shutdown().await.context("link did not shut down cleanly")?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_control_sequences() {
        assert_eq!(unescape("!\\r\\n").unwrap(), b"!\r\n");
        assert_eq!(unescape("\\x02PWR\\x03").unwrap(), b"\x02PWR\x03");
        assert_eq!(unescape("a\\\\b").unwrap(), b"a\\b");
        assert!(unescape("bad\\").is_err());
        assert!(unescape("\\q").is_err());
    }

    #[test]
    fn parse_line_tiers() {
        assert_eq!(parse_line("p1 MUTE ON"), (Priority::Urgent, "MUTE ON"));
        assert_eq!(parse_line("P2 OUT1 IN2"), (Priority::Elevated, "OUT1 IN2"));
        assert_eq!(parse_line("OUT1 IN2"), (Priority::Normal, "OUT1 IN2"));
        assert_eq!(parse_line("PWR"), (Priority::Normal, "PWR"));
    }

    #[test]
    fn bindings_follow_flags() {
        let cli = Cli::parse_from(["avlink-cli", "--tcp", "10.0.0.1:23", "--serial", "/dev/ttyS0", "status"]);
        assert_eq!(bindings(&cli).unwrap(), [BindingKind::Network, BindingKind::Serial]);

        let cli = Cli::parse_from(["avlink-cli", "status"]);
        assert!(bindings(&cli).is_err());

        let cli = Cli::parse_from(["avlink-cli", "--ir-port", "2", "status"]);
        assert!(bindings(&cli).is_err());
    }

    #[test]
    fn tcp_and_listen_conflict() {
        let result = Cli::try_parse_from(["avlink-cli", "--tcp", "a:1", "--listen", "b:2", "status"]);
        assert!(result.is_err());
    }
}
