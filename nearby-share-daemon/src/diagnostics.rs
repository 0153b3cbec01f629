//! Command Line and Logging
//!
//! Command-line interface, logging setup and the human-readable formatting
//! used by the client subcommands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nearby_share_protocol::{
    FailureKind, HistoryRecord, PeerDevice, SessionStatus, TransferSession,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Nearby Share command-line interface
#[derive(Parser, Debug)]
#[command(name = "nearby-share-daemon")]
#[command(about = "Offline file sharing with nearby devices", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Show timestamps in logs
    #[arg(long, default_value = "true", global = true)]
    pub timestamps: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand (runs the daemon when omitted)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Daemon and client commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Advertise, discover and receive until interrupted
    Serve {
        /// Accept every incoming offer
        #[arg(long)]
        auto_accept: bool,
    },

    /// Discover for a while and list nearby devices
    Peers {
        /// Seconds to listen before printing
        #[arg(short, long, default_value = "5")]
        wait: u64,
    },

    /// Send files to a nearby device
    Send {
        /// Device ID or display name
        #[arg(short, long)]
        peer: String,

        /// Seconds to wait for the device to appear
        #[arg(short, long, default_value = "10")]
        wait: u64,

        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show completed, failed and cancelled transfers
    History {
        /// Show at most this many entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Print the effective configuration
    DumpConfig,
}

/// Initialize logging based on CLI configuration
///
/// Logs go to stderr so client output on stdout stays clean.
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );

    Ok(())
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit_index = 0;

    while value >= 1024.0 && unit_index < UNITS.len() - 1 {
        value /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit_index])
    }
}

/// Format a remaining-time estimate as `m:ss`, or `--:--` when unknown
pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(eta) => {
            let secs = eta.as_secs();
            format!("{}:{:02}", secs / 60, secs % 60)
        }
        None => "--:--".to_string(),
    }
}

pub fn describe_failure(failure: &FailureKind) -> String {
    match failure {
        FailureKind::Transport(reason) => format!("connection lost ({})", reason),
        FailureKind::HandshakeRejected(reason) => format!("declined by peer ({})", reason),
        FailureKind::HandshakeTimeout => "peer did not answer".to_string(),
        FailureKind::Integrity { file } => format!("file {} failed integrity checks", file + 1),
        FailureKind::Timeout(reason) => format!("timed out ({})", reason),
        FailureKind::Protocol(reason) => format!("protocol error ({})", reason),
        FailureKind::Storage(reason) => format!("storage error ({})", reason),
    }
}

/// One row of the peer table
pub fn peer_line(peer: &PeerDevice) -> String {
    format!(
        "{:<36}  {:<24}  {:>3}  {}",
        peer.id,
        peer.display_name,
        peer.signal_strength,
        peer.proximity_bucket.as_str()
    )
}

/// One-line progress summary
pub fn session_line(session: &TransferSession) -> String {
    let mut line = format!(
        "[{}] {} / {} ({:.0}%)",
        session.status,
        format_bytes(session.bytes_transferred_total),
        format_bytes(session.total_bytes),
        session.progress() * 100.0
    );

    if session.status == SessionStatus::Transferring {
        line.push_str(&format!(
            "  {}/s  eta {}",
            format_bytes(session.instantaneous_speed as u64),
            format_eta(session.eta)
        ));
    }
    if let Some(failure) = &session.failure {
        line.push_str(&format!("  {}", describe_failure(failure)));
    }
    line
}

/// One row of the history table
pub fn history_line(record: &HistoryRecord) -> String {
    let names: Vec<&str> = record.files.iter().map(|f| f.name.as_str()).collect();
    let mut line = format!(
        "{}  {:<8}  {:<24}  {:<10}  {:>10}  {}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        format!("{:?}", record.direction).to_lowercase(),
        record.peer_name,
        record.final_status.as_str(),
        format_bytes(record.total_size),
        names.join(", ")
    );
    if let Some(failure) = &record.failure {
        line.push_str(&format!("  ({})", describe_failure(failure)));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearby_share_protocol::{
        FileDescriptor, FileHandle, ProximityBucket, Role, SessionId,
    };

    fn peer() -> PeerDevice {
        PeerDevice {
            id: "peer_1".to_string(),
            display_name: "Laptop".to_string(),
            signal_strength: 80,
            proximity_bucket: ProximityBucket::Immediate,
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(None), "--:--");
        assert_eq!(format_eta(Some(Duration::from_secs(75))), "1:15");
        assert_eq!(format_eta(Some(Duration::from_millis(900))), "0:00");
    }

    #[test]
    fn test_peer_line() {
        let line = peer_line(&peer());
        assert!(line.starts_with("peer_1"));
        assert!(line.contains("Laptop"));
        assert!(line.ends_with(ProximityBucket::Immediate.as_str()));
    }

    #[test]
    fn test_session_line_reports_failure() {
        let files = vec![FileDescriptor::new(FileHandle::new("a.txt"), "a.txt", 2048)];
        let mut session = TransferSession::new(SessionId::new(), Role::Sender, peer(), files);
        session.advance(SessionStatus::Connecting).unwrap();
        session.fail(FailureKind::HandshakeTimeout).unwrap();

        let line = session_line(&session);
        assert!(line.starts_with("[failed]"));
        assert!(line.contains("2.00 KB"));
        assert!(line.contains("peer did not answer"));
    }

    #[test]
    fn test_history_line() {
        let files = vec![FileDescriptor::new(FileHandle::new("a.txt"), "a.txt", 2048)];
        let mut session = TransferSession::new(SessionId::new(), Role::Sender, peer(), files);
        session.advance(SessionStatus::Connecting).unwrap();
        session.fail(FailureKind::HandshakeTimeout).unwrap();
        let record = HistoryRecord::from_session(&session).unwrap();

        let line = history_line(&record);
        let stamp = record.timestamp.format("%Y-%m-%d %H:%M:%S").to_string();
        assert!(line.starts_with(&stamp));
        assert!(line.contains("sent"));
        assert!(line.contains("Laptop"));
        assert!(line.contains("a.txt"));
        assert!(line.ends_with("(peer did not answer)"));
    }

    #[test]
    fn test_cli_parses_send() {
        let cli = Cli::parse_from([
            "nearby-share-daemon",
            "--log-level",
            "debug",
            "send",
            "--peer",
            "Laptop",
            "a.txt",
            "b.txt",
        ]);
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Some(Command::Send { peer, wait, files }) => {
                assert_eq!(peer, "Laptop");
                assert_eq!(wait, 10);
                assert_eq!(files.len(), 2);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_defaults_to_serve() {
        let cli = Cli::parse_from(["nearby-share-daemon"]);
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }
}
