// Copyright 2023 the wgconf authors

// This file is part of wgconf.

// wgconf is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// wgconf is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with wgconf.  If not, see <https://www.gnu.org/licenses/>.

use crate::cli::config::{self, Config};
use crate::cli::quick;
use ansi_term::{Color, Style};
use anyhow::{bail, Context};
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tokio::time::timeout;

const DUMP_TIMEOUT: Duration = Duration::from_secs(3);

/// One peer line of `wg show <name> dump`, past the interface header line.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DumpRecord {
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ips: String,
    pub last_handshake: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Print a status report for every configured interface in `config_dir`,
/// or only `interface` if one is given.
///
/// A dump failure for one interface is reported and does not stop the
/// report for the others. A broken config file, on the other hand, is
/// fatal: that is an authoring error the operator has to fix.
pub async fn show(
    config_dir: &Path,
    interface: Option<&str>,
    show_keys: bool,
) -> anyhow::Result<()> {
    let mut paths = Vec::new();
    let read_dir = config_dir.read_dir().with_context(|| {
        format!("failed to read config directory '{}'", config_dir.display())
    })?;
    for entry in read_dir {
        let path = entry?.path();
        if path.extension() == Some(OsStr::new("toml")) {
            paths.push(path);
        }
    }
    paths.sort();

    for path in paths {
        let name = match path.file_stem().and_then(OsStr::to_str) {
            Some(name) => name,
            None => continue,
        };
        if let Some(filter) = interface {
            if name != filter {
                continue;
            }
        }

        let config = config::load_config_from_path(&path, true)?;
        if !quick::interface_exists(&config.name).await {
            print_interface_down(&config.name);
            continue;
        }

        let dump = match timeout(DUMP_TIMEOUT, dump_interface(&config.name)).await {
            Ok(r) => r,
            Err(_) => Err(anyhow::anyhow!("wg show {} dump timed out", config.name)),
        };
        report_interface(&config, dump, show_keys);
    }
    Ok(())
}

async fn dump_interface(name: &str) -> anyhow::Result<String> {
    let output = Command::new("wg")
        .args(&["show", name, "dump"])
        .kill_on_drop(true)
        .output()
        .await
        .context("failed to run wg")?;
    if !output.status.success() {
        bail!(
            "wg show {} dump failed: {}",
            name,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Print the report for one interface from its dump output. A failed dump
/// is reported to stderr and never propagates, so one broken interface
/// cannot hide the status of the others. Returns whether the peer report
/// was printed.
fn report_interface(config: &Config, dump: anyhow::Result<String>, show_keys: bool) -> bool {
    print_interface_header(config);
    match dump.and_then(|dump| print_peers(config, &dump, show_keys)) {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Error while getting status of '{}': {:#}", config.name, e);
            false
        }
    }
}

fn print_peers(config: &Config, dump: &str, show_keys: bool) -> anyhow::Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    // The first line is the local interface record.
    for line in dump.lines().skip(1) {
        let record = parse_dump_line(line)?;
        print_peer(config, &record, now, show_keys);
    }
    Ok(())
}

// Apply `style` only when stdout is a terminal.
fn tty_style(style: Style) -> Style {
    if atty::is(atty::Stream::Stdout) {
        style
    } else {
        Style::new()
    }
}

fn print_interface_header(config: &Config) {
    let bold = tty_style(Style::new().bold());
    let green = tty_style(Color::Green.bold());
    let yellow = tty_style(Color::Yellow.normal());
    println!(
        "{} {}",
        bold.paint("interface"),
        green.paint(config.name.as_str())
    );
    println!(
        "  {}  {}",
        bold.paint("address:"),
        yellow.paint(config.subnet.as_str())
    );
}

fn print_interface_down(name: &str) {
    let bold = tty_style(Style::new().bold());
    let green = tty_style(Color::Green.bold());
    let red = tty_style(Color::Red.bold());
    println!(
        "{} {}: {}",
        bold.paint("interface"),
        green.paint(name),
        red.paint("down")
    );
}

fn print_peer(config: &Config, record: &DumpRecord, now: u64, show_keys: bool) {
    let bold = tty_style(Style::new().bold());
    let yellow = tty_style(Color::Yellow.normal());
    let purple = tty_style(Color::Purple.normal());
    let grey = tty_style(Color::Fixed(8).normal());

    let (name, known) = match config.lookup_peer(&record.public_key) {
        Some(peer) => (peer.name.as_str(), true),
        None => ("unknown", false),
    };
    let name_style = tty_style(if known {
        Color::Blue.bold()
    } else {
        Color::Red.bold()
    });

    println!(
        "  {} {} ({})",
        bold.paint("peer"),
        name_style.paint(name),
        yellow.paint(display_ip(&record.allowed_ips))
    );
    if show_keys {
        println!(
            "    {}  {}",
            bold.paint("public-key:"),
            purple.paint(record.public_key.as_str())
        );
    }

    if record.endpoint == "(none)" {
        println!("    {}        {}", bold.paint("conn:"), grey.paint("none"));
    } else {
        match split_endpoint(&record.endpoint) {
            (host, Some(port)) => println!(
                "    {}        {}{}",
                bold.paint("conn:"),
                purple.paint(host),
                grey.paint(format!(":{}", port))
            ),
            (host, None) => println!(
                "    {}        {}",
                bold.paint("conn:"),
                purple.paint(host)
            ),
        }
    }

    // A zero handshake timestamp means the peer was never contacted.
    if record.last_handshake == 0 {
        println!("    {}        {}", bold.paint("last:"), grey.paint("never"));
    } else {
        debug_assert!(now >= record.last_handshake);
        let diff = now.saturating_sub(record.last_handshake);
        println!(
            "    {}        {} {}",
            bold.paint("last:"),
            purple.paint(format_relative_time(diff)),
            bold.paint("ago")
        );
    }

    println!(
        "    {}     {} {}, {} {}",
        bold.paint("traffic:"),
        purple.paint(format_bytes(record.tx_bytes)),
        bold.paint("sent"),
        purple.paint(format_bytes(record.rx_bytes)),
        bold.paint("received")
    );
    println!();
}

/// Parse one peer line of dump output: eight whitespace-separated fields of
/// which we keep the public key, endpoint, allowed IPs, handshake timestamp
/// and the two byte counters.
pub fn parse_dump_line(line: &str) -> anyhow::Result<DumpRecord> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 8 {
        bail!("expected 8 fields in dump line, got {}", fields.len());
    }
    Ok(DumpRecord {
        public_key: fields[0].to_string(),
        endpoint: fields[2].to_string(),
        allowed_ips: fields[3].to_string(),
        last_handshake: fields[4]
            .parse()
            .context("invalid last-handshake timestamp in dump line")?,
        rx_bytes: fields[5]
            .parse()
            .context("invalid received byte count in dump line")?,
        tx_bytes: fields[6]
            .parse()
            .context("invalid sent byte count in dump line")?,
    })
}

// Host routes lose the /32 for display only.
pub fn display_ip(ip: &str) -> &str {
    ip.strip_suffix("/32").unwrap_or(ip)
}

// Endpoints are `host:port`; the port is de-emphasized when printing.
fn split_endpoint(endpoint: &str) -> (&str, Option<&str>) {
    match endpoint.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (endpoint, None),
    }
}

/// Format an elapsed time in seconds with the dominant unit first and one
/// secondary unit when it adds resolution.
pub fn format_relative_time(diff: u64) -> String {
    let days = diff / 86400;
    let rest = diff % 86400;
    let hours = rest / 3600;
    let rest = rest % 3600;
    let minutes = rest / 60;
    let seconds = rest % 60;

    if days > 0 {
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Format a byte count with 1024-based scaling and one decimal place.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}b", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}k", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1}M", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1}G", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
