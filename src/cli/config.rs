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

use anyhow::{bail, Context};
use log::warn;
use std::ffi::OsStr;
use std::fs::OpenOptions;
use std::io::Read;
use std::path::Path;

/// One peer of an interface.
///
/// `ip` is always in CIDR form; bare addresses are widened to `/32` by the
/// loader. `public_key` is opaque key material, used only as the join key
/// against `wg show ... dump` records.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Peer {
    pub name: String,
    pub ip: String,
    pub public_key: String,
    pub pre_shared_key: Option<String>,
}

/// One interface configuration, loaded from `<name>.toml`.
///
/// The interface name is the stem of the config file name; it is not
/// declared inside the file.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Config {
    pub name: String,
    pub subnet: String,
    pub port: u16,
    pub private_key: String,
    pub mtu: Option<i64>,
    pub post_up_cmd: Option<String>,
    pub post_down_cmd: Option<String>,
    pub interface: Option<String>,
    pub peers: Vec<Peer>,
}

/// Read and parse an interface configuration from the file at `p`.
///
/// `print_warnings`: Print warnings to stderr directly instead of go through
/// the logger.
pub fn load_config_from_path(p: &Path, print_warnings: bool) -> anyhow::Result<Config> {
    let mut file = OpenOptions::new()
        .read(true)
        .open(p)
        .with_context(|| format!("failed to open config file '{}'", p.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match file.metadata() {
            Err(_) => (),
            Ok(m) => {
                if m.mode() & 0o004 != 0 {
                    if print_warnings {
                        eprintln!(
                            "[WARN  wgconf::cli::config] configuration file is world readable"
                        );
                    } else {
                        warn!("configuration file is world readable");
                    }
                }
            }
        }
    }
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .context("failed to read config file")?;

    let name = p
        .file_stem()
        .and_then(OsStr::to_str)
        .context("invalid config file name")?;
    let dir = p.parent().unwrap_or_else(|| Path::new("."));
    parse_config(name, dir, &contents, print_warnings)
}

/// Parse and validate an interface configuration.
///
/// `dir` is the directory `file:` key references are resolved against.
pub fn parse_config(
    name: &str,
    dir: &Path,
    contents: &str,
    print_warnings: bool,
) -> anyhow::Result<Config> {
    let root: toml::Value = toml::from_str(contents).context("failed to parse config file")?;

    let server = match root.get("server") {
        Some(v) => v.as_table().context("'server' must be a table")?,
        None => bail!("missing required key 'server'"),
    };

    let subnet = server
        .get("subnet")
        .context("missing required key 'subnet' in 'server'")?;
    let port = server
        .get("port")
        .context("missing required key 'port' in 'server'")?;
    let private_key = server
        .get("private-key")
        .context("missing required key 'private-key' in 'server'")?;

    let port = port.as_integer().context("'port' must be an integer")?;
    if port < 1 || port > 65535 {
        bail!("'port' must be between 1 and 65535");
    }
    let port = port as u16;

    let mtu = match server.get("mtu") {
        Some(v) => Some(v.as_integer().context("'mtu' must be an integer")?),
        None => None,
    };

    let subnet = match subnet.as_str() {
        Some(s) if is_ipv4_cidr(s, true) => s.to_string(),
        _ => bail!("invalid 'subnet' specification; expected an IPv4 subnet in CIDR notation"),
    };

    let mut peers = Vec::new();
    match root.get("peer") {
        None => {
            if print_warnings {
                eprintln!("[WARN  wgconf::cli::config] no peers specified");
            } else {
                warn!("no peers specified");
            }
        }
        Some(v) => {
            let table = v.as_table().context("invalid type of peer list")?;
            for (peer_name, pcfg) in table {
                peers.push(parse_peer(peer_name, dir, pcfg)?);
            }
        }
    }

    Ok(Config {
        name: name.to_string(),
        subnet,
        port,
        private_key: match private_key.as_str() {
            Some(k) => read_key(dir, k)?,
            None => bail!("'private-key' must be a string"),
        },
        mtu,
        post_up_cmd: optional_string(server, "post-up")?,
        post_down_cmd: optional_string(server, "post-down")?,
        interface: optional_string(server, "interface")?,
        peers,
    })
}

fn parse_peer(name: &str, dir: &Path, value: &toml::Value) -> anyhow::Result<Peer> {
    let pcfg = value
        .as_table()
        .with_context(|| format!("invalid specification for peer '{}'", name))?;

    let public_key = match pcfg.get("public-key") {
        Some(v) => v
            .as_str()
            .with_context(|| format!("'public-key' for peer '{}' must be a string", name))?,
        None => bail!("missing required key 'public-key' for peer '{}'", name),
    };
    let ip = match pcfg.get("ip") {
        Some(v) => v,
        None => bail!("missing required key 'ip' for peer '{}'", name),
    };

    let ip = match ip.as_str() {
        Some(s) if is_ipv4_cidr(s, false) => s,
        _ => bail!("invalid IP address for peer '{}'", name),
    };
    // Bare addresses become host routes.
    let ip = if ip.contains('/') {
        ip.to_string()
    } else {
        format!("{}/32", ip)
    };

    let pre_shared_key = match pcfg.get("pre-shared-key") {
        Some(v) => {
            let k = v
                .as_str()
                .with_context(|| format!("'pre-shared-key' for peer '{}' must be a string", name))?;
            Some(read_key(dir, k)?)
        }
        None => None,
    };

    Ok(Peer {
        name: name.to_string(),
        ip,
        public_key: read_key(dir, public_key)?,
        pre_shared_key,
    })
}

fn optional_string(table: &toml::value::Table, key: &str) -> anyhow::Result<Option<String>> {
    match table.get(key) {
        Some(v) => Ok(Some(
            v.as_str()
                .with_context(|| format!("'{}' must be a string", key))?
                .to_string(),
        )),
        None => Ok(None),
    }
}

/// Resolve `file:` key indirection. Plain values are used verbatim; a
/// `file:<path>` value is replaced by the trimmed contents of `<path>`,
/// resolved relative to `dir`.
fn read_key(dir: &Path, value: &str) -> anyhow::Result<String> {
    match value.strip_prefix("file:") {
        Some(path) => {
            let path = dir.join(path);
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read key file '{}'", path.display()))?;
            Ok(contents.trim().to_string())
        }
        None => Ok(value.to_string()),
    }
}

// Shape check only: 1-3 digit octets and a digit prefix length. Octet and
// prefix ranges are left to the daemon.
fn is_dotted_quad(s: &str) -> bool {
    let mut octets = 0;
    for octet in s.split('.') {
        if octet.is_empty() || octet.len() > 3 || !octet.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        octets += 1;
    }
    octets == 4
}

fn is_ipv4_cidr(s: &str, prefix_required: bool) -> bool {
    match s.split_once('/') {
        Some((ip, prefix)) => {
            is_dotted_quad(ip) && !prefix.is_empty() && prefix.bytes().all(|b| b.is_ascii_digit())
        }
        None => !prefix_required && is_dotted_quad(s),
    }
}

impl Config {
    /// Render to wg-quick configuration text. Pure; writing the result out
    /// is the caller's business.
    pub fn render(&self) -> String {
        let mut lines = vec!["[Interface]".to_string()];
        lines.push(format!("Address = {}", self.subnet));
        lines.push("SaveConfig = false".to_string());
        lines.push(format!("ListenPort = {}", self.port));
        lines.push(format!("PrivateKey = {}", self.private_key));
        if let Some(mtu) = self.mtu {
            lines.push(format!("MTU = {}", mtu));
        }

        if let (Some(up), Some(down)) = (&self.post_up_cmd, &self.post_down_cmd) {
            lines.push(format!("PostUp = {}", up));
            lines.push(format!("PostDown = {}", down));
        } else if let Some(uplink) = &self.interface {
            lines.push(format!(
                "PostUp = iptables -I FORWARD 1 -i {} -j ACCEPT; \
                 iptables -t nat -I POSTROUTING 1 -o {} -j MASQUERADE",
                self.name, uplink
            ));
            lines.push(format!(
                "PostDown = iptables -D FORWARD -i {} -j ACCEPT; \
                 iptables -t nat -D POSTROUTING -o {} -j MASQUERADE",
                self.name, uplink
            ));
        }
        lines.push(String::new());

        for peer in &self.peers {
            lines.push("[Peer]".to_string());
            lines.push(format!("AllowedIPs = {}", peer.ip));
            lines.push(format!("PublicKey = {}", peer.public_key));
            if let Some(psk) = &peer.pre_shared_key {
                lines.push(format!("PresharedKey = {}", psk));
            }
            lines.push(String::new());
        }

        lines.join("\n")
    }

    /// Find a peer by public key. First match wins.
    pub fn lookup_peer(&self, public_key: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.public_key == public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EXAMPLE_CONFIG: &str = r##"[server]
subnet = "10.11.0.1/24"
port = 51820
private-key = "SERVER_PRIVATE_KEY"
mtu = 1400
interface = "eth0"

[peer.alice]
public-key = "ALICE_PUBLIC_KEY"
ip = "10.11.0.2"

[peer.bob]
public-key = "BOB_PUBLIC_KEY"
ip = "10.11.0.3/32"
pre-shared-key = "BOB_PSK"
"##;

    fn parse(contents: &str) -> anyhow::Result<Config> {
        parse_config("wg0", Path::new("."), contents, true)
    }

    #[test]
    fn parses_example_config() {
        let config = parse(EXAMPLE_CONFIG).unwrap();
        assert_eq!(config.name, "wg0");
        assert_eq!(config.subnet, "10.11.0.1/24");
        assert_eq!(config.port, 51820);
        assert_eq!(config.private_key, "SERVER_PRIVATE_KEY");
        assert_eq!(config.mtu, Some(1400));
        assert_eq!(config.interface.as_deref(), Some("eth0"));
        assert_eq!(config.peers.len(), 2);

        // Bare addresses are widened to host routes; source order is kept.
        assert_eq!(config.peers[0].name, "alice");
        assert_eq!(config.peers[0].ip, "10.11.0.2/32");
        assert_eq!(config.peers[0].pre_shared_key, None);
        assert_eq!(config.peers[1].name, "bob");
        assert_eq!(config.peers[1].ip, "10.11.0.3/32");
        assert_eq!(config.peers[1].pre_shared_key.as_deref(), Some("BOB_PSK"));
    }

    #[test]
    fn missing_server_section() {
        let err = parse("[peer.a]\npublic-key = \"k\"\nip = \"10.0.0.1\"\n").unwrap_err();
        assert!(err.to_string().contains("missing required key 'server'"));
    }

    #[test]
    fn missing_server_keys() {
        let err = parse("[server]\nport = 1\nprivate-key = \"k\"\n").unwrap_err();
        assert!(err.to_string().contains("'subnet'"));

        let err = parse("[server]\nsubnet = \"10.0.0.0/24\"\nprivate-key = \"k\"\n").unwrap_err();
        assert!(err.to_string().contains("'port'"));

        let err = parse("[server]\nsubnet = \"10.0.0.0/24\"\nport = 1\n").unwrap_err();
        assert!(err.to_string().contains("'private-key'"));
    }

    #[test]
    fn port_validation() {
        let config = "[server]\nsubnet = \"10.0.0.0/24\"\nport = \"51820\"\nprivate-key = \"k\"\n";
        let err = parse(config).unwrap_err();
        assert!(err.to_string().contains("'port' must be an integer"));

        for port in ["0", "65536", "-1"] {
            let config = format!(
                "[server]\nsubnet = \"10.0.0.0/24\"\nport = {}\nprivate-key = \"k\"\n",
                port
            );
            let err = parse(&config).unwrap_err();
            assert!(err.to_string().contains("between 1 and 65535"));
        }
    }

    #[test]
    fn mtu_must_be_integer() {
        let config =
            "[server]\nsubnet = \"10.0.0.0/24\"\nport = 1\nprivate-key = \"k\"\nmtu = \"1400\"\n";
        let err = parse(config).unwrap_err();
        assert!(err.to_string().contains("'mtu' must be an integer"));
    }

    #[test]
    fn subnet_requires_prefix() {
        // A bare address must not silently default.
        let config = "[server]\nsubnet = \"10.0.0.0\"\nport = 1\nprivate-key = \"k\"\n";
        let err = parse(config).unwrap_err();
        assert!(err.to_string().contains("invalid 'subnet'"));

        for subnet in ["10.0.0/24", "10.0.0.0.0/24", "10.0.0.1234/24", "10.0.0.0/", "wat/24"] {
            let config = format!(
                "[server]\nsubnet = \"{}\"\nport = 1\nprivate-key = \"k\"\n",
                subnet
            );
            assert!(parse(&config).is_err(), "subnet {:?} should be rejected", subnet);
        }
    }

    #[test]
    fn zero_peers_is_permitted() {
        let config = "[server]\nsubnet = \"10.0.0.0/24\"\nport = 1\nprivate-key = \"k\"\n";
        let config = parse(config).unwrap();
        assert!(config.peers.is_empty());
    }

    #[test]
    fn peer_validation() {
        let config = "[server]\nsubnet = \"10.0.0.0/24\"\nport = 1\nprivate-key = \"k\"\n\
                      [peer.a]\nip = \"10.0.0.2\"\n";
        let err = parse(config).unwrap_err();
        assert!(err.to_string().contains("'public-key' for peer 'a'"));

        let config = "[server]\nsubnet = \"10.0.0.0/24\"\nport = 1\nprivate-key = \"k\"\n\
                      [peer.a]\npublic-key = \"pk\"\n";
        let err = parse(config).unwrap_err();
        assert!(err.to_string().contains("'ip' for peer 'a'"));

        let config = "[server]\nsubnet = \"10.0.0.0/24\"\nport = 1\nprivate-key = \"k\"\n\
                      [peer.a]\npublic-key = \"pk\"\nip = \"not-an-ip\"\n";
        let err = parse(config).unwrap_err();
        assert!(err.to_string().contains("invalid IP address for peer 'a'"));
    }

    #[test]
    fn key_file_indirection() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("server.key")).unwrap();
        f.write_all(b"ABCDEF\n").unwrap();

        let config = "[server]\nsubnet = \"10.0.0.0/24\"\nport = 1\n\
                      private-key = \"file:server.key\"\n";
        let config = parse_config("wg0", dir.path(), config, true).unwrap();
        assert_eq!(config.private_key, "ABCDEF");
    }

    #[test]
    fn missing_key_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = "[server]\nsubnet = \"10.0.0.0/24\"\nport = 1\n\
                      private-key = \"file:no-such.key\"\n";
        let err = parse_config("wg0", dir.path(), config, true).unwrap_err();
        assert!(err.to_string().contains("no-such.key"));
    }

    #[test]
    fn name_comes_from_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpn9.toml");
        std::fs::write(
            &path,
            "[server]\nsubnet = \"10.0.0.0/24\"\nport = 1\nprivate-key = \"k\"\n",
        )
        .unwrap();

        let config = load_config_from_path(&path, true).unwrap();
        assert_eq!(config.name, "vpn9");
    }

    #[test]
    fn renders_expected_layout() {
        let config = Config {
            name: "wg0".into(),
            subnet: "10.11.0.1/24".into(),
            port: 51820,
            private_key: "PRIV".into(),
            mtu: Some(1400),
            post_up_cmd: None,
            post_down_cmd: None,
            interface: None,
            peers: vec![
                Peer {
                    name: "alice".into(),
                    ip: "10.11.0.2/32".into(),
                    public_key: "APK".into(),
                    pre_shared_key: None,
                },
                Peer {
                    name: "bob".into(),
                    ip: "10.11.0.3/32".into(),
                    public_key: "BPK".into(),
                    pre_shared_key: Some("BPSK".into()),
                },
            ],
        };
        assert_eq!(
            config.render(),
            "[Interface]\n\
             Address = 10.11.0.1/24\n\
             SaveConfig = false\n\
             ListenPort = 51820\n\
             PrivateKey = PRIV\n\
             MTU = 1400\n\
             \n\
             [Peer]\n\
             AllowedIPs = 10.11.0.2/32\n\
             PublicKey = APK\n\
             \n\
             [Peer]\n\
             AllowedIPs = 10.11.0.3/32\n\
             PublicKey = BPK\n\
             PresharedKey = BPSK\n"
        );
        // Rendering is deterministic.
        assert_eq!(config.render(), config.render());
    }

    #[test]
    fn renders_nat_rules_for_uplink() {
        let config = Config {
            name: "wg0".into(),
            subnet: "10.11.0.1/24".into(),
            port: 51820,
            private_key: "PRIV".into(),
            mtu: None,
            post_up_cmd: None,
            post_down_cmd: None,
            interface: Some("eth0".into()),
            peers: vec![],
        };
        let rendered = config.render();
        assert!(rendered.contains(
            "PostUp = iptables -I FORWARD 1 -i wg0 -j ACCEPT; \
             iptables -t nat -I POSTROUTING 1 -o eth0 -j MASQUERADE"
        ));
        assert!(rendered.contains(
            "PostDown = iptables -D FORWARD -i wg0 -j ACCEPT; \
             iptables -t nat -D POSTROUTING -o eth0 -j MASQUERADE"
        ));
        assert_eq!(rendered.matches("wg0").count(), 2);
        assert_eq!(rendered.matches("eth0").count(), 2);
    }

    #[test]
    fn explicit_hooks_suppress_nat_rules() {
        let config = Config {
            name: "wg0".into(),
            subnet: "10.11.0.1/24".into(),
            port: 51820,
            private_key: "PRIV".into(),
            mtu: None,
            post_up_cmd: Some("echo up".into()),
            post_down_cmd: Some("echo down".into()),
            interface: Some("eth0".into()),
            peers: vec![],
        };
        let rendered = config.render();
        assert!(rendered.contains("PostUp = echo up\n"));
        assert!(rendered.contains("PostDown = echo down\n"));
        assert!(!rendered.contains("iptables"));
    }

    #[test]
    fn no_hooks_without_uplink() {
        let config = Config {
            name: "wg0".into(),
            subnet: "10.11.0.1/24".into(),
            port: 51820,
            private_key: "PRIV".into(),
            mtu: None,
            post_up_cmd: None,
            post_down_cmd: None,
            interface: None,
            peers: vec![],
        };
        let rendered = config.render();
        assert!(!rendered.contains("PostUp"));
        assert!(!rendered.contains("PostDown"));
    }

    #[test]
    fn peer_lookup_is_first_match() {
        let peer = |name: &str, key: &str| Peer {
            name: name.into(),
            ip: "10.0.0.2/32".into(),
            public_key: key.into(),
            pre_shared_key: None,
        };
        let config = Config {
            name: "wg0".into(),
            subnet: "10.0.0.1/24".into(),
            port: 1,
            private_key: "k".into(),
            mtu: None,
            post_up_cmd: None,
            post_down_cmd: None,
            interface: None,
            peers: vec![peer("a", "KEY1"), peer("b", "KEY1"), peer("c", "KEY2")],
        };
        assert_eq!(config.lookup_peer("KEY1").unwrap().name, "a");
        assert_eq!(config.lookup_peer("KEY2").unwrap().name, "c");
        assert!(config.lookup_peer("KEY3").is_none());
    }
}
