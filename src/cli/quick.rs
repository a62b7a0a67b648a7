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

//! Bring interfaces up and down through the external `wg-quick` tool.

use crate::cli::config;
use anyhow::{anyhow, bail, Context};
use log::info;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const WG_QUICK_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub async fn up(config_dir: &Path, interface: &str) -> anyhow::Result<()> {
    let path = config_dir.join(format!("{}.toml", interface));
    if !path.exists() {
        bail!("config file '{}' does not exist", path.display());
    }

    info!("loading {}", path.display());
    let config = config::load_config_from_path(&path, false)?;

    let conf_path = config_dir.join(format!("{}.conf", interface));
    info!("writing WireGuard config to {}", conf_path.display());
    write_wg_conf(&conf_path, &config.render())?;

    if interface_exists(interface).await {
        info!("bringing down existing interface");
        wg_quick("down", interface).await?;
    }

    info!("bringing interface online");
    wg_quick("up", interface).await?;
    info!("done");
    Ok(())
}

pub async fn down(interface: &str) -> anyhow::Result<()> {
    if !interface_exists(interface).await {
        bail!("interface '{}' does not exist", interface);
    }

    info!("bringing interface down");
    wg_quick("down", interface).await?;
    info!("done");
    Ok(())
}

pub async fn restart(config_dir: &Path, interface: &str) -> anyhow::Result<()> {
    down(interface).await?;
    up(config_dir, interface).await
}

// The rendered config holds private key material, so it must not be group
// or world readable.
fn write_wg_conf(path: &Path, contents: &str) -> anyhow::Result<()> {
    if path.exists() {
        info!("removing existing config");
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove '{}'", path.display()))?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create '{}'", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("failed to write '{}'", path.display()))?;
    Ok(())
}

pub(crate) async fn interface_exists(name: &str) -> bool {
    let check = Command::new("ip")
        .args(&["link", "show", "dev", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    match timeout(PROBE_TIMEOUT, check).await {
        Ok(Ok(status)) => status.success(),
        _ => false,
    }
}

async fn wg_quick(op: &str, interface: &str) -> anyhow::Result<()> {
    let status = timeout(
        WG_QUICK_TIMEOUT,
        Command::new("wg-quick")
            .arg(op)
            .arg(interface)
            .kill_on_drop(true)
            .status(),
    )
    .await
    .map_err(|_| anyhow!("wg-quick {} {} timed out", op, interface))?
    .context("failed to run wg-quick")?;
    if !status.success() {
        bail!("wg-quick {} {} failed with {}", op, interface, status);
    }
    Ok(())
}
