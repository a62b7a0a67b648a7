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

use crate::cli::{config, quick, show};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "wgconf",
    version,
    about = "Manage WireGuard interfaces from declarative TOML configs"
)]
struct Options {
    /// Directory to look for interface configs in
    #[clap(
        short,
        long,
        global = true,
        value_name = "DIR",
        default_value = "/etc/wireguard"
    )]
    dir: PathBuf,

    /// Set logging (env_logger)
    #[clap(long, global = true, env = "RUST_LOG", value_name = "FILTER")]
    log: Option<String>,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Bring up an interface
    Up {
        #[clap(value_name = "INTERFACE")]
        interface: String,
    },
    /// Bring down an interface
    Down {
        #[clap(value_name = "INTERFACE")]
        interface: String,
    },
    /// Restart (down then up) an interface
    Restart {
        #[clap(value_name = "INTERFACE")]
        interface: String,
    },
    /// Show the status of configured interfaces
    Status {
        /// Show only this interface
        #[clap(value_name = "INTERFACE")]
        interface: Option<String>,

        /// Show peer public keys
        #[clap(short = 'k', long)]
        show_keys: bool,
    },
    /// Check configuration file validity
    Check {
        #[clap(value_name = "INTERFACE")]
        interface: String,

        /// Print the rendered wg-quick config
        #[clap(long)]
        print: bool,
    },
}

impl Options {
    async fn run(self) -> anyhow::Result<()> {
        match self.cmd {
            Cmd::Up { interface } => quick::up(&self.dir, &interface).await,
            Cmd::Down { interface } => quick::down(&interface).await,
            Cmd::Restart { interface } => quick::restart(&self.dir, &interface).await,
            Cmd::Status {
                interface,
                show_keys,
            } => show::show(&self.dir, interface.as_deref(), show_keys).await,
            Cmd::Check { interface, print } => {
                let path = self.dir.join(format!("{}.toml", interface));
                let config = config::load_config_from_path(&path, true)?;
                if print {
                    print!("{}", config.render());
                }
                Ok(())
            }
        }
    }
}

pub fn real_main() -> anyhow::Result<()> {
    let options = Options::parse();

    let log = options.log.as_deref().unwrap_or("info");
    std::env::set_var("RUST_LOG", log);
    let mut builder = env_logger::Builder::from_default_env();
    builder.format_timestamp(None);
    builder.init();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(options.run())
}
