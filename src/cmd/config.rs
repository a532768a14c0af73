//! Configuration view: `ferry config`.

use std::path::Path;

use anyhow::Result;

use ferry::config::FerryConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config: &FerryConfig, source: Option<&Path>, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            match source {
                Some(path) => println!("# Config file: {}", path.display()),
                None => println!("# No config file found; defaults with env/CLI overrides"),
            }
            print!("{}", config.to_toml()?);
        }
    }
    Ok(())
}
