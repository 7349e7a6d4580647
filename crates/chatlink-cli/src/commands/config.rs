use anyhow::Result;
use chatlink_core::ChatlinkConfig;
use colored::Colorize;
use std::path::Path;

use crate::cli::ConfigCommands;

pub fn run(path: Option<&Path>, command: ConfigCommands) -> Result<()> {
    let config = ChatlinkConfig::load(path)?;
    match command {
        ConfigCommands::Show => print!("{}", config.to_toml()?),
        ConfigCommands::Check => println!("{} configuration is valid", "✓".green()),
    }
    Ok(())
}
