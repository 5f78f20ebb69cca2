//! Config command

use anyhow::{Context, Result};
use harden_common::Config;

pub fn run(config: &Config) -> Result<i32> {
    let text = toml::to_string_pretty(config).context("Failed to serialize configuration")?;
    print!("{}", text);
    Ok(0)
}
