use anyhow::Result;

use super::Globals;

/// Print the configuration after file and environment overrides.
pub fn run_config(globals: &Globals) -> Result<()> {
    let config = globals.load_config()?;
    print!("{}", config.to_toml()?);
    Ok(())
}
