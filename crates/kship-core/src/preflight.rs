//! Checks that the external tools a run depends on are installed.

use crate::error::{DeployError, Result};

/// Fail with `MissingCommand` for the first program not found on `PATH`.
pub fn require_commands(programs: &[&str]) -> Result<()> {
    for program in programs {
        if which::which(program).is_err() {
            return Err(DeployError::MissingCommand(program.to_string()));
        }
    }
    Ok(())
}
