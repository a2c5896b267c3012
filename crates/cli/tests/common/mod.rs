//! Helpers for running the `fsw` binary

#![allow(dead_code)]

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;

/// Output of one `fsw` invocation
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `fsw` with `args` in `working_dir`
pub fn fsw(working_dir: impl AsRef<Path>, args: &[&str]) -> Result<CommandResult> {
    let output = Command::new(env!("CARGO_BIN_EXE_fsw"))
        .args(args)
        .current_dir(working_dir)
        .output()
        .context("Failed to execute fsw")?;

    Ok(CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Run `fsw` and fail with its output if it does not succeed
pub fn fsw_ok(working_dir: impl AsRef<Path>, args: &[&str]) -> Result<CommandResult> {
    let result = fsw(working_dir, args)?;
    if !result.success() {
        anyhow::bail!(
            "fsw failed (exit code: {}):\nArgs: {:?}\nStdout: {}\nStderr: {}",
            result.exit_code,
            args,
            result.stdout,
            result.stderr
        );
    }
    Ok(result)
}
