#![allow(dead_code)]

use std::path::Path;

use anyhow::*;
use assert_cmd::Command;

/// A `blockpak --repository <dir> -vvv <...>` invocation, password supplied
/// via the env var the binary reads rather than a terminal prompt.
pub fn cli_run(repository: &Path) -> Result<Command> {
    let bin_name = env!("CARGO_PKG_NAME");
    let mut cmd = Command::cargo_bin(bin_name)?;
    cmd.env("BLOCKPAK_PASSWORD", "correct horse battery staple");
    cmd.arg("--repository").arg(repository);
    cmd.arg("-vvv");
    Ok(cmd)
}

pub fn init_repo(repository: &Path) -> Result<()> {
    cli_run(repository)?.arg("init").assert().success();
    Ok(())
}
