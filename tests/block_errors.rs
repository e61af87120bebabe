mod common;

use anyhow::*;
use tempfile::tempdir;

use common::{cli_run, init_repo};

#[test]
fn reading_a_malformed_object_id_is_a_user_error() -> Result<()> {
    let repo_dir = tempdir()?;
    let repo = repo_dir.path();
    init_repo(repo)?;

    cli_run(repo)?
        .args(["block", "read", "not-a-real-oid"])
        .assert()
        .failure()
        .code(1);

    repo_dir.close()?;
    Ok(())
}

#[test]
fn reading_an_unknown_but_well_formed_block_id_fails() -> Result<()> {
    let repo_dir = tempdir()?;
    let repo = repo_dir.path();
    init_repo(repo)?;

    // A plausible-looking but never-written direct block reference.
    let bogus = format!("D{}", "ab".repeat(32));
    cli_run(repo)?
        .args(["block", "read", &bogus])
        .assert()
        .failure();

    repo_dir.close()?;
    Ok(())
}

#[test]
fn opening_a_repository_with_the_wrong_password_fails() -> Result<()> {
    let repo_dir = tempdir()?;
    let repo = repo_dir.path();
    init_repo(repo)?;

    let bin_name = env!("CARGO_PKG_NAME");
    assert_cmd::Command::cargo_bin(bin_name)?
        .env("BLOCKPAK_PASSWORD", "definitely the wrong password")
        .arg("--repository")
        .arg(repo)
        .args(["block", "flush"])
        .assert()
        .failure();

    repo_dir.close()?;
    Ok(())
}
