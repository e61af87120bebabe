mod common;

use anyhow::*;
use predicates::prelude::*;
use tempfile::tempdir;

use common::{cli_run, init_repo};

#[test]
fn listed_blocks_include_every_written_oid() -> Result<()> {
    let repo_dir = tempdir()?;
    let repo = repo_dir.path();
    init_repo(repo)?;

    // Force a real block (not inlined) by writing past the default inline
    // threshold, then check `block list` surfaces its block ID.
    let payload = vec![0x42u8; 2 * 1024 * 1024];
    let write_out = cli_run(repo)?
        .args(["block", "write"])
        .write_stdin(payload)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let oid = String::from_utf8(write_out)?.trim().to_owned();
    assert!(oid.starts_with('D') || oid.starts_with('L'));

    cli_run(repo)?
        .args(["block", "flush"])
        .assert()
        .success();

    cli_run(repo)?
        .args(["block", "list", "all"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty().not());

    repo_dir.close()?;
    Ok(())
}

#[test]
fn compact_with_a_zero_cutoff_still_leaves_data_readable() -> Result<()> {
    let repo_dir = tempdir()?;
    let repo = repo_dir.path();
    init_repo(repo)?;

    let payload = vec![0x7eu8; 2 * 1024 * 1024];
    let write_out = cli_run(repo)?
        .args(["block", "write"])
        .write_stdin(payload.clone())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let oid = String::from_utf8(write_out)?.trim().to_owned();

    cli_run(repo)?.args(["block", "flush"]).assert().success();

    cli_run(repo)?
        .args(["block", "compact", "--cutoff", "0s"])
        .assert()
        .success();

    let read_out = cli_run(repo)?
        .args(["block", "read", &oid])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(read_out, payload);

    repo_dir.close()?;
    Ok(())
}
