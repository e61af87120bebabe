//! `block flush`: seals any open packs and writes out the pending pack
//! index batch immediately, instead of waiting for the manager's own
//! flush-interval timer.

use camino::Utf8Path;
use clap::Args as ClapArgs;

use crate::errors::Result;

#[derive(Debug, ClapArgs)]
pub struct Args {}

pub fn run(repository: &Utf8Path, password: &[u8], _args: Args) -> Result<()> {
    let (block_manager, _header) = super::open_repository(repository, password)?;
    block_manager.flush()
}
