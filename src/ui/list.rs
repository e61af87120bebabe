//! `block list [all|logical|packs|packed|nonpacked]`: dumps the blocks the
//! manager currently knows about, one per line.

use camino::Utf8Path;
use clap::Args as ClapArgs;

use crate::errors::Result;

#[derive(Debug, ClapArgs)]
pub struct Args {
    /// `all`, `logical`, `packs`, `packed`, or `nonpacked`.
    #[arg(default_value = "all")]
    pub kind: String,

    /// Only list blocks whose ID starts with this prefix.
    #[arg(long, default_value = "")]
    pub prefix: String,
}

pub fn run(repository: &Utf8Path, password: &[u8], args: Args) -> Result<()> {
    let (block_manager, _header) = super::open_repository(repository, password)?;
    let blocks = block_manager.list_blocks(&args.prefix, &args.kind)?;
    for b in blocks {
        println!("{}\t{}\t{}", b.block_id, b.pack_group, b.size);
    }
    Ok(())
}
