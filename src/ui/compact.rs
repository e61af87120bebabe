//! `block compact --cutoff <duration> [--mark-in-use <ids>]`: merges pack
//! indexes older than `cutoff` into one, optionally pruning entries for
//! blocks not named in `--mark-in-use`.

use std::collections::HashSet;
use std::str::FromStr;

use camino::Utf8Path;
use clap::Args as ClapArgs;

use crate::errors::{EngineError, Result};
use crate::formatter::BlockId;

#[derive(Debug, ClapArgs)]
pub struct Args {
    /// How far back to look, e.g. "10m", "2h", "3d" (jiff `Span` syntax).
    #[arg(long)]
    pub cutoff: String,

    /// If given, only these block IDs (and whatever they reference) survive
    /// compaction; anything else is pruned.
    #[arg(long = "mark-in-use")]
    pub mark_in_use: Vec<String>,
}

pub fn run(repository: &Utf8Path, password: &[u8], args: Args) -> Result<()> {
    let (block_manager, _header) = super::open_repository(repository, password)?;

    let span: jiff::Span = args
        .cutoff
        .parse()
        .map_err(|e| EngineError::UsageError(format!("bad --cutoff {:?}: {e}", args.cutoff)))?;
    let cutoff = jiff::Timestamp::now()
        .checked_sub(span)
        .map_err(|e| EngineError::UsageError(format!("--cutoff out of range: {e}")))?;

    let in_use = if args.mark_in_use.is_empty() {
        None
    } else {
        let mut set = HashSet::new();
        for id in &args.mark_in_use {
            set.insert(BlockId::from_str(id)?);
        }
        Some(set)
    };

    block_manager.compact_indexes(cutoff, in_use.as_ref())
}
