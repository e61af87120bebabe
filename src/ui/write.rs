//! `block write`: reads a single object's bytes from stdin, chunks and
//! stores it, and prints the resulting [`crate::object::ObjectId`] to
//! stdout.

use camino::Utf8Path;
use clap::Args as ClapArgs;

use crate::errors::Result;
use crate::object::{ObjectWriter, WriterOptions};
use crate::splitter::SplitterKind;

#[derive(Debug, ClapArgs)]
pub struct Args {
    /// Pack group to write into.
    #[arg(long, default_value = "raw")]
    pub pack_group: String,

    /// One-character origin prefix for the resulting block ID(s).
    #[arg(long)]
    pub prefix: Option<char>,

    /// Target average chunk size in bytes for the content-defined splitter;
    /// rounded up to the next power of two.
    #[arg(long, default_value_t = 1 << 20)]
    pub avg_chunk_size: usize,
}

pub fn run(repository: &Utf8Path, password: &[u8], args: Args) -> Result<()> {
    let (block_manager, header) = super::open_repository(repository, password)?;

    let data = super::read_all_stdin().map_err(crate::errors::EngineError::IoError)?;

    let mut writer = ObjectWriter::new(
        block_manager,
        header.max_inline_content_length,
        WriterOptions {
            pack_group: args.pack_group,
            description: "block write".to_owned(),
            prefix: args.prefix,
            splitter_kind: SplitterKind::Buzhash(args.avg_chunk_size.next_power_of_two()),
        },
    );
    writer.write(&data)?;
    let oid = writer.result()?;

    println!("{oid}");
    Ok(())
}
