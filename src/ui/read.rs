//! `block read <oid>`: resolves an object ID back into bytes on stdout.

use camino::Utf8Path;
use clap::Args as ClapArgs;

use crate::errors::Result;
use crate::object::{ObjectId, ObjectReader};

#[derive(Debug, ClapArgs)]
pub struct Args {
    /// Wire-format object ID, e.g. `D<hex>`, `L<hex>`, or `T<text>`.
    pub oid: String,
}

pub fn run(repository: &Utf8Path, password: &[u8], args: Args) -> Result<()> {
    let (block_manager, _header) = super::open_repository(repository, password)?;
    let oid: ObjectId = args.oid.parse()?;

    let reader = ObjectReader::new(block_manager);
    let bytes = reader.read_all(&oid)?;

    super::write_all_stdout(&bytes).map_err(crate::errors::EngineError::IoError)?;
    Ok(())
}
