//! CLI command implementations.

pub mod inspect;
pub mod pending;
pub mod reset_checkpoint;

use crmsync_engine::FileLocalStore;
use std::path::Path;

/// Opens an existing store; refuses to create one at a mistyped path.
pub fn open_store(path: &Path) -> Result<FileLocalStore, Box<dyn std::error::Error>> {
    if !FileLocalStore::exists(path) {
        return Err(format!("No store found at {:?}", path).into());
    }
    Ok(FileLocalStore::open(path)?)
}
