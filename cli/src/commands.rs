use std::fs::File;
use std::io::{Read, Write as _};
use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use thiserror::Error;

use simplefs_core::flash::ImageFile;
use simplefs_core::fs::{FsStatus, SimpleFs, ENTRY_SIZE};

use crate::args::FileRef;

/// Operations specific to this tool rather than to the filesystem itself:
/// bad addressing, a missing local file. Filesystem failures propagate
/// through as [`FsStatus`] and join these via `anyhow`.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Fs(#[from] FsStatus),
}

fn open_image(path: &Path) -> Result<SimpleFs<ImageFile>> {
    let image = ImageFile::open(path)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("opening image {}", path.display()))?;
    Ok(SimpleFs::new(image))
}

pub fn init(path: &Path, blocks: u16) -> Result<()> {
    let mut fs = open_image(path)?;
    fs.init(blocks).map_err(CliError::from)?;
    println!(
        "{} image initialized for {} blocks.",
        "ok:".green().bold(),
        blocks
    );
    Ok(())
}

pub fn mv(path: &Path, first_block: u16) -> Result<()> {
    let mut fs = open_image(path)?;
    fs.reindex(first_block).map_err(CliError::from)?;
    println!(
        "{} image reindexed starting at block {}.",
        "ok:".green().bold(),
        first_block
    );
    Ok(())
}

pub fn list(path: &Path, prefix: Option<&str>) -> Result<()> {
    let mut fs = open_image(path)?;
    println!("Start    Stop  Size Blck Name");
    println!("-----------------------------");
    let mut cursor = 0u16;
    let prefix_bytes = prefix.map(str::as_bytes);
    loop {
        match fs.list(cursor, prefix_bytes) {
            Ok((block, entry)) => {
                println!(
                    "${:04X} - ${:04X} {:5} {:4} {}",
                    entry.start,
                    entry.start.wrapping_add(entry.size),
                    entry.size,
                    entry.block,
                    entry.name_str(),
                );
                cursor = block + 1;
            }
            Err(FsStatus::FileEntryNotFound) => break,
            Err(e) => return Err(CliError::from(e).into()),
        }
    }
    Ok(())
}

pub fn write(path: &Path, name: &str, start: u16, file: &Path) -> Result<()> {
    let mut fs = open_image(path)?;
    let mut input = File::open(file).with_context(|| format!("opening {}", file.display()))?;
    let mut payload = Vec::new();
    input.read_to_end(&mut payload)?;

    // The stored size tracks the input file's actual length, the same way
    // `handle_write` recomputes `stop` from `ftell` rather than trusting the
    // caller-supplied one.
    let actual_stop = start.saturating_add(payload.len() as u16);
    let (_block, _total_size, mut page) = fs
        .create_entry(0, name.as_bytes(), start, actual_stop)
        .map_err(CliError::from)?;
    println!("Number of bytes to write: {}", payload.len());

    let first_chunk = payload.len().min(256 - ENTRY_SIZE);
    page[ENTRY_SIZE..ENTRY_SIZE + first_chunk].copy_from_slice(&payload[..first_chunk]);
    fs.write_file(&page).map_err(CliError::from)?;

    let mut written = first_chunk;
    while written < payload.len() {
        let take = (payload.len() - written).min(256);
        let mut page = [0xFFu8; 256];
        page[..take].copy_from_slice(&payload[written..written + take]);
        fs.write_file(&page).map_err(CliError::from)?;
        written += take;
    }

    println!("{} {} written successfully.", "ok:".green().bold(), name);
    Ok(())
}

pub fn read(path: &Path, what: &FileRef, file: &Path) -> Result<()> {
    let mut fs = open_image(path)?;
    let (size, first_page) = match what {
        FileRef::Name(name) => fs.read_by_name(name.as_bytes()),
        FileRef::Block(block) => fs.read_by_block(*block),
    }
    .map_err(CliError::from)?;

    let mut data = first_page.to_vec();
    let mut have = 256usize;
    while have < size as usize {
        let page = fs.read_next_page().map_err(CliError::from)?;
        data.extend_from_slice(&page);
        have += 256;
    }
    data.truncate(size as usize);

    let mut out = File::create(file).with_context(|| format!("creating {}", file.display()))?;
    out.write_all(&data[ENTRY_SIZE..])?;

    println!("{} read successfully to {}.", "ok:".green().bold(), file.display());
    Ok(())
}

pub fn delete(path: &Path, what: &FileRef) -> Result<()> {
    let mut fs = open_image(path)?;
    match what {
        FileRef::Name(name) => fs.delete_by_name(name.as_bytes()),
        FileRef::Block(block) => fs.delete_by_block(*block),
    }
    .map_err(CliError::from)?;
    println!("{} deleted successfully.", "ok:".green().bold());
    Ok(())
}
