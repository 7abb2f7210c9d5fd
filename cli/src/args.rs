use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// A reference to a stored file, either by name or by its block number.
///
/// Accepts the same two addressing forms the wire protocol does: a bare
/// name, or `#<block>` for direct block addressing. Grounded on `fdutil.c`'s
/// `command[0] == '#'` check in `handle_read`/`handle_delete`.
#[derive(Debug, Clone)]
pub enum FileRef {
    Name(String),
    Block(u16),
}

impl std::str::FromStr for FileRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix('#') {
            Some(digits) => digits
                .parse::<u16>()
                .map(FileRef::Block)
                .map_err(|_| format!("'{digits}' is not a valid block number")),
            None => Ok(FileRef::Name(s.to_string())),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "fdutil", about = "Flash disk image utility", version)]
pub struct Cli {
    /// Path to the disk image file.
    pub image: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize (or reinitialize) the image for a given number of blocks.
    Init {
        /// Number of 32 KiB blocks to format the image for.
        blocks: u16,
    },
    /// Rewrite every block's stored index so the image can be deployed at a
    /// different base block.
    Move {
        /// Block index the image's first block should be renumbered to.
        first_block: u16,
    },
    /// List stored files, optionally filtered by a case-insensitive prefix.
    List {
        /// Only list files whose name begins with this prefix.
        prefix: Option<String>,
    },
    /// Write a file into the image. The stored size is always taken from
    /// the input file's own length; there is no separate stop address to
    /// specify since, once the file's length is known, it is redundant.
    Write {
        /// Name to store the file under (up to 26 bytes).
        name: String,
        /// Start address, hexadecimal, without a `0x` prefix.
        #[arg(value_parser = parse_hex_u16)]
        start: u16,
        /// Local file whose contents become the stored payload.
        file: PathBuf,
    },
    /// Read a file out of the image, by name or by `#block`.
    Read {
        what: FileRef,
        /// Local file to write the payload to.
        file: PathBuf,
    },
    /// Delete a file from the image, by name or by `#block`.
    Delete { what: FileRef },
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|_| format!("'{s}' is not a valid hexadecimal address"))
}
