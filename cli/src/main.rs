mod args;
mod commands;

use clap::Parser;
use colored::Colorize;

use args::{Cli, Command};

fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Command::Init { blocks } => commands::init(&cli.image, *blocks),
        Command::Move { first_block } => commands::mv(&cli.image, *first_block),
        Command::List { prefix } => commands::list(&cli.image, prefix.as_deref()),
        Command::Write { name, start, file } => commands::write(&cli.image, name, *start, file),
        Command::Read { what, file } => commands::read(&cli.image, what, file),
        Command::Delete { what } => commands::delete(&cli.image, what),
    };

    if let Err(err) = result {
        eprintln!("{} {err:#}", "error:".red().bold());
        std::process::exit(1);
    }
}
