use clap::{CommandFactory, Parser};
use tracing_subscriber::filter::EnvFilter;

use crate::cli::{Cli, TopLevel, DecompileCommand, OutputModeCli};

mod cli;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(TopLevel::Decompile { command }) => match command {
            DecompileCommand::File { path, mode, indent } => {
                let mode = match mode {
                    OutputModeCli::Source => unsmash_lib::OutputMode::Source,
                    OutputModeCli::Disasm => unsmash_lib::OutputMode::Disasm,
                };
                let text = match std::fs::read_to_string(&path) {
                    Ok(text) => text,
                    Err(e) => {
                        eprintln!("failed to read {path:?}: {e}");
                        std::process::exit(1);
                    }
                };
                let code: unsmash_lib::CodeObject = match serde_json::from_str(&text) {
                    Ok(code) => code,
                    Err(e) => {
                        eprintln!("failed to parse {path:?}: {e}");
                        std::process::exit(1);
                    }
                };
                match unsmash_lib::decompile_with_options(
                    &code,
                    unsmash_lib::DecompileOptions {
                        mode,
                        indent_step: indent,
                    },
                ) {
                    Ok(out) => {
                        print!("{out}");
                    }
                    Err(e) => {
                        eprintln!("decompile error: {e}");
                        std::process::exit(1);
                    }
                }
            }
        },
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            Cli::command().print_help().unwrap();
        }
    }
}
