/// Example: sf2_tool to-xml ./banks/*.sf2 -o unpack
/// Example: sf2_tool check ./banks/*.sf2

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{command, Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use sfsynth::reader::ByteSource;
use sfsynth::SoundFont;

#[path = "../binutils.rs"]
mod binutils;
use binutils::{get_final_output_folder, get_input_output_pairs, open_file_overwrite_rw, VERSION};

#[derive(Parser)]
#[command(version = VERSION, about = "Tools for inspecting and validating SoundFont banks", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump a bank listing (presets, instruments, sample headers) as XML
    ToXml {
        /// Sets the path of the SF2 files to be listed
        #[arg(value_name = "INPUT")]
        input_glob: String,

        /// Sets the folder to output the listings
        #[arg(short = 'o', long, value_name = "OUTPUT")]
        output_folder: Option<PathBuf>,
    },
    /// Parse banks and report whether they load
    Check {
        /// Sets the path of the SF2 files to be validated
        #[arg(value_name = "INPUT")]
        input_glob: String,
    },
}

fn load_bank(path: &PathBuf) -> anyhow::Result<SoundFont> {
    let mut source =
        ByteSource::open_file(path).with_context(|| format!("could not open {}", path.display()))?;
    SoundFont::parse(&mut source).with_context(|| format!("could not parse {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::ToXml { input_glob, output_folder } => {
            let output_folder = get_final_output_folder(output_folder)?;
            let pairs = get_input_output_pairs(input_glob, "sf2", &output_folder, "sf2.xml");

            for (input_file_path, output_file_path) in pairs {
                print!("Listing {}... ", input_file_path.display());
                let bank = load_bank(&input_file_path)?;
                let listing = quick_xml::se::to_string(&bank.listing())?;
                open_file_overwrite_rw(output_file_path)?.write_all(listing.as_bytes())?;
                println!("{}", "done!".green());
            }

            println!("\nAll files successfully processed.");
        }
        Commands::Check { input_glob } => {
            let mut failures = 0usize;
            for entry in glob::glob(input_glob)?.flatten() {
                match load_bank(&entry) {
                    Ok(bank) => {
                        println!(
                            "{} {} ({} presets, {} instruments, {} samples)",
                            "ok".green(),
                            entry.display(),
                            bank.presets().len(),
                            bank.instruments().len(),
                            bank.samples().len()
                        );
                    }
                    Err(e) => {
                        println!("{} {}: {:#}", "failed".red(), entry.display(), e);
                        failures += 1;
                    }
                }
            }
            if failures > 0 {
                bail!("{} bank(s) failed to load", failures);
            }
        }
    }

    Ok(())
}
