use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{command, Parser};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use sfsynth::Synthesizer;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(version = VERSION, about = "Render a MIDI-family score through a SoundFont bank to WAV", long_about = None)]
struct Cli {
    /// SoundFont bank (SF2, optionally FLAC-wrapped)
    #[arg(long)]
    soundfont: PathBuf,

    /// Score file (MIDI, RMI, GMF, MUS, RSXX)
    #[arg(long)]
    song: PathBuf,

    /// Polyphony; at least 24 is recommended for General MIDI
    #[arg(long, default_value_t = 64)]
    voices: usize,

    /// Output sample rate in hertz
    #[arg(long, default_value_t = 44100.0)]
    rate: f32,

    /// Master volume, clamped at zero
    #[arg(long, default_value_t = 1.0)]
    volume: f32,

    /// Repeat the song's loop region this many times
    #[arg(long)]
    loops: Option<i32>,

    /// Stop after this many seconds even if the song has not ended
    #[arg(long)]
    seconds: Option<f64>,

    /// Output WAV path; defaults to the song path with a .wav extension
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.voices == 0 {
        bail!("must have more than 0 voices");
    }
    if cli.rate <= 0.0 {
        bail!("sample rate must be positive");
    }

    let mut synth = Synthesizer::new(cli.rate, cli.voices);
    if !synth.load_soundfont(&cli.soundfont) {
        bail!("error loading soundfont {}", cli.soundfont.display());
    }
    if !synth.load_song(&cli.song) {
        bail!("error loading song {}", cli.song.display());
    }
    synth.set_volume(cli.volume);
    if let Some(loops) = cli.loops {
        synth.set_loop_enabled(true);
        synth.set_loop_count(loops);
    }

    let out = cli.out.clone().unwrap_or_else(|| cli.song.with_extension("wav"));
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: cli.rate as u32,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&out, spec)
        .with_context(|| format!("could not create {}", out.display()))?;

    let frame_limit = cli.seconds.map(|seconds| (seconds * cli.rate as f64) as u64);
    let mut buffer = vec![0u8; 4096 * 8];
    let mut frames_rendered = 0u64;

    loop {
        let written = synth.play_stream(&mut buffer);
        if written == 0 {
            break;
        }
        for chunk in buffer[..written].chunks_exact(4) {
            writer.write_sample(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))?;
        }
        frames_rendered += (written / 8) as u64;
        if let Some(limit) = frame_limit {
            if frames_rendered >= limit {
                break;
            }
        }
    }

    writer.finalize()?;
    println!(
        "{} {} ({:.2} s)",
        "Rendered".green(),
        out.display(),
        frames_rendered as f64 / cli.rate as f64
    );

    Ok(())
}
