pub mod dtype;
pub mod reader;
pub mod math;
pub mod soundfont;
#[cfg(feature = "flac")]
pub mod flac;
pub mod voice;
pub mod channel;
pub mod sequencer;
pub mod synth;

pub use dtype::SynthError;
pub use soundfont::SoundFont;
pub use synth::{Standard, Synthesizer};
