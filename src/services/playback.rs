//! Blocking audio playback through an OS sound backend.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::core::config::SoundDriver;

/// Plays one file to completion. Implementations block the calling thread.
pub trait AudioPlayer: Send + Sync {
    fn play(&self, path: &Path) -> Result<()>;
}

/// Shells out to `mpg123` for MP3 and `aplay` for everything else.
pub struct AlsaPlayer;

fn alsa_program(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("mp3") => "mpg123",
        _ => "aplay",
    }
}

impl AudioPlayer for AlsaPlayer {
    fn play(&self, path: &Path) -> Result<()> {
        let program = alsa_program(path);
        log::debug!("Playing audio from {} with {}", path.display(), program);
        let status = Command::new(program)
            .arg("-q")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .with_context(|| format!("Failed to start {}", program))?;
        if !status.success() {
            return Err(anyhow!("{} exited with {} for {}", program, status, path.display()));
        }
        log::debug!("Done playing {}", path.display());
        Ok(())
    }
}

#[cfg(feature = "rodio")]
pub struct RodioPlayer;

#[cfg(feature = "rodio")]
impl AudioPlayer for RodioPlayer {
    fn play(&self, path: &Path) -> Result<()> {
        use rodio::{Decoder, OutputStreamBuilder, Sink};
        use std::io::BufReader;

        log::debug!("Playing audio from {} with rodio", path.display());
        let stream = OutputStreamBuilder::open_default_stream()
            .map_err(|e| anyhow!("Failed to open audio output: {}", e))?;
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let source = Decoder::new(BufReader::new(file))
            .map_err(|e| anyhow!("Failed to decode {}: {}", path.display(), e))?;

        let sink = Sink::connect_new(stream.mixer());
        sink.append(source);
        sink.sleep_until_end();
        log::debug!("Done playing {}", path.display());
        Ok(())
    }
}

pub fn create_player(driver: SoundDriver) -> Result<Arc<dyn AudioPlayer>> {
    match driver {
        SoundDriver::Alsa if cfg!(target_os = "linux") => Ok(Arc::new(AlsaPlayer)),
        SoundDriver::Alsa => {
            log::info!("ALSA is only available on Linux, trying rodio");
            create_player(SoundDriver::Rodio)
        }
        #[cfg(feature = "rodio")]
        SoundDriver::Rodio => Ok(Arc::new(RodioPlayer)),
        #[cfg(not(feature = "rodio"))]
        SoundDriver::Rodio => Err(anyhow!(
            "The rodio sound driver needs a build with `--features rodio`"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alsa_program_by_extension() {
        assert_eq!(alsa_program(Path::new("story/paragraph_0.mp3")), "mpg123");
        assert_eq!(alsa_program(Path::new("story/paragraph_0.MP3")), "mpg123");
        assert_eq!(alsa_program(Path::new("story/paragraph_0.wav")), "aplay");
        assert_eq!(alsa_program(Path::new("noext")), "aplay");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_alsa_driver_on_linux() {
        assert!(create_player(SoundDriver::Alsa).is_ok());
    }

    #[cfg(not(feature = "rodio"))]
    #[test]
    fn test_rodio_requires_feature() {
        assert!(create_player(SoundDriver::Rodio).is_err());
    }
}
