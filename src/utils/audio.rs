use anyhow::{anyhow, bail, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::core::story;

/// Sample layout of the raw PCM some providers return for `wav`.
pub const PCM_SAMPLE_RATE: u32 = 44_100;
pub const PCM_CHANNELS: u16 = 1;
pub const PCM_BITS: u16 = 16;

/// Wraps headerless little-endian PCM in a canonical RIFF/WAVE container.
/// Input that already carries a RIFF header is returned untouched.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16, bits: u16) -> Vec<u8> {
    if pcm.starts_with(b"RIFF") {
        return pcm.to_vec();
    }
    let block_align = channels * (bits / 8);
    let byte_rate = sample_rate * block_align as u32;
    let data_len = pcm.len() as u32;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

/// Where the samples of one WAV file live.
struct WavLayout {
    fmt: Vec<u8>,
    data_start: u64,
    data_len: u32,
}

fn read_tag(file: &mut File) -> Result<Option<[u8; 4]>> {
    let mut tag = [0u8; 4];
    match file.read_exact(&mut tag) {
        Ok(()) => Ok(Some(tag)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_u32(file: &mut File) -> Result<u32> {
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn wav_layout(path: &Path) -> Result<WavLayout> {
    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    if read_tag(&mut file)? != Some(*b"RIFF") {
        bail!("{} is not a RIFF file", path.display());
    }
    read_u32(&mut file)?;
    if read_tag(&mut file)? != Some(*b"WAVE") {
        bail!("{} is not a WAVE file", path.display());
    }

    let mut fmt = None;
    while let Some(tag) = read_tag(&mut file)? {
        let len = read_u32(&mut file)?;
        match &tag {
            b"fmt " => {
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf)?;
                fmt = Some(buf);
                if len % 2 == 1 {
                    file.seek(SeekFrom::Current(1))?;
                }
            }
            b"data" => {
                let fmt = fmt.ok_or_else(|| anyhow!("{} has data before fmt", path.display()))?;
                return Ok(WavLayout {
                    fmt,
                    data_start: file.stream_position()?,
                    data_len: len,
                });
            }
            // Chunks are word aligned.
            _ => {
                file.seek(SeekFrom::Current(i64::from(len) + i64::from(len % 2)))?;
            }
        }
    }
    Err(anyhow!("{} has no data chunk", path.display()))
}

/// Joins WAV files into one, keeping the shared fmt chunk and appending the
/// samples in order. Every input must use the same sample layout.
pub fn merge_wav_files(inputs: &[PathBuf], output: &Path) -> Result<()> {
    let layouts = inputs
        .iter()
        .map(|p| wav_layout(p))
        .collect::<Result<Vec<_>>>()?;
    let Some(first) = layouts.first() else {
        bail!("Nothing to merge");
    };
    if let Some((path, _)) = inputs
        .iter()
        .zip(&layouts)
        .find(|(_, layout)| layout.fmt != first.fmt)
    {
        bail!(
            "{} uses a different sample layout than {}",
            path.display(),
            inputs[0].display()
        );
    }

    let total: u64 = layouts.iter().map(|l| u64::from(l.data_len)).sum();
    let riff_len = 4 + 8 + first.fmt.len() as u64 + 8 + total;
    let riff_len = u32::try_from(riff_len).context("Merged audio exceeds the 4 GiB WAV limit")?;

    let mut out = BufWriter::new(File::create(output)?);
    out.write_all(b"RIFF")?;
    out.write_all(&riff_len.to_le_bytes())?;
    out.write_all(b"WAVE")?;
    out.write_all(b"fmt ")?;
    out.write_all(&(first.fmt.len() as u32).to_le_bytes())?;
    out.write_all(&first.fmt)?;
    out.write_all(b"data")?;
    out.write_all(&(total as u32).to_le_bytes())?;

    for (path, layout) in inputs.iter().zip(&layouts) {
        let mut input = File::open(path)?;
        input.seek(SeekFrom::Start(layout.data_start))?;
        std::io::copy(&mut input.take(u64::from(layout.data_len)), &mut out)?;
    }
    out.flush()?;
    Ok(())
}

/// Concatenates files byte for byte. Fine for frame based formats like MP3.
pub fn concat_files(inputs: &[PathBuf], output: &Path) -> Result<()> {
    let mut out = BufWriter::new(File::create(output)?);
    for path in inputs {
        let mut input = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        std::io::copy(&mut input, &mut out)?;
    }
    out.flush()?;
    Ok(())
}

/// Writes the narration of a whole story into `output`, paragraphs in order.
/// Returns how many paragraphs were exported.
pub async fn export_story_audio(story_path: &Path, format: &str, output: &Path) -> Result<usize> {
    let count = story::cached_paragraph_count(story_path).await?;
    if count == 0 {
        bail!("Story {} has no paragraphs", story_path.display());
    }

    let inputs: Vec<PathBuf> = (0..count)
        .map(|i| story::paragraph_audio_path(story_path, i, format))
        .collect();
    let missing: Vec<String> = inputs
        .iter()
        .filter(|p| !p.exists())
        .map(|p| p.display().to_string())
        .collect();
    if !missing.is_empty() {
        bail!(
            "Missing {} audio for {} paragraphs ({}); run --regenerate-audio first",
            format,
            missing.len(),
            missing.join(", ")
        );
    }

    let output = output.to_path_buf();
    let is_wav = format.eq_ignore_ascii_case("wav");
    tokio::task::spawn_blocking(move || {
        if is_wav {
            merge_wav_files(&inputs, &output)
        } else {
            concat_files(&inputs, &output)
        }
    })
    .await
    .context("Export worker panicked")??;
    Ok(count)
}
