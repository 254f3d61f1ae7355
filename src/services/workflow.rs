//! The three-stage story pipeline.
//!
//! The writer turns a request into paragraph items (freshly generated or
//! replayed from disk), the reader turns items into audio files and the speaker
//! plays them in order. Stages talk over unbounded channels and each channel
//! carries exactly one `Done` marker per session.

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::core::config::Config;
use crate::core::state::{ContinuationContext, StoryInfo};
use crate::core::story;
use crate::services::llm::{CompletionRequest, LlmClient};
use crate::services::paragraph::ParagraphSplitter;
use crate::services::playback::AudioPlayer;
use crate::services::tts::{synthesize_to_file, SynthesisRequest, TtsClient};

pub const DEFAULT_PROMPT: &str = "You are a warm, imaginative storyteller. \
Tell the story the listener asks for in plain prose meant to be read aloud. \
Write short paragraphs separated by a blank line. \
Do not use titles, lists, markdown or sound effects.";

pub const PREVIEW_TEXT: &str = "Hello! This is how I sound when I tell you a story.";

const STORY_REQUEST_MARKER: &str = "story_request";
const LITERAL_QUERY_MARKER: &str = "n/a";

/// What one session should tell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoryRequest {
    pub query: Option<String>,
    /// Story to continue, already picked by the caller. Skips the topic search.
    pub continue_from: Option<PathBuf>,
}

impl StoryRequest {
    pub fn new(query: Option<String>) -> Self {
        Self {
            query,
            continue_from: None,
        }
    }

    pub fn continue_story(story: PathBuf, query: String) -> Self {
        Self {
            query: Some(query),
            continue_from: Some(story),
        }
    }
}

impl From<&str> for StoryRequest {
    fn from(query: &str) -> Self {
        Self::new(Some(query.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParagraphItem {
    pub story: PathBuf,
    pub index: usize,
    /// `None` replays the text already stored on disk.
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoryMessage {
    Paragraph(ParagraphItem),
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadingMessage {
    Audio(PathBuf),
    Done,
}

/// A channel closed before its `Done` marker arrived, meaning the stage on
/// the other end has already failed.
#[derive(Debug, thiserror::Error)]
#[error("{0} queue closed before the end of the story")]
pub struct QueueClosed(&'static str);

/// Everything a session needs, shared by the three stages.
pub struct WorkflowContext {
    pub config: Config,
    pub llm: Arc<dyn LlmClient>,
    pub tts: Arc<dyn TtsClient>,
    pub player: Arc<dyn AudioPlayer>,
}

impl WorkflowContext {
    pub fn new(
        config: Config,
        llm: Arc<dyn LlmClient>,
        tts: Arc<dyn TtsClient>,
        player: Arc<dyn AudioPlayer>,
    ) -> Self {
        Self {
            config,
            llm,
            tts,
            player,
        }
    }
}

fn send<T>(tx: &UnboundedSender<T>, message: T, queue: &'static str) -> Result<()> {
    tx.send(message).map_err(|_| anyhow!(QueueClosed(queue)))
}

/// Settles on the request text and how it was obtained.
pub fn resolve_query(config: &Config, query: Option<&str>) -> Result<(String, String)> {
    if let Some(query) = query.map(str::trim).filter(|q| !q.is_empty()) {
        return Ok((query.to_string(), LITERAL_QUERY_MARKER.to_string()));
    }
    if let Some(request) = config
        .story
        .story_request
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
    {
        info!("Story request: {}", request);
        let query = config
            .story
            .story_request_template
            .replace("{request}", request);
        return Ok((query, STORY_REQUEST_MARKER.to_string()));
    }
    Err(anyhow!("No query provided and no story_request set."))
}

pub async fn load_prompt(config: &Config) -> Result<String> {
    match &config.prompt_file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read prompt file {}", path)),
        None => Ok(DEFAULT_PROMPT.to_string()),
    }
}

pub fn continuation_prompt(base: &str, context: &ContinuationContext, query: &str) -> String {
    format!(
        "{}\n\nYou are continuing an existing story. Here is what has happened so far:\n\n\
         Original request: {}\n\nStory so far:\n{}\n\n\
         Now continue this story based on the user's request: {}",
        base,
        context.original_query.as_deref().unwrap_or("unknown"),
        context.paragraphs.join("\n\n"),
        query
    )
}

fn replay(story_tx: &UnboundedSender<StoryMessage>, story: &Path, count: usize) -> Result<()> {
    for index in 0..count {
        send(
            story_tx,
            StoryMessage::Paragraph(ParagraphItem {
                story: story.to_path_buf(),
                index,
                text: None,
            }),
            "story",
        )?;
    }
    Ok(())
}

/// Stores a generated paragraph and hands it to the reader. Returns the next
/// free index.
async fn emit_paragraph(
    story_tx: &UnboundedSender<StoryMessage>,
    story_path: &Path,
    index: usize,
    paragraph: String,
) -> Result<usize> {
    if paragraph.trim().is_empty() {
        return Ok(index);
    }
    info!("Paragraph {}: {}", index, paragraph.trim_end());
    story::write_paragraph(story_path, index, &paragraph).await?;
    send(
        story_tx,
        StoryMessage::Paragraph(ParagraphItem {
            story: story_path.to_path_buf(),
            index,
            text: Some(paragraph),
        }),
        "story",
    )?;
    Ok(index + 1)
}

/// Produces paragraph items for `request`, then `Done`.
pub async fn writer(
    ctx: Arc<WorkflowContext>,
    story_tx: UnboundedSender<StoryMessage>,
    request: StoryRequest,
) -> Result<()> {
    let config = &ctx.config;
    let (query, query_local) = resolve_query(config, request.query.as_deref())?;
    let root = config.stories_path();
    let is_continuation = request.continue_from.is_some()
        || story::is_continuation_query(&query, &config.story.continuation_patterns);

    let (story_path, continuation) = if is_continuation {
        let target = match request.continue_from {
            Some(path) => Some(path),
            None => story::find_story_for_continuation(&root, &query).await?,
        };
        let Some(path) = target else {
            warn!("No existing story found to continue");
            return send(&story_tx, StoryMessage::Done, "story");
        };
        let context = story::load_story_context(&path, config.story.context_paragraphs).await?;
        info!(
            "Continuing story '{}' from paragraph {}",
            context.original_query.as_deref().unwrap_or("unknown"),
            context.next_index
        );
        if config.story.replay_on_continue {
            replay(&story_tx, &path, story::cached_paragraph_count(&path).await?)?;
        }
        (path, Some(context))
    } else {
        let name = story::query_to_filename(&query, &config.story.query_guard);
        (root.join(name), None)
    };

    let exists = tokio::fs::metadata(&story_path)
        .await
        .is_ok_and(|m| m.is_dir());
    let generate = config.story.ignore_cache || is_continuation || !exists;

    if !generate {
        debug!("Reading cached story at {}", story_path.display());
        replay(&story_tx, &story_path, story::cached_paragraph_count(&story_path).await?)?;
        debug!("Done processing the story.");
        return send(&story_tx, StoryMessage::Done, "story");
    }

    if continuation.is_none() {
        if exists {
            story::clear_paragraphs(&story_path, &config.tts.format).await?;
        }
        debug!("Creating story folder at {}", story_path.display());
        tokio::fs::create_dir_all(&story_path)
            .await
            .with_context(|| format!("Failed to create {}", story_path.display()))?;
        debug!("Writing model info to disk...");
        story::write_info(
            &story_path,
            &StoryInfo::from_config(config, ctx.tts.provider(), &query, &query_local),
        )
        .await?;
    }

    let base_prompt = load_prompt(config).await?;
    let (prompt, mut index) = match &continuation {
        Some(context) => (
            continuation_prompt(&base_prompt, context, &query),
            context.next_index,
        ),
        None => (base_prompt, 0),
    };

    let request = CompletionRequest::from_config(config, &prompt, &query);
    let mut fragments = ctx.llm.stream_chat(&request).await?;
    let mut splitter = ParagraphSplitter::new();
    while let Some(fragment) = fragments.next().await {
        for paragraph in splitter.push(&fragment?) {
            index = emit_paragraph(&story_tx, &story_path, index, paragraph).await?;
        }
    }
    if let Some(rest) = splitter.finish() {
        if config.story.flush_trailing_paragraph {
            emit_paragraph(&story_tx, &story_path, index, rest).await?;
        } else {
            warn!(
                "Dropping unterminated final paragraph ({} chars)",
                rest.chars().count()
            );
        }
    }
    debug!("Finished processing the story stream.");
    send(&story_tx, StoryMessage::Done, "story")
}

/// Returns the audio file for one paragraph, synthesizing it unless a file
/// for that paragraph already exists.
pub async fn synthesize_paragraph(
    config: &Config,
    tts: &dyn TtsClient,
    item: &ParagraphItem,
) -> Result<PathBuf> {
    let audio_path = story::paragraph_audio_path(&item.story, item.index, &config.tts.format);
    let text_path = story::paragraph_text_path(&item.story, item.index);
    if tokio::fs::try_exists(&audio_path).await? && tokio::fs::try_exists(&text_path).await? {
        debug!("Reusing audio for paragraph {}", item.index);
        return Ok(audio_path);
    }

    let text = match &item.text {
        Some(text) => text.clone(),
        None => story::read_paragraph(&item.story, item.index).await?,
    };
    debug!("Synthesizing paragraph {}", item.index);
    let request = SynthesisRequest::from_config(config, &text);
    synthesize_to_file(tts, &request, &audio_path).await
}

/// Turns paragraph items into audio files until `Done` or the flag drops.
pub async fn reader(
    ctx: Arc<WorkflowContext>,
    talking: Arc<AtomicBool>,
    mut story_rx: UnboundedReceiver<StoryMessage>,
    reading_tx: UnboundedSender<ReadingMessage>,
) -> Result<()> {
    while talking.load(Ordering::SeqCst) {
        match story_rx.recv().await {
            Some(StoryMessage::Paragraph(item)) => {
                let audio = synthesize_paragraph(&ctx.config, ctx.tts.as_ref(), &item).await?;
                send(&reading_tx, ReadingMessage::Audio(audio), "reading")?;
            }
            Some(StoryMessage::Done) => {
                debug!("Done reading the story.");
                return send(&reading_tx, ReadingMessage::Done, "reading");
            }
            None if talking.load(Ordering::SeqCst) => return Err(anyhow!(QueueClosed("story"))),
            None => break,
        }
    }
    Ok(())
}

/// Plays audio files one after another until `Done` or the flag drops.
pub async fn speaker(
    ctx: Arc<WorkflowContext>,
    talking: Arc<AtomicBool>,
    mut reading_rx: UnboundedReceiver<ReadingMessage>,
) -> Result<()> {
    while talking.load(Ordering::SeqCst) {
        match reading_rx.recv().await {
            Some(ReadingMessage::Audio(path)) => {
                let player = ctx.player.clone();
                tokio::task::spawn_blocking(move || player.play(&path))
                    .await
                    .context("Playback worker panicked")??;
            }
            Some(ReadingMessage::Done) => {
                debug!("Done playing the story.");
                return Ok(());
            }
            None if talking.load(Ordering::SeqCst) => {
                return Err(anyhow!(QueueClosed("reading")))
            }
            None => break,
        }
    }
    Ok(())
}

/// The error that explains a failed session: the first stage error in
/// writer, reader, speaker order that is not just a closed queue.
fn first_failure(results: [Result<()>; 3]) -> Result<()> {
    let errors: Vec<anyhow::Error> = results.into_iter().filter_map(Result::err).collect();
    let root = errors
        .iter()
        .position(|e| e.downcast_ref::<QueueClosed>().is_none())
        .unwrap_or(0);
    match errors.into_iter().nth(root) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Runs one storytelling session to completion.
pub async fn run_story_loop(
    ctx: Arc<WorkflowContext>,
    request: StoryRequest,
    talking: Arc<AtomicBool>,
) -> Result<()> {
    talking.store(true, Ordering::SeqCst);
    let (story_tx, story_rx) = mpsc::unbounded_channel();
    let (reading_tx, reading_rx) = mpsc::unbounded_channel();

    let (written, read, spoken) = tokio::join!(
        writer(ctx.clone(), story_tx, request),
        reader(ctx.clone(), talking.clone(), story_rx, reading_tx),
        speaker(ctx.clone(), talking.clone(), reading_rx),
    );
    talking.store(false, Ordering::SeqCst);

    first_failure([
        written.context("Writer failed"),
        read.context("Reader failed"),
        spoken.context("Speaker failed"),
    ])
}

/// Throws away a story's audio and narrates every stored paragraph again
/// without playing anything.
pub async fn regenerate_audio(
    config: &Config,
    tts: &dyn TtsClient,
    story_path: &Path,
) -> Result<Vec<PathBuf>> {
    let removed = story::remove_audio(story_path, &config.tts.format).await?;
    info!("Removed {} audio files from {}", removed, story_path.display());

    let count = story::cached_paragraph_count(story_path).await?;
    let mut files = Vec::with_capacity(count);
    for index in 0..count {
        let item = ParagraphItem {
            story: story_path.to_path_buf(),
            index,
            text: None,
        };
        files.push(synthesize_paragraph(config, tts, &item).await?);
    }
    info!("Regenerated {} audio files", files.len());
    Ok(files)
}

/// Speaks a fixed sample sentence with `voice`.
pub async fn voice_preview(
    config: &Config,
    tts: &dyn TtsClient,
    player: Arc<dyn AudioPlayer>,
    voice: &str,
) -> Result<PathBuf> {
    let mut request = SynthesisRequest::from_config(config, PREVIEW_TEXT);
    request.voice = voice.to_string();
    let name = story::query_to_filename(voice, "");
    let output = std::env::temp_dir().join(format!("storyteller_preview_{}.{}", name, request.format));

    let path = synthesize_to_file(tts, &request, &output).await?;
    let file = path.clone();
    tokio::task::spawn_blocking(move || player.play(&file))
        .await
        .context("Playback worker panicked")??;
    Ok(path)
}
