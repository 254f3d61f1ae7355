use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use storyteller::core::config::{Config, LlmProvider, SoundDriver, TtsProvider};
use storyteller::core::story;
use storyteller::services::llm::create_llm;
use storyteller::services::playback::create_player;
use storyteller::services::session::StoryTeller;
use storyteller::services::tts::{create_tts_client, TtsClient};
use storyteller::services::workflow::{self, StoryRequest, WorkflowContext};
use storyteller::utils::audio::export_story_audio;

#[derive(Parser, Debug)]
#[command(name = "storyteller", about = "Generates stories with a language model and reads them aloud")]
struct Args {
    /// What to tell, e.g. "a brave mouse" or "tell me more about the dragon"
    query: Vec<String>,

    /// Path to config.yml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Generate the story again even if it is cached
    #[arg(long)]
    ignore_cache: bool,

    /// Topic used when no query is given
    #[arg(long)]
    story_request: Option<String>,

    /// Continue an existing story, by directory name or topic
    #[arg(long, value_name = "STORY")]
    continue_story: Option<String>,

    /// Print the voices of the active TTS provider
    #[arg(long)]
    list_voices: bool,

    /// Speak a sample sentence with the given voice
    #[arg(long, value_name = "VOICE")]
    voice_preview: Option<String>,

    /// Print the stored stories
    #[arg(long)]
    list_stories: bool,

    /// Synthesize all audio of a story again
    #[arg(long, value_name = "STORY")]
    regenerate_audio: Option<String>,

    /// Write the whole narration of a story into one file
    #[arg(long, value_name = "STORY", requires = "output")]
    export: Option<String>,

    /// Target file for --export
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long, value_enum)]
    sound_driver: Option<SoundDriver>,

    #[arg(long, value_enum)]
    llm_provider: Option<LlmProvider>,

    #[arg(long)]
    llm_model: Option<String>,

    #[arg(long, value_enum)]
    tts_provider: Option<TtsProvider>,

    #[arg(long)]
    tts_voice: Option<String>,

    #[arg(long)]
    tts_format: Option<String>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    max_tokens: Option<u32>,

    #[arg(long)]
    stories_folder: Option<String>,
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if args.ignore_cache {
        config.story.ignore_cache = true;
    }
    if let Some(request) = &args.story_request {
        config.story.story_request = Some(request.clone());
    }
    if let Some(driver) = args.sound_driver {
        config.audio.driver = driver;
    }
    if let Some(provider) = args.llm_provider {
        config.llm.provider = provider;
    }
    if let Some(model) = &args.llm_model {
        config.llm.model = model.clone();
    }
    if let Some(provider) = args.tts_provider {
        config.tts.provider = provider;
    }
    if let Some(voice) = &args.tts_voice {
        config.tts.voice = voice.clone();
    }
    if let Some(format) = &args.tts_format {
        config.tts.format = format.clone();
    }
    if let Some(temperature) = args.temperature {
        config.llm.temperature = temperature;
    }
    if let Some(max_tokens) = args.max_tokens {
        config.llm.max_tokens = max_tokens;
    }
    if let Some(folder) = &args.stories_folder {
        config.stories_folder = folder.clone();
    }
}

async fn find_story(root: &Path, name: &str) -> Result<PathBuf> {
    story::resolve_story(root, name)
        .await?
        .with_context(|| format!("No story matching '{}' in {}", name, root.display()))
}

fn check_format(config: &Config, tts: &dyn TtsClient) -> Result<()> {
    let format = config.tts.format.as_str();
    if !tts.supported_formats().contains(&format) {
        bail!(
            "{} cannot produce '{}' audio, use one of: {}",
            tts.provider().as_str(),
            format,
            tts.supported_formats().join(", ")
        );
    }
    Ok(())
}

async fn print_stories(root: &Path) -> Result<()> {
    let stories = story::list_stories(root).await?;
    if stories.is_empty() {
        println!("No stories in {}", root.display());
        return Ok(());
    }
    for summary in stories {
        println!(
            "{:<40} {:>3} paragraphs  {}",
            summary.name,
            summary.paragraph_count,
            summary.query.unwrap_or_default()
        );
    }
    Ok(())
}

async fn print_voices(tts: &dyn TtsClient) -> Result<()> {
    let voices = tts.list_voices().await?;
    println!("Voices for {}:", tts.provider().as_str());
    for voice in voices {
        let gender = voice.gender.unwrap_or_default();
        let description = voice.description.unwrap_or_default();
        println!("  {:<24} {:<20} {:<8} {}", voice.id, voice.name, gender, description);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    apply_overrides(&mut config, &args);
    config.ensure_directories()?;
    let root = config.stories_path();

    if args.list_stories {
        return print_stories(&root).await;
    }

    if args.list_voices {
        let tts = create_tts_client(&config)?;
        return print_voices(tts.as_ref()).await;
    }

    if let Some(voice) = &args.voice_preview {
        let tts = create_tts_client(&config)?;
        check_format(&config, tts.as_ref())?;
        let player = create_player(config.audio.driver)?;
        let path = workflow::voice_preview(&config, tts.as_ref(), player, voice).await?;
        info!("Preview saved to {}", path.display());
        return Ok(());
    }

    if let Some(name) = &args.regenerate_audio {
        let story_path = find_story(&root, name).await?;
        let tts = create_tts_client(&config)?;
        check_format(&config, tts.as_ref())?;
        workflow::regenerate_audio(&config, tts.as_ref(), &story_path).await?;
        return Ok(());
    }

    if let Some(name) = &args.export {
        let story_path = find_story(&root, name).await?;
        let output = args.output.as_deref().context("--export needs --output")?;
        let count = export_story_audio(&story_path, &config.tts.format, output).await?;
        info!("Exported {} paragraphs to {}", count, output.display());
        return Ok(());
    }

    let request = match &args.continue_story {
        Some(name) => {
            let story_path = find_story(&root, name).await?;
            let dir = story_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| name.clone());
            let query = format!("continue the story about {}", dir);
            StoryRequest::continue_story(story_path, query)
        }
        None => StoryRequest::new((!args.query.is_empty()).then(|| args.query.join(" "))),
    };

    let llm = create_llm(&config)?;
    let tts = create_tts_client(&config)?;
    check_format(&config, tts.as_ref())?;
    let player = create_player(config.audio.driver)?;

    let ctx = WorkflowContext::new(config, Arc::from(llm), Arc::from(tts), player);
    let teller = StoryTeller::new(Arc::new(ctx));
    let mut session = teller.tell(request);

    tokio::select! {
        result = session.wait() => return result,
        _ = tokio::signal::ctrl_c() => {}
    }

    warn!("Interrupted, stopping story session {}", session.id());
    session.cancel();
    if let Err(e) = session.wait().await {
        info!("{:#}", e);
    }
    Ok(())
}
