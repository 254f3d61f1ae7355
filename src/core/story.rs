//! On-disk story layout.
//!
//! A story is a directory holding `info.yaml`, one `paragraph_<i>.txt` per
//! paragraph and, once narrated, one `paragraph_<i>.<format>` per paragraph.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use crate::core::state::{ContinuationContext, StoryInfo, StorySummary};

pub const INFO_FILE: &str = "info.yaml";
pub const MAX_FILE_LENGTH: usize = 255;

static PARAGRAPH_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^paragraph_(\d+)\.txt$").expect("valid regex"));

static ILLEGAL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\\/*?:"<>| ]"#).expect("valid regex"));

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("valid regex"));

static TOPIC_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"continue the story about (.+)",
        r"tell me more about (.+)",
        r"what happens next (?:in|with|to) (.+)",
        r"continue (.+)",
        r"more about (.+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static TOPIC_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+(story|tale)$").expect("valid regex"));

/// Turns a request into a directory name: lowercased, query guard removed,
/// trailing period dropped, path-hostile characters replaced by `_`.
/// The result is always a single normal path component.
pub fn query_to_filename(query: &str, prefix: &str) -> String {
    let lowered = query.to_lowercase();
    let mut name = if prefix.is_empty() {
        lowered.trim().to_string()
    } else {
        lowered.replacen(&prefix.to_lowercase(), "", 1).trim().to_string()
    };
    if name.ends_with('.') {
        name.pop();
    }
    let name: String = ILLEGAL_CHARS
        .replace_all(&name, "_")
        .chars()
        .take(MAX_FILE_LENGTH)
        .collect();
    // "", "." and ".." would point at the stories root or above it.
    if name.chars().all(|c| c == '.') {
        return "_".repeat(name.len().max(1));
    }
    name
}

/// True when `name` is one plain directory name, not a path.
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    )
}

pub fn paragraph_text_path(story: &Path, index: usize) -> PathBuf {
    story.join(format!("paragraph_{}.txt", index))
}

pub fn paragraph_audio_path(story: &Path, index: usize, format: &str) -> PathBuf {
    story.join(format!("paragraph_{}.{}", index, format))
}

pub fn info_path(story: &Path) -> PathBuf {
    story.join(INFO_FILE)
}

pub async fn write_paragraph(story: &Path, index: usize, text: &str) -> Result<PathBuf> {
    let path = paragraph_text_path(story, index);
    tokio::fs::write(&path, text)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

pub async fn read_paragraph(story: &Path, index: usize) -> Result<String> {
    let path = paragraph_text_path(story, index);
    tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("No text found for paragraph {} in {}", index, story.display()))
}

pub async fn write_info(story: &Path, info: &StoryInfo) -> Result<()> {
    let content = serde_yaml_ng::to_string(info)?;
    tokio::fs::write(info_path(story), content)
        .await
        .with_context(|| format!("Failed to write story info in {}", story.display()))?;
    Ok(())
}

pub async fn read_info(story: &Path) -> Result<Option<StoryInfo>> {
    let path = info_path(story);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let content = tokio::fs::read_to_string(&path).await?;
    let info = serde_yaml_ng::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(info))
}

/// Indices of all `paragraph_<i>.txt` files, ascending.
pub async fn paragraph_indices(story: &Path) -> Result<Vec<usize>> {
    let mut indices = Vec::new();
    if !tokio::fs::try_exists(story).await? {
        return Ok(indices);
    }
    let mut dir = tokio::fs::read_dir(story).await?;
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(caps) = PARAGRAPH_FILE.captures(&name) {
            if let Ok(index) = caps[1].parse::<usize>() {
                indices.push(index);
            }
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

/// Number of paragraphs stored contiguously from index 0.
pub async fn cached_paragraph_count(story: &Path) -> Result<usize> {
    let indices = paragraph_indices(story).await?;
    let count = indices
        .iter()
        .enumerate()
        .take_while(|(expected, index)| *expected == **index)
        .count();
    if count != indices.len() {
        log::warn!(
            "Story {} has a gap after paragraph {}, ignoring later paragraphs",
            story.display(),
            count
        );
    }
    Ok(count)
}

fn next_index_after(indices: &[usize]) -> usize {
    indices.last().map(|last| last + 1).unwrap_or(0)
}

pub fn is_continuation_query(query: &str, patterns: &[String]) -> bool {
    let query = query.trim().to_lowercase();
    patterns
        .iter()
        .filter(|p| !p.trim().is_empty())
        .any(|p| query.contains(&p.to_lowercase()))
}

/// Pulls the subject out of requests like "tell me more about the dragon".
pub fn extract_topic(query: &str) -> Option<String> {
    let query = query.trim().to_lowercase();
    TOPIC_PATTERNS.iter().find_map(|pattern| {
        pattern.captures(&query).map(|caps| {
            let topic = caps[1].trim();
            TOPIC_SUFFIX.replace(topic, "").to_string()
        })
    })
}

fn words(text: &str) -> HashSet<String> {
    WORD.find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

async fn story_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if !tokio::fs::try_exists(root).await? {
        return Ok(dirs);
    }
    let mut dir = tokio::fs::read_dir(root).await?;
    while let Some(entry) = dir.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Story directories sharing at least one word with `topic`, best match first.
/// A directory named exactly like the topic beats any word overlap. Equal
/// scores are ordered by directory name.
pub async fn find_stories_by_topic(
    root: &Path,
    topic: &str,
    max_results: usize,
) -> Result<Vec<PathBuf>> {
    let topic_words = words(topic);
    if topic_words.is_empty() {
        return Ok(Vec::new());
    }

    let topic_name = query_to_filename(topic, "");

    // Every candidate shares the same denominator, so the overlap count ranks them.
    let mut scored: Vec<((bool, usize), String, PathBuf)> = story_dirs(root)
        .await?
        .into_iter()
        .filter_map(|path| {
            let name = dir_name(&path);
            let common = topic_words.intersection(&words(&name)).count();
            let exact = name.to_lowercase() == topic_name;
            (common > 0).then_some(((exact, common), name, path))
        })
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    Ok(scored
        .into_iter()
        .take(max_results)
        .map(|(_, _, path)| path)
        .collect())
}

pub async fn most_recent_story(root: &Path) -> Result<Option<PathBuf>> {
    let mut dated = Vec::new();
    for path in story_dirs(root).await? {
        let modified = tokio::fs::metadata(&path)
            .await?
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        dated.push((modified, dir_name(&path), path));
    }
    dated.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    Ok(dated.into_iter().next().map(|(_, _, path)| path))
}

/// Picks the story a continuation request refers to: best topic match, else
/// the most recently modified story.
pub async fn find_story_for_continuation(root: &Path, query: &str) -> Result<Option<PathBuf>> {
    if let Some(topic) = extract_topic(query) {
        if let Some(found) = find_stories_by_topic(root, &topic, 1).await?.into_iter().next() {
            log::info!(
                "Found story to continue based on topic '{}': {}",
                topic,
                dir_name(&found)
            );
            return Ok(Some(found));
        }
    }

    let recent = most_recent_story(root).await?;
    if let Some(path) = &recent {
        log::info!("Using most recent story for continuation: {}", dir_name(path));
    }
    Ok(recent)
}

/// Exact directory name first, then the best topic match.
pub async fn resolve_story(root: &Path, name_or_topic: &str) -> Result<Option<PathBuf>> {
    if is_plain_name(name_or_topic) {
        let exact = root.join(name_or_topic);
        if tokio::fs::metadata(&exact).await.is_ok_and(|m| m.is_dir()) {
            return Ok(Some(exact));
        }
    }
    Ok(find_stories_by_topic(root, name_or_topic, 1)
        .await?
        .into_iter()
        .next())
}

pub async fn load_story_context(story: &Path, window: usize) -> Result<ContinuationContext> {
    let original_query = match read_info(story).await {
        Ok(info) => info.map(|i| i.query),
        Err(e) => {
            log::warn!("Failed to read story info from {}: {:#}", story.display(), e);
            None
        }
    };

    let indices = paragraph_indices(story).await?;
    let next_index = next_index_after(&indices);
    let start = indices.len().saturating_sub(window);

    let mut paragraphs = Vec::new();
    for index in &indices[start..] {
        match read_paragraph(story, *index).await {
            Ok(text) => paragraphs.push(text.trim().to_string()),
            Err(e) => log::warn!("{:#}", e),
        }
    }

    Ok(ContinuationContext {
        original_query,
        paragraphs,
        next_index,
    })
}

pub async fn list_stories(root: &Path) -> Result<Vec<StorySummary>> {
    let mut stories = Vec::new();
    for path in story_dirs(root).await? {
        let query = read_info(&path).await.ok().flatten().map(|i| i.query);
        let paragraph_count = paragraph_indices(&path).await?.len();
        stories.push(StorySummary {
            name: dir_name(&path),
            path,
            query,
            paragraph_count,
        });
    }
    stories.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(stories)
}

/// Deletes the narrated audio of a story, keeping text and metadata.
pub async fn remove_audio(story: &Path, format: &str) -> Result<usize> {
    let mut removed = 0;
    for index in paragraph_indices(story).await? {
        let path = paragraph_audio_path(story, index, format);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(&path).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Deletes every paragraph of a story along with its audio in `format`.
pub async fn clear_paragraphs(story: &Path, format: &str) -> Result<usize> {
    let removed_audio = remove_audio(story, format).await?;
    let indices = paragraph_indices(story).await?;
    for index in &indices {
        tokio::fs::remove_file(paragraph_text_path(story, *index)).await?;
    }
    log::debug!(
        "Cleared {} paragraphs and {} audio files from {}",
        indices.len(),
        removed_audio,
        story.display()
    );
    Ok(indices.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn patterns() -> Vec<String> {
        crate::core::config::StoryConfig::default().continuation_patterns
    }

    #[test]
    fn test_query_to_filename() {
        assert_eq!(query_to_filename("A brave mouse.", ""), "a_brave_mouse");
        assert_eq!(
            query_to_filename("Tell me a story: cats/dogs?", "tell me a story"),
            "__cats_dogs_"
        );
        assert_eq!(query_to_filename("  Hello  ", ""), "hello");
        let long = "x".repeat(400);
        assert_eq!(query_to_filename(&long, "").chars().count(), MAX_FILE_LENGTH);
    }

    #[test]
    fn test_query_to_filename_never_escapes_root() {
        assert_eq!(query_to_filename(".", ""), "_");
        assert_eq!(query_to_filename("...", ""), "__");
        assert_eq!(query_to_filename("  ", ""), "_");
        assert_eq!(query_to_filename("tell me a story", "tell me a story"), "_");
        assert_eq!(query_to_filename("../up", ""), ".._up");
        for query in [".", "..", "...", "", "a/../b"] {
            assert!(is_plain_name(&query_to_filename(query, "")), "{:?}", query);
        }
    }

    #[test]
    fn test_is_continuation_query() {
        let patterns = patterns();
        assert!(is_continuation_query("Please CONTINUE the story", &patterns));
        assert!(is_continuation_query("tell me more about the fox", &patterns));
        assert!(!is_continuation_query("a brave mouse", &patterns));
        assert!(!is_continuation_query("anything", &["".to_string()]));
    }

    #[test]
    fn test_extract_topic() {
        assert_eq!(
            extract_topic("Continue the story about the brave mouse").as_deref(),
            Some("the brave mouse")
        );
        assert_eq!(
            extract_topic("what happens next with the dragon story").as_deref(),
            Some("the dragon")
        );
        assert_eq!(extract_topic("more about b c").as_deref(), Some("b c"));
        assert_eq!(extract_topic("keep going"), None);
    }

    #[tokio::test]
    async fn test_topic_ranking_prefers_shared_words() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path();
        for name in ["x_y_z", "b_c_d", "a_b_c"] {
            fs::create_dir_all(root.join(name))?;
        }

        let found = find_stories_by_topic(root, "b c", 5).await?;
        let names: Vec<String> = found.iter().map(|p| dir_name(p)).collect();
        assert_eq!(names, vec!["a_b_c", "b_c_d"]);

        let best = find_stories_by_topic(root, "b c", 1).await?;
        assert_eq!(dir_name(&best[0]), "a_b_c");

        assert!(find_stories_by_topic(root, "q", 5).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_exact_directory_name_wins_over_overlap() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path();
        fs::create_dir_all(root.join("a_b_mouse"))?;
        fs::create_dir_all(root.join("b_mouse"))?;

        let resolved = resolve_story(root, "b_mouse").await?;
        let continued =
            find_story_for_continuation(root, "continue the story about b_mouse").await?;
        assert_eq!(resolved.map(|p| dir_name(&p)).as_deref(), Some("b_mouse"));
        assert_eq!(continued.map(|p| dir_name(&p)).as_deref(), Some("b_mouse"));
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_story_ignores_relative_paths() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path().join("stories");
        fs::create_dir_all(root.join("owl"))?;

        assert_eq!(resolve_story(&root, "..").await?, None);
        assert_eq!(resolve_story(&root, ".").await?, None);
        assert_eq!(resolve_story(&root, "owl").await?, Some(root.join("owl")));
        Ok(())
    }

    #[tokio::test]
    async fn test_continuation_falls_back_to_most_recent() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path();
        assert!(find_story_for_continuation(root, "keep going").await?.is_none());

        fs::create_dir_all(root.join("old_story"))?;
        std::thread::sleep(std::time::Duration::from_millis(50));
        fs::create_dir_all(root.join("new_story"))?;

        let found = find_story_for_continuation(root, "keep going").await?;
        assert_eq!(found.map(|p| dir_name(&p)).as_deref(), Some("new_story"));

        let by_topic = find_story_for_continuation(root, "continue the story about old").await?;
        assert_eq!(by_topic.map(|p| dir_name(&p)).as_deref(), Some("old_story"));
        Ok(())
    }

    #[tokio::test]
    async fn test_paragraph_indices_and_context() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let story = temp_dir.path().join("fox");
        fs::create_dir_all(&story)?;
        assert_eq!(load_story_context(&story, 2).await?.next_index, 0);

        for i in 0..4 {
            write_paragraph(&story, i, &format!("Paragraph {}\n\n", i)).await?;
        }
        fs::write(story.join("paragraph_2.mp3"), b"audio")?;
        fs::write(story.join("notes.txt"), b"ignored")?;
        write_info(
            &story,
            &StoryInfo {
                query: "a fox".to_string(),
                ..Default::default()
            },
        )
        .await?;

        assert_eq!(paragraph_indices(&story).await?, vec![0, 1, 2, 3]);
        assert_eq!(cached_paragraph_count(&story).await?, 4);

        let context = load_story_context(&story, 2).await?;
        assert_eq!(context.original_query.as_deref(), Some("a fox"));
        assert_eq!(context.paragraphs, vec!["Paragraph 2", "Paragraph 3"]);
        assert_eq!(context.next_index, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_cached_count_stops_at_gap() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let story = temp_dir.path();
        write_paragraph(story, 0, "a").await?;
        write_paragraph(story, 1, "b").await?;
        write_paragraph(story, 3, "d").await?;
        assert_eq!(cached_paragraph_count(story).await?, 2);
        assert_eq!(load_story_context(story, 10).await?.next_index, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_list_and_remove_audio() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path();
        let story = root.join("the_sleepy_owl");
        fs::create_dir_all(&story)?;
        write_paragraph(&story, 0, "Hoot.\n\n").await?;
        fs::write(paragraph_audio_path(&story, 0, "mp3"), b"audio")?;

        assert_eq!(resolve_story(root, "the_sleepy_owl").await?, Some(story.clone()));
        assert_eq!(resolve_story(root, "owl").await?, Some(story.clone()));
        assert_eq!(resolve_story(root, "penguin").await?, None);

        let stories = list_stories(root).await?;
        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].paragraph_count, 1);
        assert!(stories[0].query.is_none());

        assert_eq!(remove_audio(&story, "mp3").await?, 1);
        assert!(!paragraph_audio_path(&story, 0, "mp3").exists());
        assert!(paragraph_text_path(&story, 0).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_clear_paragraphs_keeps_info() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let story = temp_dir.path();
        write_info(story, &StoryInfo::default()).await?;
        write_paragraph(story, 0, "a").await?;
        write_paragraph(story, 1, "b").await?;
        fs::write(paragraph_audio_path(story, 1, "wav"), b"RIFF")?;

        assert_eq!(clear_paragraphs(story, "wav").await?, 2);
        assert!(paragraph_indices(story).await?.is_empty());
        assert!(!paragraph_audio_path(story, 1, "wav").exists());
        assert!(info_path(story).exists());
        Ok(())
    }
}
