pub mod llm;
pub mod paragraph;
pub mod playback;
pub mod session;
pub mod tts;
pub mod workflow;
