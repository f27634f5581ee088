//! Text-to-speech through a command-line synthesizer (espeak-ng by default).

use std::path::Path;

use async_trait::async_trait;
use tokio::fs;

use crate::config::TtsConfig;
use crate::core::error::CollaboratorError;
use crate::domain::AudioRef;

use super::process::{describe_failure, run_command};
use super::{Narrator, VoiceConfig};

pub struct CommandNarrator {
    program: String,
    args: Vec<String>,
    max_chunk_length: usize,
}

impl CommandNarrator {
    pub fn new(config: &TtsConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            max_chunk_length: config.max_chunk_length,
        }
    }

    fn render_args(&self, voice: &VoiceConfig, output: &Path) -> Vec<String> {
        let output = output.display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{output}", &output)
                    .replace("{voice}", &voice.voice)
                    .replace("{rate}", &voice.rate.to_string())
            })
            .collect()
    }
}

#[async_trait]
impl Narrator for CommandNarrator {
    fn max_chunk_length(&self) -> usize {
        self.max_chunk_length
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceConfig,
        output: &Path,
    ) -> Result<AudioRef, CollaboratorError> {
        let chars = text.chars().count();
        if chars == 0 {
            return Err(CollaboratorError::InvalidInput("empty narration chunk".into()));
        }
        if chars > self.max_chunk_length {
            return Err(CollaboratorError::InvalidInput(format!(
                "narration chunk of {} characters exceeds the limit of {}",
                chars, self.max_chunk_length
            )));
        }

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                CollaboratorError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let args = self.render_args(voice, output);
        let result = run_command(&self.program, &args, Some(text.as_bytes())).await?;
        if !result.status.success() {
            return Err(CollaboratorError::Unavailable(describe_failure(&self.program, &result)));
        }

        if !fs::try_exists(output).await.unwrap_or(false) {
            return Err(CollaboratorError::Model(format!(
                "'{}' exited cleanly but wrote no audio to {}",
                self.program,
                output.display()
            )));
        }

        Ok(AudioRef(output.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn voice() -> VoiceConfig {
        VoiceConfig {
            voice: "en-gb".to_string(),
            rate: 150,
        }
    }

    #[test]
    fn test_argument_template() {
        let narrator = CommandNarrator::new(&TtsConfig::default());
        let args = narrator.render_args(&voice(), &PathBuf::from("/tmp/out.wav"));

        assert_eq!(
            args,
            vec!["-v", "en-gb", "-s", "150", "-w", "/tmp/out.wav", "--stdin"]
        );
    }

    #[tokio::test]
    async fn test_oversized_chunk_is_rejected() {
        let narrator = CommandNarrator::new(&TtsConfig {
            max_chunk_length: 5,
            ..Default::default()
        });

        let err = narrator
            .synthesize("far too long", &voice(), Path::new("/tmp/never.wav"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }
}
