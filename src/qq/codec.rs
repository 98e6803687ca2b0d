use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no {0} command configured")]
    NotConfigured(&'static str),

    #[error("codec process failed: {0}")]
    Process(String),
}

/// Voice messages on QQ use silk; Matrix clients expect ogg/opus.
#[async_trait]
pub trait AudioCodec: Send + Sync {
    async fn silk_to_ogg(&self, data: Vec<u8>) -> Result<Vec<u8>, CodecError>;
    async fn ogg_to_silk(&self, data: Vec<u8>) -> Result<Vec<u8>, CodecError>;
}

pub type SharedAudioCodec = Arc<dyn AudioCodec>;

/// Pipes audio through external converter commands reading stdin and
/// writing stdout.
pub struct CommandCodec {
    decoder: Vec<String>,
    encoder: Vec<String>,
}

impl CommandCodec {
    pub fn new(decoder: &str, encoder: &str) -> Self {
        Self {
            decoder: split_command(decoder),
            encoder: split_command(encoder),
        }
    }

    async fn run(
        command: &[String],
        kind: &'static str,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, CodecError> {
        let (program, args) = command
            .split_first()
            .ok_or(CodecError::NotConfigured(kind))?;

        debug!(program = %program, input_len = data.len(), "Running audio {}", kind);
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CodecError::Process(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CodecError::Process("stdin unavailable".to_string()))?;
        let writer = tokio::spawn(async move {
            stdin.write_all(&data).await?;
            stdin.shutdown().await
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CodecError::Process(e.to_string()))?;
        writer
            .await
            .map_err(|e| CodecError::Process(e.to_string()))?
            .map_err(|e| CodecError::Process(e.to_string()))?;

        if !output.status.success() {
            return Err(CodecError::Process(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl AudioCodec for CommandCodec {
    async fn silk_to_ogg(&self, data: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Self::run(&self.decoder, "silk decoder", data).await
    }

    async fn ogg_to_silk(&self, data: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Self::run(&self.encoder, "silk encoder", data).await
    }
}

fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_codec_reports_missing_command() {
        let codec = CommandCodec::new("", "");
        let err = codec.silk_to_ogg(vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, CodecError::NotConfigured("silk decoder")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_codec_pipes_through_process() {
        let codec = CommandCodec::new("cat", "cat");
        let out = codec.ogg_to_silk(b"voice".to_vec()).await.expect("cat should echo");
        assert_eq!(out, b"voice");
    }
}
