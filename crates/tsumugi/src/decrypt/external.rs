use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tokio::process::Command;

use super::is_valid_kid_key_pair;
use crate::{
    error::{TsumugiError, TsumugiResult},
    key::ContentKey,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecryptTool {
    #[default]
    Mp4decrypt,
    ShakaPackager,
}

impl DecryptTool {
    pub fn binary_name(&self) -> &'static str {
        match self {
            Self::Mp4decrypt => "mp4decrypt",
            Self::ShakaPackager => "shaka-packager",
        }
    }
}

/// Decrypts a fully assembled CENC file with an external tool.
#[derive(Debug, Clone)]
pub struct ExternalDecryptor {
    tool: DecryptTool,
    binary: PathBuf,
}

impl ExternalDecryptor {
    /// Use `binary` when given, otherwise look the tool up in `PATH`.
    pub fn new(tool: DecryptTool, binary: Option<PathBuf>) -> TsumugiResult<Self> {
        let binary = match binary {
            Some(binary) => binary,
            None => which::which(tool.binary_name())?,
        };
        Ok(Self { tool, binary })
    }

    pub fn tool(&self) -> DecryptTool {
        self.tool
    }

    fn command(&self, keys: &[ContentKey], input: &Path, output: &Path) -> Command {
        let mut command = Command::new(&self.binary);
        match self.tool {
            DecryptTool::Mp4decrypt => {
                for key in keys {
                    command.arg("--key").arg(key.to_pair());
                }
                command.arg(input).arg(output);
            }
            DecryptTool::ShakaPackager => {
                command
                    .arg("--quiet")
                    .arg("--enable_raw_key_decryption")
                    .arg({
                        let mut stream = OsString::from("input=");
                        stream.push(input.as_os_str());
                        stream.push(",stream=0,output=");
                        stream.push(output.as_os_str());
                        stream
                    });
                for key in keys {
                    command
                        .arg("--keys")
                        .arg(format!("key_id={}:key={}", key.kid, key.key));
                }
            }
        }
        command
    }

    /// Decrypt `input` into `output`. A non-zero exit status or a missing or
    /// empty output file is an error.
    pub async fn decrypt_file(
        &self,
        keys: &[ContentKey],
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> TsumugiResult<()> {
        let (input, output) = (input.as_ref(), output.as_ref());
        if keys.is_empty() {
            return Err(TsumugiError::DecryptionError(
                "no key to decrypt with".to_string(),
            ));
        }
        if let Some(key) = keys.iter().find(|k| !is_valid_kid_key_pair(&k.kid, &k.key)) {
            return Err(TsumugiError::InvalidKeyPair(key.to_pair()));
        }

        tracing::info!(
            "Decrypting {} with {}",
            input.display(),
            self.tool.binary_name()
        );
        let result = self.command(keys, input, output).output().await?;
        if !result.status.success() {
            return Err(TsumugiError::DecryptionError(format!(
                "{} exited with {}: {}",
                self.tool.binary_name(),
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }

        let size = tokio::fs::metadata(output)
            .await
            .map(|m| m.len())
            .unwrap_or_default();
        if size == 0 {
            return Err(TsumugiError::DecryptionError(format!(
                "{} produced no output",
                self.tool.binary_name()
            )));
        }

        tracing::debug!("Decrypted {} ({size} bytes)", output.display());
        Ok(())
    }
}
