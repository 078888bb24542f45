use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use ff2zim_core::contract::{ContentKind, Minifier};
use ff2zim_core::error::MinifyError;

/// Pipes content through the `minify` command-line tool.
pub struct CommandMinifier {
    program: String,
}

impl CommandMinifier {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn type_flag(kind: ContentKind) -> &'static str {
        match kind {
            ContentKind::Html => "html",
        }
    }
}

#[async_trait]
impl Minifier for CommandMinifier {
    async fn minify(&self, content: &str, kind: ContentKind) -> Result<String, MinifyError> {
        let mut child = Command::new(&self.program)
            .args(["--type", Self::type_flag(kind)])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MinifyError::new(format!("could not run {}: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| MinifyError::new("minify stdin unavailable"))?;
        let input = content.to_owned();
        // Written concurrently so a full stdout pipe cannot stall the child.
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(input.as_bytes()).await;
            drop(stdin);
            result
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| MinifyError::new(format!("minify did not finish: {e}")))?;
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(MinifyError::new(format!("could not write to minify: {e}"))),
            Err(e) => return Err(MinifyError::new(format!("minify writer panicked: {e}"))),
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MinifyError::new(format!(
                "minify exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        let minified = String::from_utf8(output.stdout)
            .map_err(|e| MinifyError::new(format!("minify produced invalid UTF-8: {e}")))?;
        debug!(before = content.len(), after = minified.len(), "Minified content");
        Ok(minified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_program_is_a_minify_error() {
        let minifier = CommandMinifier::new("ff2zim-no-such-minify");
        let err = minifier.minify("<p>x</p>", ContentKind::Html).await.unwrap_err();
        assert!(err.reason.contains("could not run"));
    }

    #[test]
    fn story_pages_are_minified_as_html() {
        assert_eq!(CommandMinifier::type_flag(ContentKind::Html), "html");
    }
}
