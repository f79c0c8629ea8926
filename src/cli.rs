use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use anyhow::{anyhow, Context as AnyhowContext, Result};

/// Command-line options for the model comparison tool.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Fan one prompt out to several hosted model deployments", long_about = None)]
pub struct CliArgs {
    /// Path to the JSON file holding model profiles and retrieval settings.
    #[arg(long = "config", env = "MODELCMP_CONFIG", value_name = "PATH", default_value = "models.json")]
    pub config: PathBuf,

    /// Prompt text to send to every selected model.
    #[arg(long = "text", conflicts_with_all = ["prompt_file", "stdin_prompt"])]
    pub prompt: Option<String>,

    /// Read the prompt from the specified file.
    #[arg(long = "prompt-file", value_name = "PATH", conflicts_with_all = ["prompt", "stdin_prompt"])]
    pub prompt_file: Option<PathBuf>,

    /// Read the prompt from STDIN (until EOF).
    #[arg(long = "stdin-prompt", action = ArgAction::SetTrue, conflicts_with_all = ["prompt", "prompt_file"])]
    pub stdin_prompt: bool,

    /// Restrict the round to these profile ids (repeatable). Without it, the
    /// profiles marked `selected` in the config file run.
    #[arg(long = "model", value_name = "ID")]
    pub models: Vec<String>,

    /// Ground the prompt in documents retrieved from the search index.
    #[arg(long = "rag", action = ArgAction::SetTrue)]
    pub rag: bool,

    /// Run every model twice, once with and once without retrieval
    /// augmentation (implies `--rag`).
    #[arg(long = "rag-compare", action = ArgAction::SetTrue)]
    pub rag_compare: bool,

    /// Print increments as they arrive instead of only the final panels.
    #[arg(long = "live", action = ArgAction::SetTrue)]
    pub live: bool,

    /// Run the local relay instead of executing a comparison round.
    #[arg(long = "serve", action = ArgAction::SetTrue)]
    pub serve: bool,

    /// Listen address for the relay (requires `--serve`).
    #[arg(long = "listen", value_name = "ADDR", requires = "serve")]
    pub listen: Option<String>,

    /// Connection timeout (seconds) for outbound HTTP requests.
    #[arg(long = "timeout", default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..=300))]
    timeout_secs: u64,
}

impl CliArgs {
    /// Returns the configured connection timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Resolve the prompt text based on CLI inputs. An empty prompt from any
    /// source is a usage error.
    pub fn resolve_prompt(&self) -> Result<String> {
        let prompt = if let Some(prompt) = &self.prompt {
            prompt.clone()
        } else if let Some(path) = &self.prompt_file {
            fs::read_to_string(path)
                .with_context(|| format!("reading prompt file {}", path.display()))?
        } else if self.stdin_prompt {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("reading prompt from stdin")?;
            buf
        } else {
            return Err(anyhow!(
                "no prompt provided; use --text, --prompt-file, or --stdin-prompt"
            ));
        };
        if prompt.trim().is_empty() {
            return Err(anyhow!("prompt is empty"));
        }
        Ok(prompt)
    }
}
