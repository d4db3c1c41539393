use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use colored::*;

use crate::artifact::{
    Artifact, ContentType, ImageEdit, ImageParameters, Parameters, TextEdit, TextParameters,
};

#[derive(Parser, Debug)]
#[command(name = "feed-sync")]
#[command(version)]
#[command(about = "Follow the live image/text generation feeds, or freeze one and generate your own")]
pub struct Args {
    /// TOML config file (FEED_SYNC_* environment variables still override it)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print artifacts as JSON lines instead of colored text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the live feed with a running total
    Watch {
        #[arg(value_enum)]
        content_type: ContentType,

        /// Stop after this many arrivals
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Submit one generation and print the result
    Generate(GenerateArgs),

    /// List the models available for a content type
    Models {
        #[arg(value_enum)]
        content_type: ContentType,
    },
}

#[derive(ClapArgs, Debug, Clone, PartialEq)]
pub struct GenerateArgs {
    #[arg(value_enum)]
    pub content_type: ContentType,

    /// Prompt text
    #[arg(long, short)]
    pub prompt: String,

    /// Model id or display name
    #[arg(long, short)]
    pub model: Option<String>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Image width in pixels
    #[arg(long)]
    pub width: Option<u32>,

    /// Image height in pixels
    #[arg(long)]
    pub height: Option<u32>,

    /// Let the backend rewrite the prompt (images only)
    #[arg(long)]
    pub enhance: bool,

    /// System message prepended to the conversation (text only)
    #[arg(long)]
    pub system: Option<String>,
}

/// Parameter sets that can be filled in from `generate` arguments.
pub trait CliEdits: Parameters {
    fn edits(args: &GenerateArgs) -> Vec<Self::Edit>;
}

impl CliEdits for ImageParameters {
    fn edits(args: &GenerateArgs) -> Vec<ImageEdit> {
        let mut edits = vec![ImageEdit::Prompt(args.prompt.clone())];
        if let Some(model) = &args.model {
            edits.push(ImageEdit::Model(model.clone()));
        }
        if let Some(seed) = args.seed {
            edits.push(ImageEdit::Seed(seed));
        }
        if let Some(width) = args.width {
            edits.push(ImageEdit::Width(width));
        }
        if let Some(height) = args.height {
            edits.push(ImageEdit::Height(height));
        }
        if args.enhance {
            edits.push(ImageEdit::Enhance(true));
        }
        edits
    }
}

impl CliEdits for TextParameters {
    fn edits(args: &GenerateArgs) -> Vec<TextEdit> {
        let mut edits = Vec::new();
        if let Some(system) = &args.system {
            edits.push(TextEdit::Messages(vec![
                crate::artifact::ChatMessage::system(system.clone()),
            ]));
        }
        edits.push(TextEdit::Prompt(args.prompt.clone()));
        if let Some(model) = &args.model {
            edits.push(TextEdit::Model(model.clone()));
        }
        if let Some(seed) = args.seed {
            edits.push(TextEdit::Seed(Some(seed)));
        }
        edits
    }
}

/// One display line for an artifact.
pub fn render_artifact<P: Parameters>(artifact: &Artifact<P>, total: Option<u64>) -> String {
    let counter = match total {
        Some(n) => format!("#{n:<6}").bright_blue().to_string(),
        None => String::new(),
    };
    let model = format!("[{}]", artifact.params.model()).bright_yellow();
    let body = match (&artifact.result, &artifact.error) {
        (_, Some(error)) => format!("{:?}: {}", error.kind, error.message)
            .bright_red()
            .to_string(),
        (Some(result), None) => {
            let prompt = artifact.params.prompt().bright_white();
            format!("{prompt} {} {}", "->".bright_blue(), result.bright_cyan())
        }
        (None, None) => artifact.params.prompt().bright_white().to_string(),
    };
    format!("{counter}{model} {body}")
}
