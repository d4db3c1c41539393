use std::sync::Arc;

use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

use feed_sync::artifact::{ContentType, ImageParameters, TextParameters};
use feed_sync::catalog::{HttpCatalog, ModelCatalog};
use feed_sync::cli::{render_artifact, Args, CliEdits, Command, GenerateArgs};
use feed_sync::config::FeedConfig;
use feed_sync::controller::ControllerOptions;
use feed_sync::generate::{Generator, HttpGenerator};
use feed_sync::mode::Mode;
use feed_sync::panel::Panel;
use feed_sync::stream::{FeedHub, HubStream, StreamSource};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("feed_sync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = FeedConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Watch {
            content_type,
            limit,
        } => {
            let hub = FeedHub::install(config)?;
            match content_type {
                ContentType::Image => watch::<ImageParameters>(hub, limit, args.json).await?,
                ContentType::Text => watch::<TextParameters>(hub, limit, args.json).await?,
            }
        }
        Command::Generate(generate_args) => match generate_args.content_type {
            ContentType::Image => {
                generate::<ImageParameters>(&config, &generate_args, args.json).await?
            }
            ContentType::Text => {
                generate::<TextParameters>(&config, &generate_args, args.json).await?
            }
        },
        Command::Models { content_type } => {
            let models = HttpCatalog::new(&config).list_models(content_type).await?;
            for model in models.iter() {
                if args.json {
                    println!("{}", serde_json::to_string(model)?);
                } else if model.name == model.id {
                    println!("{}", model.id.bright_cyan());
                } else {
                    println!("{} {}", model.id.bright_cyan(), model.name.bright_white());
                }
            }
        }
    }

    Ok(())
}

/// Print every displayed artifact until `limit` arrivals or Ctrl-C.
async fn watch<P>(
    hub: &FeedHub,
    limit: Option<u64>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>>
where
    P: HubStream,
    HttpGenerator: Generator<P>,
{
    let panel = Panel::<P>::open(hub);
    let mut display = panel.subscribe_display();

    if !json {
        println!(
            "{} {}",
            "Watching".bright_cyan().bold(),
            hub.config().feed_url(P::CONTENT_TYPE).bright_white()
        );
        println!("{}", "=".repeat(50).bright_blue());
    }

    loop {
        tokio::select! {
            changed = display.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = display.borrow_and_update().clone();
                if let Some(artifact) = current {
                    let total = panel.total();
                    if json {
                        println!("{}", serde_json::to_string(&*artifact)?);
                    } else {
                        println!("{}", render_artifact(&artifact, Some(total)));
                    }
                    if limit.is_some_and(|n| total >= n) {
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if !json {
        println!("\n{}", "=".repeat(50).bright_blue());
        println!("Received {} artifacts.", panel.total());
    }
    Ok(())
}

/// One override submission through a panel that is not attached to the feed.
async fn generate<P>(
    config: &FeedConfig,
    args: &GenerateArgs,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>>
where
    P: CliEdits,
    HttpGenerator: Generator<P>,
{
    let catalog = Arc::new(HttpCatalog::new(config));
    let panel = Panel::<P>::new(
        StreamSource::detached(),
        Arc::new(HttpGenerator::new(config)),
        ControllerOptions::from_config(config).with_catalog(catalog),
    );

    panel.set_mode(Mode::Edit);
    for edit in P::edits(args) {
        panel.set_param(edit)?;
    }
    panel.submit()?;
    panel.controller().wait_idle().await;

    let Some(artifact) = panel.displayed() else {
        return Err("generation produced no artifact".into());
    };
    if json {
        println!("{}", serde_json::to_string(&*artifact)?);
    } else {
        println!("{}", render_artifact(&artifact, None));
    }
    if artifact.is_error() {
        std::process::exit(1);
    }
    Ok(())
}
