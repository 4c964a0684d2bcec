use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    deckify::logging::init("info").context("init logging")?;

    let cli = deckify::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        deckify::cli::Command::Generate(args) => {
            deckify::commands::generate(args).await.context("generate")?;
        }
        deckify::cli::Command::Notebooks(args) => {
            deckify::commands::notebooks(args).await.context("notebooks")?;
        }
        deckify::cli::Command::Sections(args) => {
            deckify::commands::sections(args).await.context("sections")?;
        }
    }

    Ok(())
}
