//! `scientist`: launch one research experiment end to end.
//!
//! Loads an idea, detects the implementation language, prepares the run's
//! prompt snapshot, then drives the configured delegates through experiments,
//! plots, writeup and review. Leftover processes are reaped before exit.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use scientist::exit_codes;
use scientist::io::config::{PipelineConfig, load_config};
use scientist::io::delegates::{CommandDelegates, WriteupVariant};
use scientist::io::prompt_store::PromptStore;
use scientist::io::reaper::{Reaper, SystemProcessTable};
use scientist::logging;
use scientist::pipeline::{Collaborators, Pipeline, PipelineOptions};

#[derive(Parser, Debug)]
#[command(
    name = "scientist",
    version,
    about = "Run an automated research experiment for one idea"
)]
struct Cli {
    /// Launcher configuration (TOML). Missing file means defaults.
    #[arg(long, default_value = "scientist.toml")]
    config: PathBuf,

    /// Paper variant to write.
    #[arg(long, value_enum, default_value = "icbinb")]
    writeup_type: WriteupVariant,

    /// JSON file holding the pregenerated idea list.
    #[arg(long, default_value = "ideas/i_cant_believe_its_not_better.json")]
    load_ideas: PathBuf,

    /// Attach a code file that sits next to the idea file (same stem).
    #[arg(long)]
    load_code: bool,

    /// Index of the idea to run.
    #[arg(long, default_value_t = 0)]
    idea_idx: usize,

    /// Attach the dataset reference snippet to the idea.
    #[arg(long)]
    add_dataset_ref: bool,

    /// Number of writeup attempts.
    #[arg(long, default_value_t = 3)]
    writeup_retries: u32,

    /// Attempt id, used to tell parallel runs of the same idea apart.
    #[arg(long, default_value_t = 0)]
    attempt_id: u32,

    /// Model for plot aggregation.
    #[arg(long, default_value = "o3-mini-2025-01-31")]
    model_agg_plots: String,

    /// Number of reflections for plot aggregation.
    #[arg(long, default_value_t = 5)]
    model_agg_plots_ref: u32,

    /// Model for the writeup.
    #[arg(long, default_value = "o1-preview-2024-09-12")]
    model_writeup: String,

    /// Smaller model for the writeup.
    #[arg(long, default_value = "gpt-4o-2024-05-13")]
    model_writeup_small: String,

    /// Model for citation gathering.
    #[arg(long, default_value = "gpt-4o-2024-11-20")]
    model_citation: String,

    /// Number of citation rounds.
    #[arg(long, default_value_t = 20)]
    num_cite_rounds: u32,

    /// Model for the paper review.
    #[arg(long, default_value = "gpt-4o-2024-11-20")]
    model_review: String,

    /// Skip the writeup (also skips review).
    #[arg(long)]
    skip_writeup: bool,

    /// Skip the review.
    #[arg(long)]
    skip_review: bool,
}

impl Cli {
    fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            ideas_path: self.load_ideas.clone(),
            idea_idx: self.idea_idx,
            load_code: self.load_code,
            add_dataset_ref: self.add_dataset_ref,
            attempt_id: self.attempt_id,
            writeup_variant: self.writeup_type,
            writeup_retries: self.writeup_retries,
            model_agg_plots: self.model_agg_plots.clone(),
            model_agg_plots_ref: self.model_agg_plots_ref,
            model_writeup: self.model_writeup.clone(),
            model_writeup_small: self.model_writeup_small.clone(),
            model_citation: self.model_citation.clone(),
            num_cite_rounds: self.num_cite_rounds,
            model_review: self.model_review.clone(),
            skip_writeup: self.skip_writeup,
            skip_review: self.skip_review,
        }
    }
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::from(exit_codes::OK as u8),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(exit_codes::FAILED as u8)
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config: PipelineConfig =
        load_config(&cli.config).with_context(|| format!("load {}", cli.config.display()))?;
    let delegates = CommandDelegates::new(config.delegates.clone());
    let store = PromptStore::from_env();
    info!(prompt_root = %store.root().display(), "using prompt templates");
    let reaper = Reaper::new(Box::new(SystemProcessTable::new()), &config.reaper);

    let mut pipeline = Pipeline::new(
        &config,
        cli.pipeline_options(),
        store,
        Collaborators::uniform(&delegates),
        reaper,
    );
    let outcome = pipeline.run()?;
    info!(
        run_dir = %outcome.run_dir.display(),
        language = %outcome.language,
        "experiment finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_defaults() {
        let cli = Cli::parse_from(["scientist"]);
        assert_eq!(cli.config, PathBuf::from("scientist.toml"));
        assert_eq!(cli.pipeline_options(), PipelineOptions::default());
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::parse_from([
            "scientist",
            "--writeup-type",
            "normal",
            "--load-ideas",
            "ideas/mine.json",
            "--load-code",
            "--idea-idx",
            "2",
            "--attempt-id",
            "7",
            "--skip-review",
        ]);
        let options = cli.pipeline_options();
        assert_eq!(options.writeup_variant, WriteupVariant::Normal);
        assert_eq!(options.ideas_path, PathBuf::from("ideas/mine.json"));
        assert!(options.load_code);
        assert_eq!(options.idea_idx, 2);
        assert_eq!(options.attempt_id, 7);
        assert!(options.skip_review);
        assert!(!options.skip_writeup);
    }

    #[test]
    fn rejects_unknown_writeup_type() {
        assert!(Cli::try_parse_from(["scientist", "--writeup-type", "journal"]).is_err());
    }
}
