//! End-to-end launcher pipeline.
//!
//! Phases run strictly in order on the calling thread:
//! `INIT → LOAD_IDEA → DETECT_LANGUAGE → PREPARE_PROMPTS → MATERIALIZE_CONFIG →
//! RUN_EXPERIMENTS → AGGREGATE_PLOTS → CLEANUP_ARTIFACTS → WRITEUP → REVIEW →
//! TEARDOWN → DONE`. Teardown (process reaping) runs whether or not an earlier
//! phase failed; the earlier failure is still returned.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Local};
use jsonschema::Draft;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::adapt::prepare_prompt_snapshot;
use crate::core::artifact::{is_reflection_pdf, select_review_pdf};
use crate::core::idea::{Idea, combine_payload, render_markdown};
use crate::core::language::{EXTENSION_HINTS, TargetLanguage};
use crate::core::retry::{RetryOutcome, retry_bounded};
use crate::detect::detect_language;
use crate::io::config::PipelineConfig;
use crate::io::delegates::{
    CitationRequest, ConfigMaterializer, ExperimentRequest, ExperimentRunner, MaterializeRequest,
    PlotAggregator, PlotRequest, ReviewRequest, Reviewer, TextGenerator, UsageTracker, Writer,
    WriteupRequest, WriteupVariant,
};
use crate::io::fs_tree::{copy_dir_recursive, remove_dir_if_exists};
use crate::io::prompt_store::PromptStore;
use crate::io::reaper::{ReapReport, Reaper};

const IDEA_LIST_SCHEMA: &str = include_str!("../schemas/idea_list.schema.json");

pub const IDEA_MARKDOWN_FILE: &str = "idea.md";
pub const IDEA_JSON_FILE: &str = "idea.json";
pub const USAGE_SUMMARY_FILE: &str = "token_tracker.json";
pub const USAGE_INTERACTIONS_FILE: &str = "token_tracker_interactions.json";
pub const REVIEW_TEXT_FILE: &str = "review_text.txt";
pub const REVIEW_FIGURES_FILE: &str = "review_img_cap_ref.json";
/// Transient copy of the runner's results consumed by plot aggregation.
pub const EXPERIMENT_RESULTS_DIR: &str = "experiment_results";
/// Where the experiment runner leaves its results inside the run directory.
pub const RUNNER_RESULTS_DIR: &str = "logs/0-run/experiment_results";

/// Pipeline phase, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    LoadIdea,
    DetectLanguage,
    PreparePrompts,
    MaterializeConfig,
    RunExperiments,
    AggregatePlots,
    CleanupArtifacts,
    Writeup,
    Review,
    Teardown,
    Done,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::LoadIdea => "LOAD_IDEA",
            Phase::DetectLanguage => "DETECT_LANGUAGE",
            Phase::PreparePrompts => "PREPARE_PROMPTS",
            Phase::MaterializeConfig => "MATERIALIZE_CONFIG",
            Phase::RunExperiments => "RUN_EXPERIMENTS",
            Phase::AggregatePlots => "AGGREGATE_PLOTS",
            Phase::CleanupArtifacts => "CLEANUP_ARTIFACTS",
            Phase::Writeup => "WRITEUP",
            Phase::Review => "REVIEW",
            Phase::Teardown => "TEARDOWN",
            Phase::Done => "DONE",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writeup succeeded but the run directory has no reflection PDF to review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoReviewableArtifact {
    pub run_dir: PathBuf,
}

impl fmt::Display for NoReviewableArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no reflection PDF to review in {}",
            self.run_dir.display()
        )
    }
}

impl std::error::Error for NoReviewableArtifact {}

/// Per-invocation options (the CLI surface).
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub ideas_path: PathBuf,
    pub idea_idx: usize,
    pub load_code: bool,
    pub add_dataset_ref: bool,
    pub attempt_id: u32,
    pub writeup_variant: WriteupVariant,
    pub writeup_retries: u32,
    pub model_agg_plots: String,
    pub model_agg_plots_ref: u32,
    pub model_writeup: String,
    pub model_writeup_small: String,
    pub model_citation: String,
    pub num_cite_rounds: u32,
    pub model_review: String,
    pub skip_writeup: bool,
    pub skip_review: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            ideas_path: PathBuf::from("ideas/i_cant_believe_its_not_better.json"),
            idea_idx: 0,
            load_code: false,
            add_dataset_ref: false,
            attempt_id: 0,
            writeup_variant: WriteupVariant::Icbinb,
            writeup_retries: 3,
            model_agg_plots: "o3-mini-2025-01-31".to_string(),
            model_agg_plots_ref: 5,
            model_writeup: "o1-preview-2024-09-12".to_string(),
            model_writeup_small: "gpt-4o-2024-05-13".to_string(),
            model_citation: "gpt-4o-2024-11-20".to_string(),
            num_cite_rounds: 20,
            model_review: "gpt-4o-2024-11-20".to_string(),
            skip_writeup: false,
            skip_review: false,
        }
    }
}

/// External collaborators the pipeline blocks on.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub generator: &'a dyn TextGenerator,
    pub materializer: &'a dyn ConfigMaterializer,
    pub runner: &'a dyn ExperimentRunner,
    pub plots: &'a dyn PlotAggregator,
    pub writer: &'a dyn Writer,
    pub reviewer: &'a dyn Reviewer,
    pub usage: &'a dyn UsageTracker,
}

impl<'a> Collaborators<'a> {
    /// Use one value for every contract.
    pub fn uniform<T>(delegates: &'a T) -> Self
    where
        T: TextGenerator
            + ConfigMaterializer
            + ExperimentRunner
            + PlotAggregator
            + Writer
            + Reviewer
            + UsageTracker,
    {
        Self {
            generator: delegates,
            materializer: delegates,
            runner: delegates,
            plots: delegates,
            writer: delegates,
            reviewer: delegates,
            usage: delegates,
        }
    }
}

/// Idea selected for this run plus the code found next to it.
#[derive(Debug, Clone)]
pub struct LoadedIdea {
    pub idea: Idea,
    pub code_path: Option<PathBuf>,
    pub code: Option<String>,
    pub dataset_reference: Option<String>,
}

/// Per-run paths and language decisions. Built once per invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_dir: PathBuf,
    pub prompt_dir: PathBuf,
    pub idea_json_path: PathBuf,
    pub language: TargetLanguage,
}

impl RunContext {
    pub fn agent_file_name(&self) -> &'static str {
        self.language.agent_file_name()
    }

    pub fn execution_language(&self) -> &'static str {
        self.language.execution_language()
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub run_dir: PathBuf,
    pub language: TargetLanguage,
    pub config_path: PathBuf,
    /// `None` when the writeup was skipped.
    pub writeup: Option<RetryOutcome>,
    /// PDF that was reviewed, if the review ran.
    pub reviewed_pdf: Option<PathBuf>,
    pub reap: ReapReport,
}

pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    options: PipelineOptions,
    store: PromptStore,
    collaborators: Collaborators<'a>,
    reaper: Reaper,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        options: PipelineOptions,
        store: PromptStore,
        collaborators: Collaborators<'a>,
        reaper: Reaper,
    ) -> Self {
        Self {
            config,
            options,
            store,
            collaborators,
            reaper,
        }
    }

    /// Template store; points at the run's snapshot once prompts are prepared.
    pub fn store(&self) -> &PromptStore {
        &self.store
    }

    /// Run every phase, then tear down.
    pub fn run(&mut self) -> Result<PipelineOutcome> {
        let result = self.run_phases();
        if let Err(err) = &result {
            error!(err = format!("{err:#}"), "pipeline failed");
        }

        enter(Phase::Teardown);
        let reap = self.reaper.reap();

        let mut outcome = result?;
        outcome.reap = reap;
        enter(Phase::Done);
        Ok(outcome)
    }

    fn run_phases(&mut self) -> Result<PipelineOutcome> {
        enter(Phase::Init);
        let settings = self.config.require_adapter_settings()?.clone();

        enter(Phase::LoadIdea);
        let mut loaded = load_idea(&self.options, self.config)?;
        let name = loaded
            .idea
            .name()
            .ok_or_else(|| anyhow!("selected idea has no Name"))?
            .to_string();

        enter(Phase::DetectLanguage);
        let language = detect_language(
            &loaded.idea,
            loaded.code_path.as_deref(),
            &settings,
            &self.store,
            self.collaborators.generator,
        )?;

        let run_dir = create_run_dir(
            &self.config.experiments_dir,
            &name,
            self.options.attempt_id,
            Local::now(),
        )?;

        enter(Phase::PreparePrompts);
        let snapshot = prepare_prompt_snapshot(
            &run_dir,
            language,
            &settings,
            &self.store,
            self.collaborators.generator,
        )?;
        self.store.repoint(&snapshot.dir);
        let ctx = RunContext {
            idea_json_path: run_dir.join(IDEA_JSON_FILE),
            prompt_dir: snapshot.dir,
            run_dir,
            language,
        };
        write_idea_artifacts(&ctx, &mut loaded)?;

        enter(Phase::MaterializeConfig);
        info!(
            language = ctx.execution_language(),
            agent_file = ctx.agent_file_name(),
            "configured prompts for target language"
        );
        let config_path = self
            .collaborators
            .materializer
            .materialize(&MaterializeRequest {
                base_config: self.config.base_config.clone(),
                run_dir: ctx.run_dir.clone(),
                idea_path: ctx.idea_json_path.clone(),
                language: ctx.language,
                agent_file_name: ctx.agent_file_name().to_string(),
                env_packages_template: ctx.language.env_packages_template().map(str::to_string),
                prompt_dir: ctx.prompt_dir.clone(),
            })
            .context("materialize experiment config")?;
        info!(config = %config_path.display(), "experiment config ready");

        enter(Phase::RunExperiments);
        self.collaborators
            .runner
            .run_experiments(&ExperimentRequest {
                config_path: config_path.clone(),
                run_dir: ctx.run_dir.clone(),
                prompt_dir: ctx.prompt_dir.clone(),
            })
            .context("run experiments")?;

        enter(Phase::AggregatePlots);
        self.aggregate_plots(&ctx)?;

        enter(Phase::CleanupArtifacts);
        if remove_dir_if_exists(&ctx.run_dir.join(EXPERIMENT_RESULTS_DIR))? {
            info!("removed transient experiment results copy");
        }
        save_usage_snapshot(&ctx.run_dir, self.collaborators.usage)?;

        let writeup = if self.options.skip_writeup {
            info!("writeup skipped");
            None
        } else {
            enter(Phase::Writeup);
            let outcome = self.writeup(&ctx);
            if !outcome.succeeded {
                warn!(
                    attempts = outcome.attempts,
                    "writeup did not complete successfully after all retries"
                );
            }
            Some(outcome)
        };
        save_usage_snapshot(&ctx.run_dir, self.collaborators.usage)?;

        let reviewed_pdf = match writeup {
            Some(outcome) if outcome.succeeded && !self.options.skip_review => {
                enter(Phase::Review);
                Some(self.review(&ctx)?)
            }
            _ => {
                info!("review skipped");
                None
            }
        };

        Ok(PipelineOutcome {
            run_dir: ctx.run_dir,
            language: ctx.language,
            config_path,
            writeup,
            reviewed_pdf,
            reap: ReapReport::default(),
        })
    }

    fn aggregate_plots(&self, ctx: &RunContext) -> Result<()> {
        let results = ctx.run_dir.join(RUNNER_RESULTS_DIR);
        if results.is_dir() {
            copy_dir_recursive(&results, &ctx.run_dir.join(EXPERIMENT_RESULTS_DIR))
                .context("copy experiment results")?;
        } else {
            info!(path = %results.display(), "no experiment results to copy");
        }
        self.collaborators
            .plots
            .aggregate_plots(&PlotRequest {
                run_dir: ctx.run_dir.clone(),
                prompt_dir: ctx.prompt_dir.clone(),
                model: self.options.model_agg_plots.clone(),
                n_reflections: self.options.model_agg_plots_ref,
            })
            .context("aggregate plots")
    }

    fn writeup(&self, ctx: &RunContext) -> RetryOutcome {
        let variant = self.options.writeup_variant;
        let writer = self.collaborators.writer;
        retry_bounded("writeup", self.options.writeup_retries, |_| {
            let citations = writer
                .gather_citations(&CitationRequest {
                    run_dir: ctx.run_dir.clone(),
                    prompt_dir: ctx.prompt_dir.clone(),
                    variant,
                    model: self.options.model_citation.clone(),
                    rounds: self.options.num_cite_rounds,
                })
                .context("gather citations")?;
            writer
                .write_paper(&WriteupRequest {
                    run_dir: ctx.run_dir.clone(),
                    prompt_dir: ctx.prompt_dir.clone(),
                    variant,
                    small_model: self.options.model_writeup_small.clone(),
                    big_model: self.options.model_writeup.clone(),
                    page_limit: variant.page_limit(),
                    citations,
                })
                .context("write paper")
        })
    }

    #[instrument(skip_all, fields(run_dir = %ctx.run_dir.display()))]
    fn review(&self, ctx: &RunContext) -> Result<PathBuf> {
        let pdf_path = find_review_pdf(&ctx.run_dir)?.ok_or_else(|| NoReviewableArtifact {
            run_dir: ctx.run_dir.clone(),
        })?;
        info!(pdf = %pdf_path.display(), "reviewing paper");

        let request = ReviewRequest {
            pdf_path: pdf_path.clone(),
            run_dir: ctx.run_dir.clone(),
            prompt_dir: ctx.prompt_dir.clone(),
            model: self.options.model_review.clone(),
        };
        let text_review = self
            .collaborators
            .reviewer
            .review_text(&request)
            .context("text review")?;
        let figure_review = self
            .collaborators
            .reviewer
            .review_figures(&request)
            .context("image/caption/reference review")?;

        write_json(&ctx.run_dir.join(REVIEW_TEXT_FILE), &text_review)?;
        write_json(&ctx.run_dir.join(REVIEW_FIGURES_FILE), &figure_review)?;
        info!("paper review completed");
        Ok(pdf_path)
    }
}

fn enter(phase: Phase) {
    info!(phase = phase.as_str(), "entering phase");
}

/// Read the idea list, validate it, select one idea and gather its code payload.
#[instrument(skip_all, fields(ideas = %options.ideas_path.display(), idx = options.idea_idx))]
pub fn load_idea(options: &PipelineOptions, config: &PipelineConfig) -> Result<LoadedIdea> {
    let raw = fs::read_to_string(&options.ideas_path)
        .with_context(|| format!("read {}", options.ideas_path.display()))?;
    let ideas = parse_idea_list(&raw)
        .with_context(|| format!("load ideas from {}", options.ideas_path.display()))?;
    let count = ideas.len();
    let idea = ideas.into_iter().nth(options.idea_idx).ok_or_else(|| {
        anyhow!(
            "idea index {} out of range ({count} ideas in {})",
            options.idea_idx,
            options.ideas_path.display()
        )
    })?;
    info!(name = idea.name().unwrap_or_default(), "idea selected");

    let (code_path, code) = if options.load_code {
        match find_code_file(&options.ideas_path) {
            Some(path) => {
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("read code file {}", path.display()))?;
                info!(path = %path.display(), "loaded code file");
                (Some(path), Some(text))
            }
            None => {
                warn!(
                    expected = %options.ideas_path.with_extension("py").display(),
                    "code file not found"
                );
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let dataset_reference = if options.add_dataset_ref {
        match fs::read_to_string(&config.dataset_reference) {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(
                    path = %config.dataset_reference.display(),
                    err = %err,
                    "dataset reference file not found"
                );
                None
            }
        }
    } else {
        None
    };

    Ok(LoadedIdea {
        idea,
        code_path,
        code,
        dataset_reference,
    })
}

/// Parse and schema-check an idea list.
pub fn parse_idea_list(raw: &str) -> Result<Vec<Idea>> {
    let value: Value = serde_json::from_str(raw).context("parse idea list json")?;
    let schema: Value = serde_json::from_str(IDEA_LIST_SCHEMA).context("parse idea list schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile idea list schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("idea list schema validation failed:\n- {}", messages.join("\n- "));
    }
    serde_json::from_value(value).context("parse ideas")
}

/// First sibling of the idea file with a known code extension.
pub fn find_code_file(ideas_path: &Path) -> Option<PathBuf> {
    EXTENSION_HINTS
        .iter()
        .map(|(ext, _)| ideas_path.with_extension(ext))
        .find(|candidate| candidate.is_file())
}

/// `<experiments_dir>/<YYYY-mm-dd_HH-MM-SS>_<name>_attempt_<id>`
pub fn run_dir_name(name: &str, attempt_id: u32, now: DateTime<Local>) -> String {
    format!(
        "{}_{name}_attempt_{attempt_id}",
        now.format("%Y-%m-%d_%H-%M-%S")
    )
}

fn create_run_dir(
    experiments_dir: &Path,
    name: &str,
    attempt_id: u32,
    now: DateTime<Local>,
) -> Result<PathBuf> {
    let run_dir = experiments_dir.join(run_dir_name(name, attempt_id, now));
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("create run dir {}", run_dir.display()))?;
    info!(run_dir = %run_dir.display(), "results will be saved in run directory");
    Ok(run_dir)
}

/// Attach the code payload and write `idea.md` / `idea.json`.
fn write_idea_artifacts(ctx: &RunContext, loaded: &mut LoadedIdea) -> Result<()> {
    let markdown = render_markdown(
        &loaded.idea,
        loaded.code.as_deref(),
        ctx.language.code_fence(),
    );
    let md_path = ctx.run_dir.join(IDEA_MARKDOWN_FILE);
    fs::write(&md_path, markdown).with_context(|| format!("write {}", md_path.display()))?;

    if let Some(payload) = combine_payload(
        loaded.dataset_reference.as_deref(),
        loaded.code.as_deref(),
    ) {
        loaded.idea.attach_code(payload)?;
    }
    write_json(&ctx.idea_json_path, &loaded.idea)
}

/// Review candidate chosen from the reflection PDFs in `run_dir`.
pub fn find_review_pdf(run_dir: &Path) -> Result<Option<PathBuf>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(run_dir).with_context(|| format!("read {}", run_dir.display()))? {
        let entry = entry.context("read entry")?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str()
            && is_reflection_pdf(name)
        {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(select_review_pdf(names.as_slice()).map(|name| run_dir.join(name)))
}

/// Write the usage summary and interaction log into `run_dir`.
pub fn save_usage_snapshot(run_dir: &Path, usage: &dyn UsageTracker) -> Result<()> {
    write_json(&run_dir.join(USAGE_SUMMARY_FILE), &usage.summary())?;
    write_json(&run_dir.join(USAGE_INTERACTIONS_FILE), &usage.interactions())
}

/// Serialize `value` to pretty-printed JSON with trailing newline.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    fs::write(path, payload).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
