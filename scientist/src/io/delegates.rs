//! Contracts for the external collaborators the pipeline drives.
//!
//! Each trait is one narrow call the pipeline blocks on. [`CommandDelegates`]
//! implements all of them by running one configured command per contract;
//! tests use the scripted collaborators from `test_support` instead.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::language::TargetLanguage;
use crate::io::config::DelegateConfig;
use crate::io::process::{CommandOutput, run_command};
use crate::io::prompt_store::PROMPT_DIR_ENV;

pub const MODEL_ENV: &str = "SCIENTIST_MODEL";
pub const SYSTEM_PROMPT_ENV: &str = "SCIENTIST_SYSTEM_PROMPT";
pub const TEMPERATURE_ENV: &str = "SCIENTIST_TEMPERATURE";

/// Paper length variant produced by the writeup delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WriteupVariant {
    /// Full conference paper.
    Normal,
    /// Short workshop paper.
    Icbinb,
}

impl WriteupVariant {
    pub fn page_limit(self) -> u32 {
        match self {
            WriteupVariant::Normal => 8,
            WriteupVariant::Icbinb => 4,
        }
    }
}

/// One text-generation call (classification or prompt rewriting).
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: String,
    pub system: String,
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterializeRequest {
    pub base_config: PathBuf,
    pub run_dir: PathBuf,
    pub idea_path: PathBuf,
    pub language: TargetLanguage,
    pub agent_file_name: String,
    pub env_packages_template: Option<String>,
    pub prompt_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentRequest {
    pub config_path: PathBuf,
    pub run_dir: PathBuf,
    pub prompt_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlotRequest {
    pub run_dir: PathBuf,
    pub prompt_dir: PathBuf,
    pub model: String,
    pub n_reflections: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CitationRequest {
    pub run_dir: PathBuf,
    pub prompt_dir: PathBuf,
    pub variant: WriteupVariant,
    pub model: String,
    pub rounds: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteupRequest {
    pub run_dir: PathBuf,
    pub prompt_dir: PathBuf,
    pub variant: WriteupVariant,
    pub small_model: String,
    pub big_model: String,
    pub page_limit: u32,
    pub citations: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewRequest {
    pub pdf_path: PathBuf,
    pub run_dir: PathBuf,
    pub prompt_dir: PathBuf,
    pub model: String,
}

pub trait TextGenerator {
    fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

pub trait ConfigMaterializer {
    /// Produce the run-specific experiment config and return its path.
    fn materialize(&self, request: &MaterializeRequest) -> Result<PathBuf>;
}

pub trait ExperimentRunner {
    /// Block until the experiment run completes.
    fn run_experiments(&self, request: &ExperimentRequest) -> Result<()>;
}

pub trait PlotAggregator {
    fn aggregate_plots(&self, request: &PlotRequest) -> Result<()>;
}

pub trait Writer {
    fn gather_citations(&self, request: &CitationRequest) -> Result<Option<String>>;
    /// Returns whether the paper was produced.
    fn write_paper(&self, request: &WriteupRequest) -> Result<bool>;
}

pub trait Reviewer {
    fn review_text(&self, request: &ReviewRequest) -> Result<Value>;
    fn review_figures(&self, request: &ReviewRequest) -> Result<Value>;
}

/// Usage snapshots written to the run directory.
pub trait UsageTracker {
    fn summary(&self) -> Value;
    fn interactions(&self) -> Value;
}

/// A recorded text-generation call.
#[derive(Debug, Clone, Serialize)]
pub struct Interaction {
    pub timestamp: String,
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub response: String,
}

/// In-memory record of text-generation calls.
#[derive(Debug, Default)]
pub struct UsageLog {
    interactions: RefCell<Vec<Interaction>>,
}

impl UsageLog {
    pub fn record(&self, request: &GenerationRequest, response: &str) {
        self.interactions.borrow_mut().push(Interaction {
            timestamp: chrono::Local::now().to_rfc3339(),
            model: request.model.clone(),
            system: request.system.clone(),
            prompt: request.prompt.clone(),
            response: response.to_string(),
        });
    }
}

impl UsageTracker for UsageLog {
    fn summary(&self) -> Value {
        let interactions = self.interactions.borrow();
        let mut per_model: BTreeMap<&str, (u64, u64, u64)> = BTreeMap::new();
        for item in &*interactions {
            let entry = per_model.entry(item.model.as_str()).or_default();
            entry.0 += 1;
            entry.1 += item.prompt.chars().count() as u64 + item.system.chars().count() as u64;
            entry.2 += item.response.chars().count() as u64;
        }
        let models: serde_json::Map<String, Value> = per_model
            .into_iter()
            .map(|(model, (calls, prompt_chars, completion_chars))| {
                (
                    model.to_string(),
                    json!({
                        "calls": calls,
                        "prompt_chars": prompt_chars,
                        "completion_chars": completion_chars,
                    }),
                )
            })
            .collect();
        Value::Object(models)
    }

    fn interactions(&self) -> Value {
        serde_json::to_value(&*self.interactions.borrow()).unwrap_or(Value::Array(Vec::new()))
    }
}

/// Collaborators backed by external commands.
///
/// Requests are sent as JSON on stdin (the generator gets the raw prompt) and the
/// snapshot prompt directory is exported as `SCIENTIST_PROMPT_DIR`. Output of
/// delegates that receive a run directory is appended to
/// `<run_dir>/delegate_logs/<name>.log`.
#[derive(Debug)]
pub struct CommandDelegates {
    config: DelegateConfig,
    usage: UsageLog,
}

impl CommandDelegates {
    pub fn new(config: DelegateConfig) -> Self {
        Self {
            config,
            usage: UsageLog::default(),
        }
    }

    fn spawn(
        &self,
        name: &str,
        argv: &[String],
        stdin: &[u8],
        envs: &[(&str, String)],
        log_dir: Option<&Path>,
    ) -> Result<CommandOutput> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            anyhow!("delegate `{name}` is not configured (set delegates.{name} in scientist.toml)")
        })?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        for (key, value) in envs {
            cmd.env(key, value);
        }

        info!(delegate = name, program = %program, "invoking delegate");
        let output = run_command(cmd, Some(stdin), self.config.output_limit())
            .with_context(|| format!("run delegate `{name}`"))?;

        if let Some(dir) = log_dir
            && let Err(err) = append_delegate_log(dir, name, &output)
        {
            warn!(delegate = name, err = format!("{err:#}"), "failed to write delegate log");
        }
        Ok(output)
    }

    fn invoke<T: Serialize>(
        &self,
        name: &str,
        argv: &[String],
        request: &T,
        run_dir: &Path,
        prompt_dir: &Path,
    ) -> Result<CommandOutput> {
        let payload = serde_json::to_vec(request).context("serialize delegate request")?;
        let envs = [(PROMPT_DIR_ENV, prompt_dir.display().to_string())];
        let log_dir = run_dir.join("delegate_logs");
        self.spawn(name, argv, &payload, &envs, Some(&log_dir))
    }
}

fn ensure_success(name: &str, output: &CommandOutput) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    bail!(
        "delegate `{name}` failed with status {:?}: {}",
        output.status.code(),
        output.stderr_tail(20)
    )
}

/// Reject stdout cut at `output_limit_bytes`; a partial answer must not be used as a whole one.
fn ensure_complete(name: &str, output: &CommandOutput) -> Result<()> {
    if output.stdout_truncated == 0 {
        return Ok(());
    }
    bail!(
        "delegate `{name}` stdout exceeded the output limit ({} bytes truncated)",
        output.stdout_truncated
    )
}

fn parse_json_or_text(stdout: &str) -> Value {
    serde_json::from_str(stdout.trim()).unwrap_or_else(|_| Value::String(stdout.to_string()))
}

fn append_delegate_log(dir: &Path, name: &str, output: &CommandOutput) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create delegate log dir {}", dir.display()))?;
    let path = dir.join(format!("{name}.log"));
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open delegate log {}", path.display()))?;
    let mut buf = String::new();
    buf.push_str(&format!(
        "=== {} exit={:?} ===\n",
        chrono::Local::now().to_rfc3339(),
        output.status.code()
    ));
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    if output.stdout_truncated > 0 {
        buf.push_str(&format!("\n[stdout truncated {} bytes]", output.stdout_truncated));
    }
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    if output.stderr_truncated > 0 {
        buf.push_str(&format!("\n[stderr truncated {} bytes]", output.stderr_truncated));
    }
    buf.push('\n');
    file.write_all(buf.as_bytes())
        .with_context(|| format!("write delegate log {}", path.display()))
}

impl TextGenerator for CommandDelegates {
    #[instrument(skip_all, fields(model = %request.model))]
    fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let envs = [
            (MODEL_ENV, request.model.clone()),
            (SYSTEM_PROMPT_ENV, request.system.clone()),
            (TEMPERATURE_ENV, request.temperature.to_string()),
        ];
        let output = self.spawn(
            "generate",
            &self.config.generate,
            request.prompt.as_bytes(),
            &envs,
            None,
        )?;
        ensure_success("generate", &output)?;
        ensure_complete("generate", &output)?;
        let response = output.stdout_lossy();
        self.usage.record(request, &response);
        debug!(response_bytes = response.len(), "generation finished");
        Ok(response)
    }
}

impl ConfigMaterializer for CommandDelegates {
    fn materialize(&self, request: &MaterializeRequest) -> Result<PathBuf> {
        let output = self.invoke(
            "materialize_config",
            &self.config.materialize_config,
            request,
            &request.run_dir,
            &request.prompt_dir,
        )?;
        ensure_success("materialize_config", &output)?;
        ensure_complete("materialize_config", &output)?;
        let stdout = output.stdout_lossy();
        let path = stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .ok_or_else(|| anyhow!("delegate `materialize_config` printed no config path"))?;
        Ok(PathBuf::from(path))
    }
}

impl ExperimentRunner for CommandDelegates {
    fn run_experiments(&self, request: &ExperimentRequest) -> Result<()> {
        let output = self.invoke(
            "run_experiments",
            &self.config.run_experiments,
            request,
            &request.run_dir,
            &request.prompt_dir,
        )?;
        ensure_success("run_experiments", &output)
    }
}

impl PlotAggregator for CommandDelegates {
    fn aggregate_plots(&self, request: &PlotRequest) -> Result<()> {
        let output = self.invoke(
            "aggregate_plots",
            &self.config.aggregate_plots,
            request,
            &request.run_dir,
            &request.prompt_dir,
        )?;
        ensure_success("aggregate_plots", &output)
    }
}

impl Writer for CommandDelegates {
    fn gather_citations(&self, request: &CitationRequest) -> Result<Option<String>> {
        let output = self.invoke(
            "gather_citations",
            &self.config.gather_citations,
            request,
            &request.run_dir,
            &request.prompt_dir,
        )?;
        ensure_success("gather_citations", &output)?;
        ensure_complete("gather_citations", &output)?;
        let citations = output.stdout_lossy();
        Ok((!citations.trim().is_empty()).then_some(citations))
    }

    fn write_paper(&self, request: &WriteupRequest) -> Result<bool> {
        let output = self.invoke(
            "writeup",
            &self.config.writeup,
            request,
            &request.run_dir,
            &request.prompt_dir,
        )?;
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "writeup delegate reported failure");
        }
        Ok(output.status.success())
    }
}

impl Reviewer for CommandDelegates {
    fn review_text(&self, request: &ReviewRequest) -> Result<Value> {
        let output = self.invoke(
            "review_text",
            &self.config.review_text,
            request,
            &request.run_dir,
            &request.prompt_dir,
        )?;
        ensure_success("review_text", &output)?;
        ensure_complete("review_text", &output)?;
        Ok(parse_json_or_text(&output.stdout_lossy()))
    }

    fn review_figures(&self, request: &ReviewRequest) -> Result<Value> {
        let output = self.invoke(
            "review_figures",
            &self.config.review_figures,
            request,
            &request.run_dir,
            &request.prompt_dir,
        )?;
        ensure_success("review_figures", &output)?;
        ensure_complete("review_figures", &output)?;
        Ok(parse_json_or_text(&output.stdout_lossy()))
    }
}

impl UsageTracker for CommandDelegates {
    fn summary(&self) -> Value {
        self.usage.summary()
    }

    fn interactions(&self) -> Value {
        self.usage.interactions()
    }
}
