//! Launcher configuration stored in `scientist.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Launcher configuration (TOML).
///
/// Missing fields fall back to defaults. `prompt_adapter` has no default: the
/// pipeline refuses to start without it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Base experiment-runner config handed to the materialization delegate.
    pub base_config: PathBuf,

    /// Directory under which run directories are created.
    pub experiments_dir: PathBuf,

    /// Dataset reference snippet attached with `--add-dataset-ref`.
    pub dataset_reference: PathBuf,

    /// Model settings for language classification and prompt rewriting.
    pub prompt_adapter: Option<AdapterSettings>,

    pub reaper: ReaperConfig,

    pub delegates: DelegateConfig,
}

/// Model + sampling temperature used by the language detector and prompt adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterSettings {
    pub model: String,
    #[serde(default)]
    pub temp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReaperConfig {
    /// Seconds to wait after SIGTERM before SIGKILL.
    pub grace_secs: u64,

    /// Command-line substrings marking orphaned experiment processes.
    pub keywords: Vec<String>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            grace_secs: 3,
            keywords: ["python", "torch", "mp", "bfts", "experiment"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Commands backing each external collaborator (argv arrays).
///
/// An empty array means the delegate is not configured; calling it fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DelegateConfig {
    /// Text generation: prompt on stdin, response on stdout.
    pub generate: Vec<String>,
    /// Prints the path of the run-specific experiment config.
    pub materialize_config: Vec<String>,
    /// Runs the tree-search experiments to completion.
    pub run_experiments: Vec<String>,
    pub aggregate_plots: Vec<String>,
    /// Prints gathered citations (BibTeX) on stdout.
    pub gather_citations: Vec<String>,
    /// Exit status reports writeup success.
    pub writeup: Vec<String>,
    /// Prints the text review as JSON.
    pub review_text: Vec<String>,
    /// Prints the image/caption/reference review as JSON.
    pub review_figures: Vec<String>,

    /// Truncate captured delegate stdout/stderr beyond this many bytes.
    pub output_limit_bytes: Option<usize>,
}

impl DelegateConfig {
    pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 10_000_000;

    pub fn output_limit(&self) -> usize {
        self.output_limit_bytes
            .unwrap_or(Self::DEFAULT_OUTPUT_LIMIT_BYTES)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_config: PathBuf::from("bfts_config.yaml"),
            experiments_dir: PathBuf::from("experiments"),
            dataset_reference: PathBuf::from("hf_dataset_reference.py"),
            prompt_adapter: None,
            reaper: ReaperConfig::default(),
            delegates: DelegateConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(adapter) = &self.prompt_adapter {
            if adapter.model.trim().is_empty() {
                return Err(anyhow!("prompt_adapter.model must be non-empty"));
            }
            if !adapter.temp.is_finite() || adapter.temp < 0.0 {
                return Err(anyhow!("prompt_adapter.temp must be a non-negative number"));
            }
        }
        if self.reaper.keywords.iter().any(|k| k.trim().is_empty()) {
            return Err(anyhow!("reaper.keywords must not contain empty entries"));
        }
        if self.delegates.output_limit() == 0 {
            return Err(anyhow!("delegates.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Adapter settings, or the configuration error that stops the pipeline.
    pub fn require_adapter_settings(&self) -> Result<&AdapterSettings> {
        self.prompt_adapter.as_ref().ok_or_else(|| {
            anyhow!("prompt_adapter configuration is required for language inference")
        })
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default_without_adapter() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PipelineConfig::default());
        let err = cfg.require_adapter_settings().unwrap_err();
        assert!(err.to_string().contains("prompt_adapter"));
    }

    #[test]
    fn parses_adapter_and_delegates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("scientist.toml");
        fs::write(
            &path,
            r#"
experiments_dir = "runs"

[prompt_adapter]
model = "gpt-4o-2024-11-20"

[reaper]
grace_secs = 1

[delegates]
generate = ["llm", "--json"]
"#,
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.experiments_dir, PathBuf::from("runs"));
        let adapter = cfg.require_adapter_settings().expect("adapter");
        assert_eq!(adapter.model, "gpt-4o-2024-11-20");
        assert_eq!(adapter.temp, 0.0);
        assert_eq!(cfg.reaper.grace_secs, 1);
        assert_eq!(cfg.reaper.keywords, ReaperConfig::default().keywords);
        assert_eq!(cfg.delegates.generate, vec!["llm", "--json"]);
        assert!(cfg.delegates.writeup.is_empty());
    }

    #[test]
    fn adapter_without_model_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("scientist.toml");
        fs::write(&path, "[prompt_adapter]\ntemp = 0.5\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("model"));
    }

    #[test]
    fn example_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("scientist.example.toml");
        let cfg = load_config(&path).expect("load example");
        assert!(cfg.require_adapter_settings().is_ok());
        assert_eq!(cfg.reaper, ReaperConfig::default());
        assert!(!cfg.delegates.writeup.is_empty());
    }

    #[test]
    fn empty_keyword_is_rejected() {
        let cfg = PipelineConfig {
            reaper: ReaperConfig {
                grace_secs: 3,
                keywords: vec!["python".to_string(), " ".to_string()],
            },
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
