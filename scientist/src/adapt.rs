//! Per-run prompt snapshot and language adaptation.
//!
//! The canonical template tree is copied into `<run_dir>/prompt`. When the
//! target language needs it, every parallel-agent prompt in the snapshot is
//! rewritten by the text generator using the `change_prompt` instruction. The
//! canonical tree is never modified.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::context;
use tracing::{debug, info, instrument};

use crate::core::language::TargetLanguage;
use crate::io::config::AdapterSettings;
use crate::io::delegates::{GenerationRequest, TextGenerator};
use crate::io::fs_tree::{copy_dir_recursive, files_with_extension};
use crate::io::prompt_store::{PromptNotFoundError, PromptStore};

/// Subtree of the prompt tree that is rewritten for non-Python targets.
pub const ADAPTED_SUBTREE: &str = "treesearch/parallel_agent";
/// Adapter templates under [`ADAPTED_SUBTREE`]; never rewritten.
pub const ADAPTER_DIR: &str = "language_adapter";
pub const CHANGE_PROMPT_TEMPLATE: &str = "treesearch/parallel_agent/language_adapter/change_prompt";

pub const PROMPT_ADAPTER_SYSTEM_MESSAGE: &str = "You are a meticulous prompt editor. Follow the user instructions exactly and return only the rewritten prompt text. Do not include explanations.";

/// Result of preparing the run's prompt snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSnapshot {
    pub dir: PathBuf,
    /// Template names rewritten in the snapshot, in rewrite order.
    pub rewritten: Vec<String>,
}

/// Copy the store's canonical tree into `<run_dir>/prompt` and adapt it for `language`.
#[instrument(skip_all, fields(run_dir = %run_dir.display(), %language))]
pub fn prepare_prompt_snapshot(
    run_dir: &Path,
    language: TargetLanguage,
    settings: &AdapterSettings,
    store: &PromptStore,
    generator: &dyn TextGenerator,
) -> Result<PromptSnapshot> {
    let dir = run_dir.join("prompt");
    copy_dir_recursive(store.root(), &dir)
        .with_context(|| format!("snapshot prompts into {}", dir.display()))?;
    info!(snapshot = %dir.display(), "prompt snapshot created");

    let rewritten = if language.requires_adaptation() {
        adapt_snapshot(&dir, language, settings, store, generator)?
    } else {
        Vec::new()
    };
    Ok(PromptSnapshot { dir, rewritten })
}

/// Rewrite every adaptable template under `snapshot` for `language`.
pub fn adapt_snapshot(
    snapshot: &Path,
    language: TargetLanguage,
    settings: &AdapterSettings,
    store: &PromptStore,
    generator: &dyn TextGenerator,
) -> Result<Vec<String>> {
    let subtree = snapshot.join(ADAPTED_SUBTREE);
    if !subtree.is_dir() {
        info!(subtree = %subtree.display(), "nothing to adapt");
        return Ok(Vec::new());
    }

    let instruction = load_instruction(snapshot, language, store)?;
    let mut rewritten = Vec::new();
    for rel in files_with_extension(&subtree, "txt")? {
        if rel.starts_with(ADAPTER_DIR) {
            continue;
        }
        let name = Path::new(ADAPTED_SUBTREE)
            .join(&rel)
            .to_string_lossy()
            .replace('\\', "/");
        let original = store.load_from(&name, snapshot)?;
        let prompt = match &instruction {
            Some(instruction) => format!("{instruction}{original}"),
            None => original,
        };

        debug!(template = %name, "rewriting prompt");
        let response = generator
            .generate(&GenerationRequest {
                prompt,
                model: settings.model.clone(),
                system: PROMPT_ADAPTER_SYSTEM_MESSAGE.to_string(),
                temperature: settings.temp,
            })
            .with_context(|| format!("rewrite prompt {name}"))?;
        store.write(&name, &normalize_newlines(&response), Some(snapshot))?;
        rewritten.push(name);
    }

    info!(count = rewritten.len(), language = %language, "prompts adapted");
    Ok(rewritten)
}

/// Rendered `change_prompt` instruction, or `None` if the snapshot has none.
fn load_instruction(
    snapshot: &Path,
    language: TargetLanguage,
    store: &PromptStore,
) -> Result<Option<String>> {
    let rendered = match store.format_from(
        CHANGE_PROMPT_TEMPLATE,
        snapshot,
        context! {
            language_label => language.label(),
            code_fence => language.code_fence(),
            language_lower => language.label().to_lowercase(),
        },
    ) {
        Ok(text) => text,
        Err(err) if err.downcast_ref::<PromptNotFoundError>().is_some() => {
            debug!("no change_prompt instruction in snapshot");
            return Ok(None);
        }
        Err(err) => return Err(err),
    };
    let trimmed = rendered.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(format!("{trimmed}\n")))
    }
}

fn normalize_newlines(text: &str) -> String {
    format!("{}\n", text.trim_matches('\n'))
}
