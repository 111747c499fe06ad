//! Prompt template store.
//!
//! Templates are text files addressed by a relative name. A name without an
//! extension resolves to `<name>.txt`. Cached reads go through the store root;
//! `*_from` reads take an explicit root and bypass the cache, which is how the
//! per-run snapshot is read while the store still points at the canonical tree.
//!
//! The cache lives in a `RefCell`, so a store is confined to one thread and one
//! pipeline. Any `write` clears the whole cache, not only the written key.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Environment variable overriding the canonical template root.
pub const PROMPT_DIR_ENV: &str = "SCIENTIST_PROMPT_DIR";
/// Extension appended to names that have none.
pub const DEFAULT_EXTENSION: &str = "txt";

/// A requested template file does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptNotFoundError {
    pub path: PathBuf,
}

impl fmt::Display for PromptNotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prompt file not found: {}", self.path.display())
    }
}

impl std::error::Error for PromptNotFoundError {}

/// Resolve a template name against `root`.
pub fn resolve_prompt_path(root: &Path, name: &str) -> PathBuf {
    let rel = Path::new(name);
    if rel.extension().is_some() {
        root.join(rel)
    } else {
        root.join(rel).with_extension(DEFAULT_EXTENSION)
    }
}

/// Canonical template root.
///
/// `$SCIENTIST_PROMPT_DIR` wins. Otherwise a `prompt/` directory beside the running
/// executable or its parent directory (`bin/../prompt`), and finally the checkout the
/// binary was built from.
pub fn default_prompt_root() -> PathBuf {
    if let Some(dir) = std::env::var_os(PROMPT_DIR_ENV)
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| prompt_root_near(&exe))
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("prompt"))
}

/// `prompt/` in the executable's directory or the one above it.
pub fn prompt_root_near(exe: &Path) -> Option<PathBuf> {
    exe.ancestors()
        .skip(1)
        .take(2)
        .map(|dir| dir.join("prompt"))
        .find(|candidate| candidate.is_dir())
}

#[derive(Debug)]
pub struct PromptStore {
    root: PathBuf,
    cache: RefCell<HashMap<String, String>>,
}

impl PromptStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Store rooted at [`default_prompt_root`].
    pub fn from_env() -> Self {
        Self::new(default_prompt_root())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Point the store at another root. Clears the cache.
    pub fn repoint(&mut self, root: impl Into<PathBuf>) {
        self.root = root.into();
        self.cache.get_mut().clear();
        debug!(root = %self.root.display(), "prompt store re-pointed");
    }

    /// Load a template through the cache.
    pub fn load(&self, name: &str) -> Result<String> {
        if let Some(text) = self.cache.borrow().get(name) {
            return Ok(text.clone());
        }
        let text = read_template(&resolve_prompt_path(&self.root, name))?;
        self.cache
            .borrow_mut()
            .insert(name.to_string(), text.clone());
        Ok(text)
    }

    /// Load and render a template with named bindings.
    pub fn format<B: Serialize>(&self, name: &str, bindings: B) -> Result<String> {
        let text = self.load(name)?;
        render_template(name, &text, bindings)
    }

    /// Load a template as lines, keeping indentation and blank lines.
    pub fn load_lines(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.load(name)?.lines().map(str::to_string).collect())
    }

    /// Load a template and parse it as JSON.
    pub fn load_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let text = self.load(name)?;
        serde_json::from_str(&text).with_context(|| format!("parse prompt json {name}"))
    }

    /// Read a template from an explicit root, bypassing the cache.
    pub fn load_from(&self, name: &str, root: &Path) -> Result<String> {
        read_template(&resolve_prompt_path(root, name))
    }

    /// [`load_from`](Self::load_from) followed by rendering.
    pub fn format_from<B: Serialize>(&self, name: &str, root: &Path, bindings: B) -> Result<String> {
        let text = self.load_from(name, root)?;
        render_template(name, &text, bindings)
    }

    /// Write a template verbatim (under `root` if given) and clear the whole cache.
    pub fn write(&self, name: &str, content: &str, root: Option<&Path>) -> Result<PathBuf> {
        let path = resolve_prompt_path(root.unwrap_or(self.root.as_path()), name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create prompt dir {}", parent.display()))?;
        }
        fs::write(&path, content).with_context(|| format!("write prompt {}", path.display()))?;
        self.cache.borrow_mut().clear();
        debug!(path = %path.display(), "prompt written, cache cleared");
        Ok(path)
    }

    /// Whether `name` is currently memoized.
    pub fn is_cached(&self, name: &str) -> bool {
        self.cache.borrow().contains_key(name)
    }
}

fn read_template(path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(PromptNotFoundError {
            path: path.to_path_buf(),
        }
        .into());
    }
    fs::read_to_string(path).with_context(|| format!("read prompt {}", path.display()))
}

fn render_template<B: Serialize>(name: &str, text: &str, bindings: B) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    // Templates are prompt text; keep their trailing newline.
    env.set_keep_trailing_newline(true);
    let template = env
        .template_from_str(text)
        .with_context(|| format!("parse prompt template {name}"))?;
    template
        .render(bindings)
        .with_context(|| format!("render prompt template {name}"))
}
