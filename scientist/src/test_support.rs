//! Scripted collaborators and fixtures for pipeline tests.

use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::core::idea::Idea;
use crate::io::delegates::{
    CitationRequest, ConfigMaterializer, ExperimentRequest, ExperimentRunner, GenerationRequest,
    MaterializeRequest, PlotAggregator, PlotRequest, ReviewRequest, Reviewer, TextGenerator,
    UsageLog, UsageTracker, Writer, WriteupRequest,
};
use crate::io::reaper::{ProcessEntry, ProcessTable};

type Responder = Box<dyn Fn(&GenerationRequest) -> Result<String>>;

/// Text generator that answers through a closure and records every request.
pub struct ScriptedGenerator {
    respond: Responder,
    calls: RefCell<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(respond: impl Fn(&GenerationRequest) -> Result<String> + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Always answer `response`.
    pub fn constant(response: &str) -> Self {
        let response = response.to_string();
        Self::new(move |_| Ok(response.clone()))
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.borrow().clone()
    }
}

impl TextGenerator for ScriptedGenerator {
    fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.calls.borrow_mut().push(request.clone());
        (self.respond)(request)
    }
}

/// Every non-generation collaborator, scripted.
///
/// `write_paper` pops the next scripted result (default `false`); a successful
/// attempt drops the configured PDFs into the run directory.
pub struct FakeDelegates {
    pub config_path: PathBuf,
    writeup_results: RefCell<VecDeque<Result<bool>>>,
    pdfs_on_success: Vec<String>,
    calls: RefCell<Vec<String>>,
    materialize_requests: RefCell<Vec<MaterializeRequest>>,
    writeup_requests: RefCell<Vec<WriteupRequest>>,
    plot_requests: RefCell<Vec<PlotRequest>>,
    usage: UsageLog,
}

impl FakeDelegates {
    pub fn new(writeup_results: Vec<Result<bool>>) -> Self {
        Self {
            config_path: PathBuf::from("/tmp/materialized_config.yaml"),
            writeup_results: RefCell::new(writeup_results.into()),
            pdfs_on_success: vec!["paper_reflection_final_page_limit.pdf".to_string()],
            calls: RefCell::new(Vec::new()),
            materialize_requests: RefCell::new(Vec::new()),
            writeup_requests: RefCell::new(Vec::new()),
            plot_requests: RefCell::new(Vec::new()),
            usage: UsageLog::default(),
        }
    }

    /// PDFs written on a successful writeup (none means no reviewable artifact).
    pub fn with_pdfs(mut self, names: &[&str]) -> Self {
        self.pdfs_on_success = names.iter().map(|name| name.to_string()).collect();
        self
    }

    /// Collaborator calls in order, by contract name.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn materialize_requests(&self) -> Vec<MaterializeRequest> {
        self.materialize_requests.borrow().clone()
    }

    pub fn writeup_requests(&self) -> Vec<WriteupRequest> {
        self.writeup_requests.borrow().clone()
    }

    pub fn plot_requests(&self) -> Vec<PlotRequest> {
        self.plot_requests.borrow().clone()
    }

    fn record(&self, name: &str) {
        self.calls.borrow_mut().push(name.to_string());
    }
}

impl ConfigMaterializer for FakeDelegates {
    fn materialize(&self, request: &MaterializeRequest) -> Result<PathBuf> {
        self.record("materialize");
        self.materialize_requests.borrow_mut().push(request.clone());
        Ok(self.config_path.clone())
    }
}

impl ExperimentRunner for FakeDelegates {
    fn run_experiments(&self, request: &ExperimentRequest) -> Result<()> {
        self.record("run_experiments");
        let results = request.run_dir.join("logs/0-run/experiment_results");
        fs::create_dir_all(&results)?;
        fs::write(results.join("metrics.json"), "{}")?;
        Ok(())
    }
}

impl PlotAggregator for FakeDelegates {
    fn aggregate_plots(&self, request: &PlotRequest) -> Result<()> {
        self.record("aggregate_plots");
        if !request.run_dir.join("experiment_results/metrics.json").is_file() {
            return Err(anyhow!("experiment results were not copied before aggregation"));
        }
        self.plot_requests.borrow_mut().push(request.clone());
        Ok(())
    }
}

impl Writer for FakeDelegates {
    fn gather_citations(&self, _request: &CitationRequest) -> Result<Option<String>> {
        self.record("gather_citations");
        Ok(Some("@article{ref}".to_string()))
    }

    fn write_paper(&self, request: &WriteupRequest) -> Result<bool> {
        self.record("write_paper");
        self.writeup_requests.borrow_mut().push(request.clone());
        let result = self
            .writeup_results
            .borrow_mut()
            .pop_front()
            .unwrap_or(Ok(false));
        if matches!(result, Ok(true)) {
            for name in &self.pdfs_on_success {
                fs::write(request.run_dir.join(name), b"%PDF-1.4")?;
            }
        }
        result
    }
}

impl Reviewer for FakeDelegates {
    fn review_text(&self, request: &ReviewRequest) -> Result<Value> {
        self.record("review_text");
        Ok(json!({
            "pdf": request.pdf_path.file_name().and_then(|n| n.to_str()),
            "Overall": 6,
        }))
    }

    fn review_figures(&self, _request: &ReviewRequest) -> Result<Value> {
        self.record("review_figures");
        Ok(json!({"figures": []}))
    }
}

impl UsageTracker for FakeDelegates {
    fn summary(&self) -> Value {
        self.usage.summary()
    }

    fn interactions(&self) -> Value {
        self.usage.interactions()
    }
}

/// Observable state of a [`FakeProcessTable`].
#[derive(Debug, Default)]
pub struct FakeTableState {
    pub entries: Vec<ProcessEntry>,
    pub terminated: Vec<u32>,
    pub killed: Vec<u32>,
    pub list_calls: u32,
    stubborn: BTreeSet<u32>,
    refuse_terminate: BTreeSet<u32>,
    refuse_kill: BTreeSet<u32>,
    failing_lists: u32,
}

/// In-memory process table. Terminated processes exit unless marked stubborn.
pub struct FakeProcessTable {
    current: u32,
    state: Rc<RefCell<FakeTableState>>,
}

impl FakeProcessTable {
    pub fn new(current: u32, entries: Vec<ProcessEntry>) -> Self {
        Self {
            current,
            state: Rc::new(RefCell::new(FakeTableState {
                entries,
                ..FakeTableState::default()
            })),
        }
    }

    /// Shared handle for assertions after the table moves into a reaper.
    pub fn state(&self) -> Rc<RefCell<FakeTableState>> {
        Rc::clone(&self.state)
    }

    /// Ignore SIGTERM for `pid`.
    pub fn make_stubborn(&mut self, pid: u32) {
        self.state.borrow_mut().stubborn.insert(pid);
    }

    /// Fail SIGTERM for `pid` as if permission were denied.
    pub fn refuse_terminate(&mut self, pid: u32) {
        self.state.borrow_mut().refuse_terminate.insert(pid);
    }

    /// Fail SIGKILL for `pid`.
    pub fn refuse_kill(&mut self, pid: u32) {
        self.state.borrow_mut().refuse_kill.insert(pid);
    }

    /// Fail the next `count` calls to `list`.
    pub fn fail_lists(&mut self, count: u32) {
        self.state.borrow_mut().failing_lists = count;
    }

    fn remove(state: &mut FakeTableState, pid: u32) {
        state.entries.retain(|entry| entry.pid != pid);
    }
}

impl ProcessTable for FakeProcessTable {
    fn current_pid(&self) -> u32 {
        self.current
    }

    fn list(&mut self) -> Result<Vec<ProcessEntry>> {
        let mut state = self.state.borrow_mut();
        state.list_calls += 1;
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(anyhow!("process table unavailable"));
        }
        Ok(state.entries.clone())
    }

    fn terminate(&mut self, pid: u32) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.entries.iter().any(|entry| entry.pid == pid) {
            return Err(anyhow!("process {pid} not found"));
        }
        if state.refuse_terminate.contains(&pid) {
            return Err(anyhow!("permission denied for {pid}"));
        }
        state.terminated.push(pid);
        if !state.stubborn.contains(&pid) {
            Self::remove(&mut state, pid);
        }
        Ok(())
    }

    fn kill(&mut self, pid: u32) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.entries.iter().any(|entry| entry.pid == pid) {
            return Err(anyhow!("process {pid} not found"));
        }
        if state.refuse_kill.contains(&pid) {
            return Err(anyhow!("permission denied for {pid}"));
        }
        state.killed.push(pid);
        Self::remove(&mut state, pid);
        Ok(())
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        self.state
            .borrow()
            .entries
            .iter()
            .any(|entry| entry.pid == pid)
    }
}

/// Build an [`Idea`] from a JSON object literal.
pub fn idea_from(value: Value) -> Idea {
    match value {
        Value::Object(fields) => Idea::new(fields),
        other => panic!("idea must be a JSON object, got {other}"),
    }
}

/// Write a minimal canonical prompt tree under `root`.
///
/// Layout: two adaptable parallel-agent prompts (one nested), the three
/// adapter templates, and one prompt outside the adapted subtree.
pub fn write_prompt_fixture(root: &Path) {
    let files = [
        (
            "treesearch/parallel_agent/draft.txt",
            "Write the draft in Python.\n",
        ),
        (
            "treesearch/parallel_agent/improve/debug.txt",
            "Debug the Python script.\n",
        ),
        (
            "treesearch/parallel_agent/language_adapter/change_prompt.txt",
            "Rewrite for {{ language_label }} ({{ code_fence }}, {{ language_lower }}).\n\n",
        ),
        (
            "treesearch/parallel_agent/language_adapter/language_decider.txt",
            "Pick python or cpp for this idea:\n{{ idea_json }}\n",
        ),
        (
            "treesearch/parallel_agent/language_adapter/environment_packages_cpp.txt",
            "g++ with -O2\n",
        ),
        ("treesearch/summary.txt", "Summarize the Python results.\n"),
    ];
    for (name, body) in files {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create prompt fixture dir");
        }
        fs::write(path, body).expect("write prompt fixture");
    }
}

/// Write `ideas` as a JSON idea list at `dir/<file_name>` and return its path.
pub fn write_ideas(dir: &Path, file_name: &str, ideas: Value) -> PathBuf {
    let path = dir.join(file_name);
    fs::write(&path, serde_json::to_string_pretty(&ideas).expect("serialize ideas"))
        .expect("write ideas");
    path
}

/// Temp workspace with a canonical prompt tree and an experiments directory.
pub struct TestWorkspace {
    temp: tempfile::TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        write_prompt_fixture(&temp.path().join("prompt"));
        fs::create_dir_all(temp.path().join("experiments"))?;
        Ok(Self { temp })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn prompt_root(&self) -> PathBuf {
        self.root().join("prompt")
    }

    pub fn experiments_dir(&self) -> PathBuf {
        self.root().join("experiments")
    }

    /// Run directories created so far.
    pub fn run_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(self.experiments_dir())
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|path| path.is_dir())
                    .collect()
            })
            .unwrap_or_default();
        dirs.sort();
        dirs
    }
}
