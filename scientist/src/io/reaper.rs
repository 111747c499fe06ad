//! Reclaims processes left behind by experiment delegates.
//!
//! Two passes: descendants of this process first, then a keyword sweep over the
//! whole process table. Failures on individual processes are logged at debug
//! level and skipped; reaping never fails the pipeline.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, Signal, System, UpdateKind};
use tracing::{debug, info, instrument};

use crate::io::config::ReaperConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub parent: Option<u32>,
    /// Full command line joined by spaces.
    pub command: String,
    pub name: String,
}

/// Process table operations used by the reaper.
pub trait ProcessTable {
    fn current_pid(&self) -> u32;
    fn list(&mut self) -> Result<Vec<ProcessEntry>>;
    /// Request graceful termination (SIGTERM).
    fn terminate(&mut self, pid: u32) -> Result<()>;
    /// Force termination (SIGKILL).
    fn kill(&mut self, pid: u32) -> Result<()>;
    fn is_alive(&mut self, pid: u32) -> bool;
}

/// [`ProcessTable`] backed by the OS via `sysinfo`.
pub struct SystemProcessTable {
    system: System,
    current: u32,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        let current = sysinfo::get_current_pid()
            .map(Pid::as_u32)
            .unwrap_or_else(|_| std::process::id());
        Self {
            system: System::new(),
            current,
        }
    }

    fn refreshed(&mut self, pid: u32) -> Option<&sysinfo::Process> {
        let pid = Pid::from_u32(pid);
        if !self
            .system
            .refresh_process_specifics(pid, ProcessRefreshKind::new())
        {
            return None;
        }
        self.system.process(pid)
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn current_pid(&self) -> u32 {
        self.current
    }

    fn list(&mut self) -> Result<Vec<ProcessEntry>> {
        // Command lines are re-read on every listing: a pid may have exec'd since the last one.
        self.system
            .refresh_processes_specifics(ProcessRefreshKind::new().with_cmd(UpdateKind::Always));
        let processes = self.system.processes();

        // Linux reports every thread as a process parented to its owner, and a signal sent to a
        // thread id reaches the whole group. Thread entries (kernel threads included) are dropped.
        let mut threads: HashSet<Pid> = HashSet::new();
        for (pid, process) in processes {
            if let Some(tasks) = process.tasks() {
                threads.extend(tasks.iter().copied().filter(|tid| tid != pid));
            }
        }

        let mut entries: Vec<ProcessEntry> = processes
            .iter()
            .filter(|(pid, process)| {
                !threads.contains(*pid)
                    && process.thread_kind().is_none()
                    && process.status() != ProcessStatus::Zombie
            })
            .map(|(_, process)| ProcessEntry {
                pid: process.pid().as_u32(),
                parent: process.parent().map(Pid::as_u32),
                command: process.cmd().join(" "),
                name: process.name().to_string(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.pid);
        Ok(entries)
    }

    fn terminate(&mut self, pid: u32) -> Result<()> {
        let process = self
            .refreshed(pid)
            .ok_or_else(|| anyhow!("process {pid} not found"))?;
        match process.kill_with(Signal::Term) {
            Some(true) => Ok(()),
            Some(false) => Err(anyhow!("SIGTERM to {pid} failed")),
            None => Err(anyhow!("SIGTERM unsupported on this platform")),
        }
    }

    fn kill(&mut self, pid: u32) -> Result<()> {
        let process = self
            .refreshed(pid)
            .ok_or_else(|| anyhow!("process {pid} not found"))?;
        if process.kill() {
            Ok(())
        } else {
            Err(anyhow!("SIGKILL to {pid} failed"))
        }
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        self.refreshed(pid)
            .is_some_and(|process| process.status() != ProcessStatus::Zombie)
    }
}

/// Pids signalled during one reap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Descendants sent SIGTERM.
    pub terminated: Vec<u32>,
    /// Processes (either pass) that needed SIGKILL.
    pub killed: Vec<u32>,
    /// Keyword matches sent SIGTERM.
    pub swept: Vec<u32>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.terminated.is_empty() && self.killed.is_empty() && self.swept.is_empty()
    }
}

/// All transitive descendants of `root`, in ascending pid order.
pub fn descendants(entries: &[ProcessEntry], root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries {
        if let Some(parent) = entry.parent
            && entry.pid != parent
        {
            children.entry(parent).or_default().push(entry.pid);
        }
    }

    let mut found = BTreeSet::new();
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        for &child in children.get(&pid).map(Vec::as_slice).unwrap_or_default() {
            if child != root && found.insert(child) {
                stack.push(child);
            }
        }
    }
    found.into_iter().collect()
}

/// Pids (excluding `current`) whose lowercase command line contains a keyword.
pub fn keyword_matches(entries: &[ProcessEntry], keywords: &[String], current: u32) -> Vec<u32> {
    let keywords: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    entries
        .iter()
        .filter(|entry| entry.pid != current)
        .filter(|entry| {
            let haystack = if entry.command.is_empty() {
                entry.name.to_lowercase()
            } else {
                entry.command.to_lowercase()
            };
            keywords.iter().any(|keyword| haystack.contains(keyword))
        })
        .map(|entry| entry.pid)
        .collect()
}

pub struct Reaper {
    table: Box<dyn ProcessTable>,
    grace: Duration,
    keywords: Vec<String>,
}

impl Reaper {
    pub fn new(table: Box<dyn ProcessTable>, config: &ReaperConfig) -> Self {
        Self {
            table,
            grace: Duration::from_secs(config.grace_secs),
            keywords: config.keywords.clone(),
        }
    }

    /// Terminate descendants, then sweep keyword matches.
    #[instrument(skip_all)]
    pub fn reap(&mut self) -> ReapReport {
        let mut report = ReapReport::default();
        let current = self.table.current_pid();

        match self.table.list() {
            Ok(entries) => {
                let children = descendants(&entries, current);
                if !children.is_empty() {
                    info!(count = children.len(), "terminating child processes");
                }
                let signalled = self.terminate_all(&children);
                report.killed.extend(self.wait_then_kill(&signalled));
                report.terminated = signalled;
            }
            Err(err) => debug!(err = format!("{err:#}"), "failed to list child processes"),
        }

        match self.table.list() {
            Ok(entries) => {
                for pid in keyword_matches(&entries, &self.keywords, current) {
                    let signalled = self.terminate_all(&[pid]);
                    if signalled.is_empty() {
                        continue;
                    }
                    debug!(pid, "terminated orphaned process");
                    report.killed.extend(self.wait_then_kill(&signalled));
                    report.swept.push(pid);
                }
            }
            Err(err) => debug!(err = format!("{err:#}"), "failed to scan process table"),
        }

        if report.is_empty() {
            debug!("no processes to reap");
        } else {
            info!(
                terminated = report.terminated.len(),
                swept = report.swept.len(),
                killed = report.killed.len(),
                "process cleanup finished"
            );
        }
        report
    }

    fn terminate_all(&mut self, pids: &[u32]) -> Vec<u32> {
        let mut signalled = Vec::new();
        for &pid in pids {
            match self.table.terminate(pid) {
                Ok(()) => signalled.push(pid),
                Err(err) => debug!(pid, err = format!("{err:#}"), "terminate failed"),
            }
        }
        signalled
    }

    /// Wait up to the grace period for `pids` to exit, then SIGKILL survivors.
    fn wait_then_kill(&mut self, pids: &[u32]) -> Vec<u32> {
        if pids.is_empty() {
            return Vec::new();
        }
        let deadline = Instant::now() + self.grace;
        let mut alive: Vec<u32> = pids.to_vec();
        loop {
            alive.retain(|&pid| self.table.is_alive(pid));
            if alive.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }

        let mut killed = Vec::new();
        for pid in alive {
            match self.table.kill(pid) {
                Ok(()) => killed.push(pid),
                Err(err) => debug!(pid, err = format!("{err:#}"), "kill failed"),
            }
        }
        killed
    }
}
