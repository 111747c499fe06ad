//! Full pipeline runs against scripted collaborators.
//!
//! Each test builds a temp workspace (canonical prompt tree + experiments dir),
//! runs `Pipeline::run`, and checks the run directory artifacts, the order of
//! collaborator calls, and that teardown always reached the process table.

use std::fs;
use std::path::Path;

use anyhow::anyhow;
use serde_json::{Value, json};

use scientist::core::language::TargetLanguage;
use scientist::io::config::{AdapterSettings, PipelineConfig, ReaperConfig};
use scientist::io::delegates::WriteupVariant;
use scientist::io::prompt_store::PromptStore;
use scientist::io::reaper::{ProcessEntry, Reaper};
use scientist::pipeline::{Collaborators, NoReviewableArtifact, Pipeline, PipelineOptions};
use scientist::test_support::{
    FakeDelegates, FakeProcessTable, ScriptedGenerator, TestWorkspace, write_ideas,
};

fn config(ws: &TestWorkspace) -> PipelineConfig {
    PipelineConfig {
        experiments_dir: ws.experiments_dir(),
        dataset_reference: ws.root().join("hf_dataset_reference.py"),
        prompt_adapter: Some(AdapterSettings {
            model: "adapter-model".to_string(),
            temp: 0.0,
        }),
        reaper: ReaperConfig {
            grace_secs: 0,
            ..ReaperConfig::default()
        },
        ..PipelineConfig::default()
    }
}

fn process_table() -> FakeProcessTable {
    FakeProcessTable::new(
        100,
        vec![
            ProcessEntry {
                pid: 100,
                parent: Some(1),
                command: "scientist".to_string(),
                name: "scientist".to_string(),
            },
            ProcessEntry {
                pid: 101,
                parent: Some(100),
                command: "sh -c runner".to_string(),
                name: "sh".to_string(),
            },
        ],
    )
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).expect("read json")).expect("parse json")
}

#[test]
fn python_idea_runs_every_phase_and_writes_artifacts() {
    let ws = TestWorkspace::new().expect("workspace");
    let ideas = write_ideas(
        ws.root(),
        "ideas.json",
        json!([
            {"Name": "first", "Title": "First"},
            {"Name": "sparse_attn", "Title": "Sparse attention", "Abstract": "Try k-sparse."}
        ]),
    );
    let config = config(&ws);
    let generator = ScriptedGenerator::constant("python");
    let delegates = FakeDelegates::new(vec![Ok(false), Ok(true)]);
    let table = process_table();
    let table_state = table.state();

    let options = PipelineOptions {
        ideas_path: ideas,
        idea_idx: 1,
        attempt_id: 4,
        writeup_variant: WriteupVariant::Normal,
        ..PipelineOptions::default()
    };
    let collaborators = Collaborators {
        generator: &generator,
        materializer: &delegates,
        runner: &delegates,
        plots: &delegates,
        writer: &delegates,
        reviewer: &delegates,
        usage: &delegates,
    };
    let mut pipeline = Pipeline::new(
        &config,
        options,
        PromptStore::new(ws.prompt_root()),
        collaborators,
        Reaper::new(Box::new(table), &config.reaper),
    );
    let outcome = pipeline.run().expect("pipeline");

    // One classifier call, no prompt rewriting.
    assert_eq!(generator.calls().len(), 1);
    assert_eq!(outcome.language, TargetLanguage::Python);

    let run_dir = &outcome.run_dir;
    assert_eq!(ws.run_dirs(), vec![run_dir.clone()]);
    let dir_name = run_dir.file_name().and_then(|n| n.to_str()).expect("name");
    assert!(dir_name.ends_with("_sparse_attn_attempt_4"), "{dir_name}");
    assert_eq!(pipeline.store().root(), run_dir.join("prompt"));

    assert_eq!(
        delegates.calls(),
        vec![
            "materialize",
            "run_experiments",
            "aggregate_plots",
            "gather_citations",
            "write_paper",
            "gather_citations",
            "write_paper",
            "review_text",
            "review_figures",
        ]
    );
    let materialize = &delegates.materialize_requests()[0];
    assert_eq!(materialize.agent_file_name, "runfile.py");
    assert_eq!(materialize.env_packages_template, None);
    assert_eq!(materialize.idea_path, run_dir.join("idea.json"));
    assert_eq!(materialize.prompt_dir, run_dir.join("prompt"));
    assert_eq!(delegates.plot_requests()[0].n_reflections, 5);
    assert!(delegates.writeup_requests().iter().all(|r| r.page_limit == 8));

    assert!(!run_dir.join("experiment_results").exists());
    assert!(run_dir.join("logs/0-run/experiment_results/metrics.json").is_file());
    assert!(run_dir.join("token_tracker.json").is_file());
    assert!(run_dir.join("token_tracker_interactions.json").is_file());
    assert_eq!(read_json(&run_dir.join("idea.json"))["Name"], "sparse_attn");
    assert!(
        fs::read_to_string(run_dir.join("idea.md"))
            .expect("idea.md")
            .starts_with("# Sparse attention")
    );
    assert_eq!(
        read_json(&run_dir.join("review_text.txt"))["pdf"],
        "paper_reflection_final_page_limit.pdf"
    );
    assert!(run_dir.join("review_img_cap_ref.json").is_file());

    let writeup = outcome.writeup.expect("writeup ran");
    assert!(writeup.succeeded);
    assert_eq!(writeup.attempts, 2);
    assert_eq!(outcome.reap.terminated, vec![101]);
    assert!(table_state.borrow().list_calls >= 2);
}

#[test]
fn cpp_code_file_adapts_snapshot_without_classifier() {
    let ws = TestWorkspace::new().expect("workspace");
    let ideas = write_ideas(ws.root(), "kernels.json", json!([{"Name": "kernels"}]));
    fs::write(ws.root().join("kernels.cpp"), "int main() { return 0; }\n").expect("code");
    fs::write(ws.root().join("hf_dataset_reference.py"), "load_dataset('x')").expect("ds");
    let config = config(&ws);
    let generator = ScriptedGenerator::new(|request| Ok(format!("// cpp\n{}", request.prompt)));
    let delegates = FakeDelegates::new(Vec::new());

    let options = PipelineOptions {
        ideas_path: ideas,
        load_code: true,
        add_dataset_ref: true,
        skip_writeup: true,
        ..PipelineOptions::default()
    };
    let collaborators = Collaborators {
        generator: &generator,
        materializer: &delegates,
        runner: &delegates,
        plots: &delegates,
        writer: &delegates,
        reviewer: &delegates,
        usage: &delegates,
    };
    let mut pipeline = Pipeline::new(
        &config,
        options,
        PromptStore::new(ws.prompt_root()),
        collaborators,
        Reaper::new(Box::new(process_table()), &config.reaper),
    );
    let outcome = pipeline.run().expect("pipeline");
    assert_eq!(outcome.language, TargetLanguage::Cpp);
    assert_eq!(outcome.writeup, None);
    assert_eq!(outcome.reviewed_pdf, None);

    // Only rewrite calls: the extension decided the language.
    let calls = generator.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.model == "adapter-model"));

    let snapshot = outcome.run_dir.join("prompt/treesearch/parallel_agent/draft.txt");
    assert!(
        fs::read_to_string(snapshot)
            .expect("snapshot")
            .starts_with("// cpp\nRewrite for C++")
    );
    assert_eq!(
        fs::read_to_string(ws.prompt_root().join("treesearch/parallel_agent/draft.txt"))
            .expect("canonical"),
        "Write the draft in Python.\n"
    );

    let materialize = &delegates.materialize_requests()[0];
    assert_eq!(materialize.agent_file_name, "runfile.cpp");
    assert_eq!(
        materialize.env_packages_template.as_deref(),
        Some("treesearch/parallel_agent/language_adapter/environment_packages_cpp")
    );

    let idea = read_json(&outcome.run_dir.join("idea.json"));
    assert_eq!(idea["Code"], "load_dataset('x')\nint main() { return 0; }\n");
    let markdown = fs::read_to_string(outcome.run_dir.join("idea.md")).expect("idea.md");
    assert!(markdown.contains("```cpp\nint main() { return 0; }\n```"));
    assert!(!delegates.calls().contains(&"write_paper".to_string()));
}

#[test]
fn exhausted_writeup_skips_review_but_succeeds() {
    let ws = TestWorkspace::new().expect("workspace");
    let ideas = write_ideas(ws.root(), "ideas.json", json!([{"Name": "flaky"}]));
    let config = config(&ws);
    let generator = ScriptedGenerator::constant("python");
    let delegates =
        FakeDelegates::new(vec![Ok(false), Err(anyhow!("latex crashed")), Ok(false)]);

    let options = PipelineOptions {
        ideas_path: ideas,
        ..PipelineOptions::default()
    };
    let collaborators = Collaborators {
        generator: &generator,
        materializer: &delegates,
        runner: &delegates,
        plots: &delegates,
        writer: &delegates,
        reviewer: &delegates,
        usage: &delegates,
    };
    let mut pipeline = Pipeline::new(
        &config,
        options,
        PromptStore::new(ws.prompt_root()),
        collaborators,
        Reaper::new(Box::new(process_table()), &config.reaper),
    );
    let outcome = pipeline.run().expect("pipeline");

    let writeup = outcome.writeup.expect("writeup ran");
    assert!(!writeup.succeeded);
    assert_eq!(writeup.attempts, 3);
    assert!(delegates.writeup_requests().iter().all(|r| r.page_limit == 4));
    assert_eq!(outcome.reviewed_pdf, None);
    assert!(!delegates.calls().contains(&"review_text".to_string()));
    assert!(!outcome.run_dir.join("review_text.txt").exists());
}

#[test]
fn missing_adapter_settings_fails_before_run_dir_and_still_reaps() {
    let ws = TestWorkspace::new().expect("workspace");
    let ideas = write_ideas(ws.root(), "ideas.json", json!([{"Name": "n"}]));
    let config = PipelineConfig {
        prompt_adapter: None,
        ..config(&ws)
    };
    let generator = ScriptedGenerator::constant("python");
    let delegates = FakeDelegates::new(Vec::new());
    let table = process_table();
    let table_state = table.state();

    let collaborators = Collaborators {
        generator: &generator,
        materializer: &delegates,
        runner: &delegates,
        plots: &delegates,
        writer: &delegates,
        reviewer: &delegates,
        usage: &delegates,
    };
    let mut pipeline = Pipeline::new(
        &config,
        PipelineOptions {
            ideas_path: ideas,
            ..PipelineOptions::default()
        },
        PromptStore::new(ws.prompt_root()),
        collaborators,
        Reaper::new(Box::new(table), &config.reaper),
    );
    let err = pipeline.run().unwrap_err();
    assert!(err.to_string().contains("prompt_adapter"));

    assert!(ws.run_dirs().is_empty());
    assert!(generator.calls().is_empty());
    assert!(delegates.calls().is_empty());
    assert_eq!(table_state.borrow().terminated, vec![101]);
}

#[test]
fn writeup_without_pdf_is_no_reviewable_artifact() {
    let ws = TestWorkspace::new().expect("workspace");
    let ideas = write_ideas(ws.root(), "ideas.json", json!([{"Name": "nopdf"}]));
    let config = config(&ws);
    let generator = ScriptedGenerator::constant("python");
    let delegates = FakeDelegates::new(vec![Ok(true)]).with_pdfs(&[]);
    let table = process_table();
    let table_state = table.state();

    let collaborators = Collaborators {
        generator: &generator,
        materializer: &delegates,
        runner: &delegates,
        plots: &delegates,
        writer: &delegates,
        reviewer: &delegates,
        usage: &delegates,
    };
    let mut pipeline = Pipeline::new(
        &config,
        PipelineOptions {
            ideas_path: ideas,
            ..PipelineOptions::default()
        },
        PromptStore::new(ws.prompt_root()),
        collaborators,
        Reaper::new(Box::new(table), &config.reaper),
    );
    let err = pipeline.run().unwrap_err();
    let missing = err
        .downcast_ref::<NoReviewableArtifact>()
        .expect("no reviewable artifact");
    assert_eq!(ws.run_dirs(), vec![missing.run_dir.clone()]);
    // Artifacts written before the failure persist.
    assert!(missing.run_dir.join("idea.json").is_file());
    assert!(missing.run_dir.join("token_tracker.json").is_file());
    assert!(!delegates.calls().contains(&"review_text".to_string()));
    assert_eq!(table_state.borrow().terminated, vec![101]);
}
