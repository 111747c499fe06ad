//! Language detection for the selected idea.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::context;
use tracing::{debug, info, instrument};

use crate::core::idea::Idea;
use crate::core::language::TargetLanguage;
use crate::io::config::AdapterSettings;
use crate::io::delegates::{GenerationRequest, TextGenerator};
use crate::io::prompt_store::PromptStore;

pub const LANGUAGE_DECIDER_TEMPLATE: &str =
    "treesearch/parallel_agent/language_adapter/language_decider";

pub const LANGUAGE_DECIDER_SYSTEM_MESSAGE: &str = "You choose the implementation language for an automated research experiment. Respond with a single token: either `python` or `cpp`.";

/// Decide the experiment language.
///
/// A code file with a known extension decides on its own; otherwise the idea is
/// sent to the text generator through the `language_decider` template.
#[instrument(skip_all, fields(code_path = ?code_path))]
pub fn detect_language(
    idea: &Idea,
    code_path: Option<&Path>,
    settings: &AdapterSettings,
    store: &PromptStore,
    generator: &dyn TextGenerator,
) -> Result<TargetLanguage> {
    if let Some(language) = code_path.and_then(TargetLanguage::from_path) {
        info!(%language, "language chosen from code file extension");
        return Ok(language);
    }

    let prompt = store
        .format(
            LANGUAGE_DECIDER_TEMPLATE,
            context! { idea_json => idea.to_pretty_json() },
        )
        .context("render language decider prompt")?;
    let response = generator
        .generate(&GenerationRequest {
            prompt,
            model: settings.model.clone(),
            system: LANGUAGE_DECIDER_SYSTEM_MESSAGE.to_string(),
            temperature: settings.temp,
        })
        .context("language classification")?;

    let language = TargetLanguage::from_decision(&response);
    debug!(response = response.trim(), %language, "classifier answered");
    info!(%language, "language chosen by classifier");
    Ok(language)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedGenerator, idea_from, write_prompt_fixture};
    use serde_json::json;

    fn settings() -> AdapterSettings {
        AdapterSettings {
            model: "classifier".to_string(),
            temp: 0.2,
        }
    }

    #[test]
    fn known_extension_skips_classifier() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_prompt_fixture(temp.path());
        let store = PromptStore::new(temp.path());
        let generator = ScriptedGenerator::constant("cpp");
        let idea = idea_from(json!({"Name": "n"}));

        let language = detect_language(
            &idea,
            Some(Path::new("ideas/n.py")),
            &settings(),
            &store,
            &generator,
        )
        .expect("detect");
        assert_eq!(language, TargetLanguage::Python);
        assert!(generator.calls().is_empty());
    }

    #[test]
    fn classifier_is_asked_with_idea_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_prompt_fixture(temp.path());
        let store = PromptStore::new(temp.path());
        let generator = ScriptedGenerator::constant("  C++ please\n");
        let idea = idea_from(json!({"Name": "kernels", "Title": "Fast kernels"}));

        let language =
            detect_language(&idea, Some(Path::new("notes.md")), &settings(), &store, &generator)
                .expect("detect");
        assert_eq!(language, TargetLanguage::Cpp);

        let calls = generator.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].model, "classifier");
        assert_eq!(calls[0].temperature, 0.2);
        assert_eq!(calls[0].system, LANGUAGE_DECIDER_SYSTEM_MESSAGE);
        assert!(calls[0].prompt.contains("\"Title\": \"Fast kernels\""));
    }

    #[test]
    fn unexpected_answer_defaults_to_python() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_prompt_fixture(temp.path());
        let store = PromptStore::new(temp.path());
        let generator = ScriptedGenerator::constant("rust");
        let idea = idea_from(json!({"Name": "n"}));

        let language =
            detect_language(&idea, None, &settings(), &store, &generator).expect("detect");
        assert_eq!(language, TargetLanguage::Python);
    }

    #[test]
    fn missing_decider_template_is_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = PromptStore::new(temp.path());
        let generator = ScriptedGenerator::constant("python");
        let idea = idea_from(json!({"Name": "n"}));

        let err = detect_language(&idea, None, &settings(), &store, &generator).unwrap_err();
        assert!(
            err.downcast_ref::<crate::io::prompt_store::PromptNotFoundError>()
                .is_some()
        );
        assert!(generator.calls().is_empty());
    }
}
