//! Target-language rules for experiment code.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Extension hints checked before asking the classifier.
///
/// Order matters: it is also the lookup order for code files that sit next to
/// an idea file.
pub const EXTENSION_HINTS: &[(&str, TargetLanguage)] = &[
    ("py", TargetLanguage::Python),
    ("ipynb", TargetLanguage::Python),
    ("cpp", TargetLanguage::Cpp),
    ("cc", TargetLanguage::Cpp),
    ("cxx", TargetLanguage::Cpp),
    ("hpp", TargetLanguage::Cpp),
];

/// Language the experiment code is generated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetLanguage {
    Python,
    Cpp,
}

impl TargetLanguage {
    /// Human-readable label used inside prompts.
    pub fn label(self) -> &'static str {
        match self {
            TargetLanguage::Python => "Python",
            TargetLanguage::Cpp => "C++",
        }
    }

    /// Markdown code-fence tag.
    pub fn code_fence(self) -> &'static str {
        match self {
            TargetLanguage::Python => "python",
            TargetLanguage::Cpp => "cpp",
        }
    }

    /// Whether the parallel-agent prompts must be rewritten for this language.
    pub fn requires_adaptation(self) -> bool {
        matches!(self, TargetLanguage::Cpp)
    }

    /// Execution-language flag handed to the experiment runner config.
    pub fn execution_language(self) -> &'static str {
        self.code_fence()
    }

    /// Entry-point file the experiment runner writes and executes.
    pub fn agent_file_name(self) -> &'static str {
        match self {
            TargetLanguage::Python => "runfile.py",
            TargetLanguage::Cpp => "runfile.cpp",
        }
    }

    /// Template describing the build environment, when the default one does not apply.
    pub fn env_packages_template(self) -> Option<&'static str> {
        match self {
            TargetLanguage::Python => None,
            TargetLanguage::Cpp => {
                Some("treesearch/parallel_agent/language_adapter/environment_packages_cpp")
            }
        }
    }

    /// Language implied by a code file extension, if it is a known one.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        EXTENSION_HINTS
            .iter()
            .find(|(hint, _)| *hint == ext)
            .map(|(_, language)| *language)
    }

    /// Interpret a free-form classifier answer.
    ///
    /// Anything mentioning `cpp` or `c++` (any case) selects C++; every other
    /// answer, including an empty one, falls back to Python.
    pub fn from_decision(response: &str) -> Self {
        let decision = response.trim().to_lowercase();
        if decision.contains("cpp") || decision.contains("c++") {
            TargetLanguage::Cpp
        } else {
            TargetLanguage::Python
        }
    }
}

impl fmt::Display for TargetLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpp_family_extensions_select_cpp() {
        for name in ["a.cpp", "b.cc", "c.cxx", "d.hpp", "E.CPP"] {
            assert_eq!(
                TargetLanguage::from_path(Path::new(name)),
                Some(TargetLanguage::Cpp),
                "{name}"
            );
        }
    }

    #[test]
    fn script_extensions_select_python() {
        assert_eq!(
            TargetLanguage::from_path(Path::new("ideas/x.py")),
            Some(TargetLanguage::Python)
        );
        assert_eq!(
            TargetLanguage::from_path(Path::new("x.ipynb")),
            Some(TargetLanguage::Python)
        );
    }

    #[test]
    fn unknown_or_missing_extension_has_no_hint() {
        assert_eq!(TargetLanguage::from_path(Path::new("x.rs")), None);
        assert_eq!(TargetLanguage::from_path(Path::new("Makefile")), None);
    }

    #[test]
    fn classifier_answers_are_permissive() {
        for answer in ["CPP", " cpp ", "C++", "use c++ please"] {
            assert_eq!(
                TargetLanguage::from_decision(answer),
                TargetLanguage::Cpp,
                "{answer:?}"
            );
        }
        for answer in ["python", "PY", "", "rust"] {
            assert_eq!(
                TargetLanguage::from_decision(answer),
                TargetLanguage::Python,
                "{answer:?}"
            );
        }
    }

    #[test]
    fn derived_values_follow_language() {
        let cpp = TargetLanguage::Cpp;
        assert_eq!(cpp.label(), "C++");
        assert_eq!(cpp.code_fence(), "cpp");
        assert!(cpp.requires_adaptation());
        assert_eq!(cpp.agent_file_name(), "runfile.cpp");
        assert!(cpp.env_packages_template().is_some());

        let py = TargetLanguage::Python;
        assert_eq!(py.execution_language(), "python");
        assert!(!py.requires_adaptation());
        assert_eq!(py.env_packages_template(), None);
    }
}
