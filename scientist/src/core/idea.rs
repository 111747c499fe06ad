//! Research idea records.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key under which an attached code payload is stored.
pub const CODE_KEY: &str = "Code";
/// Key holding the idea's short identifier (used in run directory names).
pub const NAME_KEY: &str = "Name";

/// One research idea: an ordered key/value record.
///
/// Field order from the source file is preserved so `idea.json` and `idea.md`
/// read the same way the idea author wrote them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Idea {
    #[serde(flatten)]
    fields: Map<String, Value>,
    #[serde(skip)]
    code_attached: bool,
}

impl Idea {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            code_attached: false,
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// The idea's `Name`, if it is a string.
    pub fn name(&self) -> Option<&str> {
        self.fields.get(NAME_KEY).and_then(Value::as_str)
    }

    /// The attached (or authored) code payload.
    pub fn code(&self) -> Option<&str> {
        self.fields.get(CODE_KEY).and_then(Value::as_str)
    }

    /// Attach a code payload. Allowed once per loaded idea.
    pub fn attach_code(&mut self, code: String) -> Result<()> {
        if self.code_attached {
            bail!("code payload already attached to idea");
        }
        self.fields.insert(CODE_KEY.to_string(), Value::String(code));
        self.code_attached = true;
        Ok(())
    }

    /// Canonical text form used when asking the classifier about the idea.
    pub fn to_pretty_json(&self) -> String {
        // A map of JSON values always serializes.
        serde_json::to_string_pretty(&self.fields).unwrap_or_default()
    }
}

/// Build the code payload attached to an idea.
///
/// The dataset reference snippet comes first when both parts are present.
pub fn combine_payload(dataset_ref: Option<&str>, code: Option<&str>) -> Option<String> {
    match (dataset_ref, code) {
        (Some(dataset), Some(code)) => Some(format!("{dataset}\n{code}")),
        (Some(dataset), None) => Some(dataset.to_string()),
        (None, Some(code)) => Some(code.to_string()),
        (None, None) => None,
    }
}

/// Render an idea as markdown for the run directory.
///
/// `code` is the code file loaded next to the idea (not the dataset snippet);
/// it is fenced with `code_fence`.
pub fn render_markdown(idea: &Idea, code: Option<&str>, code_fence: &str) -> String {
    let mut out = String::new();
    let title = idea
        .fields
        .get("Title")
        .and_then(Value::as_str)
        .or_else(|| idea.name())
        .unwrap_or("Untitled idea");
    out.push_str(&format!("# {title}\n\n"));

    for (key, value) in &idea.fields {
        if key == CODE_KEY {
            continue;
        }
        out.push_str(&format!("## {key}\n\n"));
        match value {
            Value::String(text) => out.push_str(text.trim_end()),
            Value::Array(items) => {
                let lines: Vec<String> = items
                    .iter()
                    .map(|item| match item {
                        Value::String(text) => format!("- {text}"),
                        other => format!("- {other}"),
                    })
                    .collect();
                out.push_str(&lines.join("\n"));
            }
            other => {
                let pretty = serde_json::to_string_pretty(other).unwrap_or_default();
                out.push_str(&format!("```json\n{pretty}\n```"));
            }
        }
        out.push_str("\n\n");
    }

    if let Some(code) = code {
        out.push_str("## Code To Potentially Use\n\n");
        out.push_str("Use the following code as context for your experiments:\n\n");
        out.push_str(&format!("```{code_fence}\n{}\n```\n", code.trim_end()));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn idea(value: Value) -> Idea {
        match value {
            Value::Object(fields) => Idea::new(fields),
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn payload_puts_dataset_first() {
        assert_eq!(
            combine_payload(Some("ds"), Some("code")),
            Some("ds\ncode".to_string())
        );
        assert_eq!(combine_payload(Some("ds"), None), Some("ds".to_string()));
        assert_eq!(combine_payload(None, Some("code")), Some("code".to_string()));
        assert_eq!(combine_payload(None, None), None);
    }

    #[test]
    fn code_attaches_only_once() {
        let mut idea = idea(json!({"Name": "n"}));
        idea.attach_code("print(1)".to_string()).expect("first attach");
        assert_eq!(idea.code(), Some("print(1)"));
        let err = idea.attach_code("print(2)".to_string()).unwrap_err();
        assert!(err.to_string().contains("already attached"));
        assert_eq!(idea.code(), Some("print(1)"));
    }

    #[test]
    fn field_order_is_preserved() {
        let parsed: Idea =
            serde_json::from_str(r#"{"Name":"z","Title":"T","Abstract":"a"}"#).expect("parse");
        let keys: Vec<&str> = parsed.fields().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["Name", "Title", "Abstract"]);
    }

    #[test]
    fn markdown_lists_fields_and_fences_code() {
        let idea = idea(json!({
            "Name": "sparse_attn",
            "Title": "Sparse attention",
            "Experiments": ["ablate heads", "vary k"],
            "Code": "ignored in body"
        }));
        let md = render_markdown(&idea, Some("int main() {}"), "cpp");
        assert!(md.starts_with("# Sparse attention\n"));
        assert!(md.contains("## Experiments\n\n- ablate heads\n- vary k"));
        assert!(!md.contains("## Code\n"));
        assert!(md.contains("```cpp\nint main() {}\n```"));
    }
}
