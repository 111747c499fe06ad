//! Selection of the paper revision handed to review.

use std::sync::LazyLock;

use regex::Regex;

static REFLECTION_INDEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"reflection[_.]?(\d+)").expect("valid reflection regex"));

/// Whether a file name is a reflection PDF produced by the writeup.
pub fn is_reflection_pdf(file_name: &str) -> bool {
    file_name.ends_with(".pdf") && file_name.contains("reflection")
}

/// Pick the reflection PDF to review.
///
/// Tie-break, in order:
/// 1. first name containing `final` (case-insensitive);
/// 2. highest numeric index matched by `reflection[_.]?(\d+)`;
/// 3. first candidate.
///
/// Names that are not reflection PDFs are ignored. Returns `None` when nothing
/// qualifies.
pub fn select_review_pdf<S: AsRef<str>>(file_names: &[S]) -> Option<&str> {
    let candidates: Vec<&str> = file_names
        .iter()
        .map(|name| name.as_ref())
        .filter(|name| is_reflection_pdf(name))
        .collect();

    if let Some(final_pdf) = candidates
        .iter()
        .find(|name| name.to_lowercase().contains("final"))
    {
        return Some(*final_pdf);
    }

    let numbered = candidates
        .iter()
        .filter_map(|name| {
            let caps = REFLECTION_INDEX_RE.captures(name)?;
            let index: u64 = caps.get(1)?.as_str().parse().ok()?;
            Some((index, *name))
        })
        // Keep the earliest name when two files share an index.
        .fold(None, |best: Option<(u64, &str)>, item| match best {
            Some(current) if current.0 >= item.0 => Some(current),
            _ => Some(item),
        });
    if let Some((_, name)) = numbered {
        return Some(name);
    }

    candidates.first().copied()
}
