//! Reference image name matching
//!
//! Finds which reference image names a prompt mentions. Longer names win over
//! shorter names that appear inside them. A name must never touch an ASCII
//! letter or digit on either side. A CJK ideograph neighbour only blocks a name
//! whose edge on that side is an ASCII letter or digit; CJK text has no word
//! separators, so ideographic edges rely on the longest-match claim instead.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::ops::Range;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::generator::task::ReferenceImage;

/// Error types for reference library loading
#[derive(Error, Debug)]
pub enum ReferenceLibraryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for reference library operations
pub type ReferenceLibraryResult<T> = Result<T, ReferenceLibraryError>;

/// Bring prompt text in line with how names are authored
fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{3000}' => ' ',
            '(' => '（',
            ')' => '）',
            other => other,
        })
        .collect()
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || ('\u{4E00}'..='\u{9FA5}').contains(&c)
}

fn edge_is_free(edge: Option<char>, neighbour: Option<char>) -> bool {
    match (edge, neighbour) {
        (_, Some(neighbour)) if neighbour.is_ascii_alphanumeric() => false,
        (Some(edge), Some(neighbour)) => !(edge.is_ascii_alphanumeric() && is_word_char(neighbour)),
        _ => true,
    }
}

fn respects_boundary(text: &str, span: &Range<usize>) -> bool {
    let matched = &text[span.clone()];
    let before = text[..span.start].chars().next_back();
    let after = text[span.end..].chars().next();
    edge_is_free(matched.chars().next(), before) && edge_is_free(matched.chars().next_back(), after)
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

/// Return the candidate names mentioned in `prompt`, in order of first
/// appearance, without duplicates.
pub fn extract_names<'a, I>(prompt: &str, candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let text = normalize(prompt);

    let mut names: Vec<&str> = candidates
        .into_iter()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    // Longest first; ties broken by text so the result does not depend on hash order
    names.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then_with(|| a.cmp(b)));

    let mut consumed: Vec<Range<usize>> = Vec::new();
    let mut accepted: Vec<(usize, &str)> = Vec::new();

    for name in names {
        let mut cursor = 0;
        while let Some(offset) = text[cursor..].find(name) {
            let start = cursor + offset;
            let span = start..start + name.len();

            if !respects_boundary(&text, &span) {
                // Step one character forward, the same way a regex scan resumes
                let step = text[start..].chars().next().map_or(1, char::len_utf8);
                cursor = start + step;
                continue;
            }

            if !consumed.iter().any(|taken| overlaps(taken, &span)) {
                accepted.push((span.start, name));
                consumed.push(span.clone());
            }
            cursor = span.end;
        }
    }

    accepted.sort_by_key(|(start, _)| *start);

    let mut seen = HashSet::new();
    accepted
        .into_iter()
        .filter(|(_, name)| seen.insert(*name))
        .map(|(_, name)| name.to_string())
        .collect()
}

#[derive(Debug, Deserialize)]
struct LibraryEntry {
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    path: String,
}

/// Read-only view of the named reference images, keyed by their unique name
#[derive(Debug, Clone, Default)]
pub struct ReferenceLibrary {
    images: HashMap<String, ReferenceImage>,
}

impl ReferenceLibrary {
    /// Later images replace earlier ones with the same name
    pub fn new(images: impl IntoIterator<Item = ReferenceImage>) -> Self {
        let mut library = HashMap::new();
        for image in images {
            if let Some(previous) = library.insert(image.name.clone(), image) {
                warn!("Duplicate reference name '{}'", previous.name);
            }
        }
        Self { images: library }
    }

    /// Load a `{ "category": [ {"name", "url", "path"} ] }` file.
    /// A missing file is an empty library.
    pub fn load(path: &Path) -> ReferenceLibraryResult<Self> {
        if !path.exists() {
            warn!("Reference library not found: {}", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> ReferenceLibraryResult<Self> {
        let categories: BTreeMap<String, Vec<LibraryEntry>> = serde_json::from_str(content)?;
        let mut images = Vec::new();

        for (category, entries) in categories {
            for entry in entries {
                let name = entry.name.trim();
                if name.is_empty() {
                    continue;
                }
                let image = if !entry.path.trim().is_empty() {
                    ReferenceImage::local(name, entry.path.trim())
                } else if !entry.url.trim().is_empty() {
                    ReferenceImage::remote(name, entry.url.trim())
                } else {
                    debug!("Skipping reference '{}' in '{}' with no source", name, category);
                    continue;
                };
                images.push(image);
            }
        }

        Ok(Self::new(images))
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ReferenceImage> {
        self.images.get(name)
    }

    /// Reference images mentioned by `prompt`, in mention order
    pub fn resolve(&self, prompt: &str) -> Vec<ReferenceImage> {
        extract_names(prompt, self.images.keys().map(String::as_str))
            .into_iter()
            .filter_map(|name| self.get(&name).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_name_claims_span() {
        let names = extract_names("一只小猫", ["猫", "小猫"]);
        assert_eq!(names, vec!["小猫".to_string()]);
    }

    #[test]
    fn test_boundary_blocks_embedded_ascii() {
        // "cat" inside "concatenate" is glued to letters on both sides
        assert!(extract_names("concatenate", ["cat"]).is_empty());
        assert!(extract_names("猫cat", ["cat"]).is_empty());
        assert_eq!(extract_names("a cat, sitting", ["cat"]), vec!["cat".to_string()]);
    }

    #[test]
    fn test_ascii_neighbour_blocks_ideographic_name() {
        assert!(extract_names("cat猫", ["猫"]).is_empty());
        assert!(extract_names("画2小猫", ["小猫"]).is_empty());
        assert!(extract_names("小猫B站", ["小猫"]).is_empty());
        assert_eq!(extract_names("画 2 只小猫", ["小猫"]), vec!["小猫".to_string()]);
    }

    #[test]
    fn test_text_order_and_dedup() {
        let names = extract_names("（张三）和（李四）以及（张三）", ["（李四）", "（张三）"]);
        assert_eq!(names, vec!["（张三）".to_string(), "（李四）".to_string()]);
    }

    #[test]
    fn test_ascii_parentheses_are_normalized() {
        let names = extract_names("画面里有(阿福)在跑", ["（阿福）"]);
        assert_eq!(names, vec!["（阿福）".to_string()]);
    }

    #[test]
    fn test_shorter_name_still_matches_elsewhere() {
        let names = extract_names("小猫, 猫", ["猫", "小猫"]);
        assert_eq!(names, vec!["小猫".to_string(), "猫".to_string()]);
    }

    #[test]
    fn test_failed_boundary_resumes_scan() {
        // First occurrence is glued to "x"; the second one stands alone
        let names = extract_names("xdog dog", ["dog"]);
        assert_eq!(names, vec!["dog".to_string()]);
    }

    #[test]
    fn test_library_from_json_prefers_local_path() {
        let json = r#"{
            "人物": [
                {"name": "阿福", "url": "http://h/a.png", "path": "images/人物/阿福.png"},
                {"name": "", "url": "http://h/ignored.png", "path": ""}
            ],
            "场景": [
                {"name": "城堡", "url": "http://h/castle.png", "path": ""}
            ]
        }"#;
        let library = ReferenceLibrary::from_json(json).unwrap();
        assert_eq!(library.len(), 2);
        assert_eq!(
            library.get("阿福"),
            Some(&ReferenceImage::local("阿福", "images/人物/阿福.png"))
        );

        let resolved = library.resolve("城堡前的阿福");
        let names: Vec<_> = resolved.iter().map(|image| image.name.as_str()).collect();
        assert_eq!(names, vec!["城堡", "阿福"]);
    }
}
