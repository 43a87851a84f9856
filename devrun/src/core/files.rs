//! Merging file sets produced by consecutive agents.

use std::collections::BTreeMap;

use crate::core::path::{InvalidWorkspacePath, sanitize_workspace_path};
use crate::core::types::GeneratedFile;

/// Merge agent file batches in order. Later batches win per sanitized path.
///
/// Output is sorted by path. Any unsafe path rejects the whole merge.
pub fn merge_generated_files<'a, I>(batches: I) -> Result<Vec<GeneratedFile>, InvalidWorkspacePath>
where
    I: IntoIterator<Item = &'a [GeneratedFile]>,
{
    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    for batch in batches {
        for file in batch {
            let path = sanitize_workspace_path(&file.path)?;
            merged.insert(path, file.content.clone());
        }
    }
    Ok(merged
        .into_iter()
        .map(|(path, content)| GeneratedFile { path, content })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, content: &str) -> GeneratedFile {
        GeneratedFile {
            path: path.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn last_writer_wins_after_normalization() {
        let spec = vec![file("features/a.feature", "Feature: A")];
        let test = vec![file("tests/a.test.ts", "test v1")];
        let code = vec![file("./tests/a.test.ts", "test v2"), file("app/page.tsx", "page")];

        let merged =
            merge_generated_files([spec.as_slice(), test.as_slice(), code.as_slice()]).expect("merge");
        let paths: Vec<&str> = merged.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["app/page.tsx", "features/a.feature", "tests/a.test.ts"]);
        assert_eq!(merged[2].content, "test v2");
    }

    #[test]
    fn unsafe_path_rejects_merge() {
        let batch = vec![file("ok.ts", ""), file("../escape.ts", "")];
        assert!(merge_generated_files([batch.as_slice()]).is_err());
    }
}
