//! Repository discovery: walk the configured base directories to a
//! bounded depth and collect everything that carries a `.git`.

use std::{collections::HashSet, path::PathBuf};

use ignore::WalkBuilder;

/// Directories that never contain repositories worth syncing.
const SKIP_DIRS: &[&str] = &["node_modules", "target", "build", "dist", ".cache"];

/// Walk `paths` and return the git repositories found within `recursion`
/// levels of each base (the base itself counts). Unreadable directories
/// are dropped with a warning; duplicates (overlapping bases) appear once.
pub fn discover_repositories(paths: &[PathBuf], recursion: usize) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    for base in paths {
        if !base.is_dir() {
            tracing::warn!(path = %base.display(), "not a directory, skipping");
            continue;
        }
        let mut builder = WalkBuilder::new(base);
        builder
            .follow_links(false)
            .hidden(true)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .max_depth(Some(recursion))
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                !SKIP_DIRS.contains(&name.as_ref())
            });

        for result in builder.build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(%err, "unreadable directory entry, skipping");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_dir()) {
                continue;
            }
            let path = entry.into_path();
            if path.join(".git").exists() && seen.insert(path.clone()) {
                found.push(path);
            }
        }
    }

    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn mk_repo(base: &std::path::Path, rel: &str) {
        let path = base.join(rel);
        fs::create_dir_all(path.join(".git")).unwrap();
    }

    #[test]
    fn finds_repos_to_the_requested_depth() {
        let td = tempfile::TempDir::new().unwrap();
        mk_repo(td.path(), "a");
        mk_repo(td.path(), "nested/b");
        fs::create_dir_all(td.path().join("plain")).unwrap();

        let shallow = discover_repositories(&[td.path().to_path_buf()], 1);
        assert_eq!(shallow, vec![td.path().join("a")]);

        let deeper = discover_repositories(&[td.path().to_path_buf()], 2);
        assert_eq!(
            deeper,
            vec![td.path().join("a"), td.path().join("nested/b")]
        );
    }

    #[test]
    fn base_that_is_a_repo_is_included() {
        let td = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(td.path().join(".git")).unwrap();
        let found = discover_repositories(&[td.path().to_path_buf()], 1);
        assert_eq!(found, vec![td.path().to_path_buf()]);
    }

    #[test]
    fn duplicate_bases_yield_one_entry() {
        let td = tempfile::TempDir::new().unwrap();
        mk_repo(td.path(), "a");
        let base = td.path().to_path_buf();
        let found = discover_repositories(&[base.clone(), base], 1);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn skip_dirs_are_not_descended() {
        let td = tempfile::TempDir::new().unwrap();
        mk_repo(td.path(), "node_modules/dep");
        mk_repo(td.path(), "ok");
        let found = discover_repositories(&[td.path().to_path_buf()], 3);
        assert_eq!(found, vec![td.path().join("ok")]);
    }
}
