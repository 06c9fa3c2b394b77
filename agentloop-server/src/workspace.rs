//! A checked-out repository that agents may look at and the Code Agent's
//! edits are applied to.
//!
//! Every path an agent supplies is relative to the workspace root. Absolute
//! paths and `..` are rejected outright; existing paths are canonicalised so
//! a symlink cannot point the check elsewhere.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use agentloop_core::FileEdit;
use regex::RegexBuilder;
use walkdir::{DirEntry, WalkDir};

use crate::error::ToolError;

/// Directories never listed, searched or written.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target", ".venv", "__pycache__"];
const MAX_TREE_DEPTH: usize = 6;
const MAX_TREE_ENTRIES: usize = 2_000;
const MAX_FILE_BYTES: u64 = 1024 * 1024;
const MAX_READ_LINES: usize = 400;
const MAX_SEARCH_RESULTS: usize = 200;

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

impl Workspace {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, ToolError> {
        let root = root
            .as_ref()
            .canonicalize()
            .map_err(|e| ToolError::failed(format!("workspace unavailable: {}", e)))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a relative path into the workspace.
    ///
    /// The path need not exist; its nearest existing ancestor is
    /// canonicalised and must stay inside the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, ToolError> {
        let escape = || ToolError::PathEscape(relative.to_string());
        let candidate = Path::new(relative);
        if relative.trim().is_empty() {
            return Err(ToolError::invalid("path is required"));
        }
        if candidate
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(escape());
        }
        if candidate
            .components()
            .next()
            .is_some_and(|c| c.as_os_str() == ".git")
        {
            return Err(escape());
        }

        let joined = self.root.join(candidate);
        let mut existing = joined.as_path();
        let mut rest = Vec::new();
        while !existing.exists() {
            let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                return Err(escape());
            };
            rest.push(name.to_os_string());
            existing = parent;
        }
        let mut resolved = existing.canonicalize().map_err(|_| escape())?;
        if !resolved.starts_with(&self.root) {
            return Err(escape());
        }
        for name in rest.into_iter().rev() {
            resolved.push(name);
        }
        Ok(resolved)
    }

    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    /// Indented listing of directories and files, depth-limited.
    pub fn repo_tree(&self, max_depth: usize) -> Result<String, ToolError> {
        let mut lines = Vec::new();
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(max_depth.clamp(1, MAX_TREE_DEPTH))
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_skipped(e));

        for entry in walker {
            let entry = entry.map_err(ToolError::failed)?;
            if lines.len() >= MAX_TREE_ENTRIES {
                lines.push("... (truncated)".to_string());
                break;
            }
            let indent = "  ".repeat(entry.depth() - 1);
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_dir() {
                lines.push(format!("{}{}/", indent, name));
            } else {
                lines.push(format!("{}{}", indent, name));
            }
        }
        Ok(lines.join("\n"))
    }

    /// Lines `start..=end` (1-based) of a text file.
    pub fn read_file(&self, path: &str, start: usize, end: Option<usize>) -> Result<String, ToolError> {
        let full = self.resolve(path)?;
        let metadata = fs::metadata(&full).map_err(|e| ToolError::failed(format!("{}: {}", path, e)))?;
        if !metadata.is_file() {
            return Err(ToolError::failed(format!("{} is not a file", path)));
        }
        if metadata.len() > MAX_FILE_BYTES {
            return Err(ToolError::failed(format!(
                "{} is too large ({} bytes)",
                path,
                metadata.len()
            )));
        }
        let content = fs::read_to_string(&full)
            .map_err(|e| ToolError::failed(format!("{}: {}", path, e)))?;

        let start = start.max(1);
        let end = end
            .unwrap_or(start + MAX_READ_LINES - 1)
            .min(start + MAX_READ_LINES - 1);
        if end < start {
            return Err(ToolError::invalid("end must not be before start"));
        }
        Ok(content
            .lines()
            .enumerate()
            .skip(start - 1)
            .take(end - start + 1)
            .map(|(i, line)| format!("{:>5} {}", i + 1, line))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Regex search across text files, optionally limited by a glob on the
    /// relative path.
    pub fn search(&self, query: &str, path_glob: Option<&str>) -> Result<String, ToolError> {
        if query.is_empty() {
            return Err(ToolError::invalid("query is required"));
        }
        let pattern = RegexBuilder::new(query)
            .size_limit(1 << 20)
            .build()
            .map_err(|e| ToolError::invalid(format!("bad regex: {}", e)))?;
        let filter = path_glob
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| ToolError::invalid(format!("bad glob: {}", e)))?;

        let mut results = Vec::new();
        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_skipped(e));

        'files: for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = self.relative(entry.path());
            if let Some(filter) = &filter {
                let options = glob::MatchOptions {
                    require_literal_separator: true,
                    ..Default::default()
                };
                if !filter.matches_path_with(relative, options) {
                    continue;
                }
            }
            let Some(text) = read_text(entry.path()) else {
                continue;
            };
            for (i, line) in text.lines().enumerate() {
                if pattern.is_match(line) {
                    results.push(format!("{}:{}: {}", relative.display(), i + 1, line.trim_end()));
                    if results.len() >= MAX_SEARCH_RESULTS {
                        results.push("... (truncated)".to_string());
                        break 'files;
                    }
                }
            }
        }

        if results.is_empty() {
            Ok("NO_MATCHES".to_string())
        } else {
            Ok(results.join("\n"))
        }
    }

    /// Write or delete files. All paths are validated before anything is
    /// touched. Returns the paths changed.
    pub fn apply_edits(&self, edits: &[FileEdit]) -> Result<Vec<String>, ToolError> {
        let resolved = edits
            .iter()
            .map(|edit| self.resolve(&edit.path).map(|full| (edit, full)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut changed = Vec::with_capacity(resolved.len());
        for (edit, full) in resolved {
            if edit.delete {
                match fs::remove_file(&full) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(ToolError::failed(format!("{}: {}", edit.path, e))),
                }
            } else {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| ToolError::failed(format!("{}: {}", edit.path, e)))?;
                }
                fs::write(&full, &edit.content)
                    .map_err(|e| ToolError::failed(format!("{}: {}", edit.path, e)))?;
            }
            changed.push(edit.path.clone());
        }
        Ok(changed)
    }
}

/// File contents if small and valid UTF-8.
fn read_text(path: &Path) -> Option<String> {
    let file = fs::File::open(path).ok()?;
    if file.metadata().ok()?.len() > MAX_FILE_BYTES {
        return None;
    }
    let mut text = String::new();
    file.take(MAX_FILE_BYTES).read_to_string(&mut text).ok()?;
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn greet() {\n    println!(\"hi\");\n}\n").unwrap();
        fs::write(dir.path().join("src/nested/mod.rs"), "// greet helper\n").unwrap();
        fs::write(dir.path().join("README.md"), "# Widgets\n").unwrap();
        fs::write(dir.path().join(".git/config"), "[core]\n").unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        (dir, ws)
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let (_dir, ws) = workspace();
        for path in ["../etc/passwd", "/etc/passwd", "src/../../x", ".git/config", ""] {
            assert!(ws.resolve(path).is_err(), "{} accepted", path);
        }
        assert!(ws.resolve("src/lib.rs").is_ok());
        assert!(ws.resolve("src/new/file.rs").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_out_of_root() {
        let (dir, ws) = workspace();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret"), "s3cret").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        assert_eq!(
            ws.resolve("link/secret"),
            Err(ToolError::PathEscape("link/secret".to_string()))
        );
        assert!(ws.read_file("link/secret", 1, None).is_err());
    }

    #[test]
    fn test_repo_tree_skips_git_and_respects_depth() {
        let (_dir, ws) = workspace();
        let tree = ws.repo_tree(1).unwrap();
        assert!(tree.contains("README.md"));
        assert!(tree.contains("src/"));
        assert!(!tree.contains(".git"));
        assert!(!tree.contains("lib.rs"));

        let deep = ws.repo_tree(3).unwrap();
        assert!(deep.contains("    mod.rs"));
    }

    #[test]
    fn test_read_file_range() {
        let (_dir, ws) = workspace();
        let text = ws.read_file("src/lib.rs", 2, Some(2)).unwrap();
        assert_eq!(text, "    2     println!(\"hi\");");
        assert!(ws.read_file("src", 1, None).is_err());
        assert!(ws.read_file("missing.rs", 1, None).is_err());
    }

    #[test]
    fn test_search_with_glob() {
        let (_dir, ws) = workspace();
        let all = ws.search("greet", None).unwrap();
        assert!(all.contains("src/lib.rs:1: pub fn greet() {"));
        assert!(all.contains("src/nested/mod.rs:1:"));

        let only_lib = ws.search("greet", Some("src/*.rs")).unwrap();
        assert!(only_lib.contains("src/lib.rs"));
        assert!(!only_lib.contains("nested"));

        assert_eq!(ws.search("core", None).unwrap(), "NO_MATCHES");
        assert!(ws.search("(", None).is_err());
    }

    #[test]
    fn test_apply_edits_is_all_or_nothing_on_bad_paths() {
        let (dir, ws) = workspace();
        let edits = vec![
            FileEdit {
                path: "src/new.rs".to_string(),
                content: "fn x() {}\n".to_string(),
                delete: false,
            },
            FileEdit {
                path: "../outside.rs".to_string(),
                content: String::new(),
                delete: false,
            },
        ];
        assert!(ws.apply_edits(&edits).is_err());
        assert!(!dir.path().join("src/new.rs").exists());
    }

    #[test]
    fn test_apply_edits_writes_and_deletes() {
        let (dir, ws) = workspace();
        let changed = ws
            .apply_edits(&[
                FileEdit {
                    path: "docs/guide.md".to_string(),
                    content: "hello\n".to_string(),
                    delete: false,
                },
                FileEdit {
                    path: "README.md".to_string(),
                    content: String::new(),
                    delete: true,
                },
                FileEdit {
                    path: "never-existed.txt".to_string(),
                    content: String::new(),
                    delete: true,
                },
            ])
            .unwrap();
        assert_eq!(changed, vec!["docs/guide.md", "README.md"]);
        assert_eq!(
            fs::read_to_string(dir.path().join("docs/guide.md")).unwrap(),
            "hello\n"
        );
        assert!(!dir.path().join("README.md").exists());
    }
}
