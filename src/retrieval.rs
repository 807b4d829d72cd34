/// Copy result files out of the writable layer of a container
use crate::files_limit::is_synthesized;
use crate::types::{BenchError, Result};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Pattern used when the caller asks for result files without naming any
pub const DEFAULT_PATTERN: &str = ".";

/// Normalized retrieval request
#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalPlan {
    /// Container directory that retrieved paths are made relative to
    pub base: PathBuf,
    /// Absolute container paths, possibly containing wildcards
    pub patterns: Vec<PathBuf>,
}

/// Remove `.` and resolve `..` without touching the file system.
/// Returns `None` if the path climbs above its start.
pub fn normalize(path: &Path) -> Option<PathBuf> {
    let mut result = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::RootDir => result.push("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                result.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                result.push(part);
                depth += 1;
            }
            Component::Prefix(_) => return None,
        }
    }
    Some(result)
}

impl RetrievalPlan {
    /// Validate the patterns against the working directory of the tool
    pub fn new(patterns: &[String], working_dir: &Path) -> Result<Self> {
        let patterns: Vec<&str> = if patterns.is_empty() {
            vec![DEFAULT_PATTERN]
        } else {
            patterns.iter().map(String::as_str).collect()
        };
        let working_dir = normalize(working_dir)
            .filter(|dir| dir.is_absolute())
            .ok_or_else(|| {
                BenchError::Config(format!(
                    "Working directory {} is not a normalized absolute path",
                    working_dir.display()
                ))
            })?;

        let mut normalized = Vec::new();
        for pattern in &patterns {
            let path = Path::new(pattern);
            let full = if path.is_absolute() {
                normalize(path)
            } else {
                normalize(path).and_then(|relative| normalize(&working_dir.join(relative)))
            };
            let full = full.ok_or_else(|| {
                BenchError::Config(format!(
                    "Result file pattern {} leaves the container",
                    pattern
                ))
            })?;
            normalized.push(full);
        }

        let base = if patterns.iter().any(|p| Path::new(p).is_absolute()) {
            PathBuf::from("/")
        } else {
            working_dir
        };
        Ok(Self {
            base,
            patterns: normalized,
        })
    }
}

/// Shell-style matching of one path component with `*` and `?`
pub fn matches_component(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut backtrack = None;
    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
            }
            Some('?') => {
                p += 1;
                n += 1;
            }
            Some(c) if *c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    n = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

fn has_wildcard(component: &str) -> bool {
    component.contains(['*', '?'])
}

/// Expand `pattern` (relative to `root`) into existing paths.
/// `**` matches any number of directories.
pub fn expand(root: &Path, pattern: &Path) -> Vec<PathBuf> {
    let parts: Vec<String> = pattern
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    let mut found = Vec::new();
    expand_from(root.to_path_buf(), &parts, &mut found);
    found.sort();
    found.dedup();
    found
}

fn expand_from(current: PathBuf, parts: &[String], found: &mut Vec<PathBuf>) {
    let Some((head, rest)) = parts.split_first() else {
        if fs::symlink_metadata(&current).is_ok() {
            found.push(current);
        }
        return;
    };

    if head == "**" {
        expand_from(current.clone(), rest, found);
        for child in subdirectories(&current) {
            expand_from(child, parts, found);
        }
    } else if has_wildcard(head) {
        let Ok(entries) = fs::read_dir(&current) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            // hidden files need an explicit dot, as in a shell
            if name.starts_with('.') && !head.starts_with('.') {
                continue;
            }
            if matches_component(head, &name) {
                expand_from(entry.path(), rest, found);
            }
        }
    } else {
        expand_from(current.join(head), rest, found);
    }
}

fn subdirectories(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect()
}

/// What retrieval produced
#[derive(Debug, Default, PartialEq)]
pub struct Retrieved {
    /// Paths of the copied files, relative to the output directory
    pub files: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Move matching files from the writable layer `temp_base` into `output_dir`.
///
/// Only regular files are transferred; directories are descended into, and
/// device nodes that overlays use as whiteouts are ignored along with symlinks.
pub fn retrieve(plan: &RetrievalPlan, temp_base: &Path, output_dir: &Path) -> Retrieved {
    let mut retrieved = Retrieved::default();
    let base_dir = temp_base.join(plan.base.strip_prefix("/").unwrap_or(&plan.base));

    for pattern in &plan.patterns {
        for matched in expand(temp_base, pattern) {
            if !matched.starts_with(&base_dir) {
                continue;
            }
            let is_dir = fs::symlink_metadata(&matched)
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if is_dir {
                let mut pending = vec![matched];
                while let Some(dir) = pending.pop() {
                    let Ok(entries) = fs::read_dir(&dir) else {
                        continue;
                    };
                    for entry in entries.flatten() {
                        let path = entry.path();
                        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                            pending.push(path);
                        } else {
                            transfer(&path, temp_base, &base_dir, output_dir, &mut retrieved);
                        }
                    }
                }
            } else {
                transfer(&matched, temp_base, &base_dir, output_dir, &mut retrieved);
            }
        }
    }
    retrieved.files.sort();
    retrieved
}

fn transfer(
    file: &Path,
    temp_base: &Path,
    base_dir: &Path,
    output_dir: &Path,
    retrieved: &mut Retrieved,
) {
    let Ok(metadata) = fs::symlink_metadata(file) else {
        return;
    };
    if !metadata.is_file() || is_synthesized(temp_base, file) {
        return;
    }
    let Ok(relative) = file.strip_prefix(base_dir) else {
        return;
    };
    let target = output_dir.join(relative);
    match move_file(file, &target) {
        Ok(()) => retrieved.files.push(relative.to_path_buf()),
        Err(e) => retrieved.warnings.push(format!(
            "Could not retrieve output file {}: {}",
            relative.display(),
            e
        )),
    }
}

/// Moving also keeps a second pattern from matching the same file again
fn move_file(source: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(source, target) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            fs::copy(source, target)?;
            fs::remove_file(source)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), Some(PathBuf::from("/a/c")));
        assert_eq!(normalize(Path::new("a/..")), Some(PathBuf::new()));
        assert_eq!(normalize(Path::new("../x")), None);
        assert_eq!(normalize(Path::new("/..")), None);
    }

    #[test]
    fn test_plan_relative_and_absolute() {
        let plan = RetrievalPlan::new(&["out/*.txt".to_string()], Path::new("/home/u")).unwrap();
        assert_eq!(plan.base, PathBuf::from("/home/u"));
        assert_eq!(plan.patterns, vec![PathBuf::from("/home/u/out/*.txt")]);

        let plan = RetrievalPlan::new(
            &["result".to_string(), "/tmp/out.txt".to_string()],
            Path::new("/home/u"),
        )
        .unwrap();
        assert_eq!(plan.base, PathBuf::from("/"));
        assert_eq!(plan.patterns[1], PathBuf::from("/tmp/out.txt"));
    }

    #[test]
    fn test_plan_rejects_escape() {
        assert!(RetrievalPlan::new(&["../secret".to_string()], Path::new("/home/u")).is_err());
        assert!(RetrievalPlan::new(&["a/../../b".to_string()], Path::new("/home/u")).is_err());
        assert!(RetrievalPlan::new(&["x".to_string()], Path::new("relative")).is_err());
    }

    #[test]
    fn test_default_pattern() {
        let plan = RetrievalPlan::new(&[], Path::new("/work")).unwrap();
        assert_eq!(plan.patterns, vec![PathBuf::from("/work")]);
    }

    #[test]
    fn test_component_matching() {
        assert!(matches_component("*.txt", "out.txt"));
        assert!(matches_component("o?t*", "output.log"));
        assert!(matches_component("*", "anything"));
        assert!(!matches_component("*.txt", "out.log"));
        assert!(!matches_component("a?", "a"));
        assert!(matches_component("a*b*c", "aXXbYYc"));
    }

    #[test]
    fn test_retrieve_moves_regular_files() {
        let layer = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let work = layer.path().join("home/u");
        fs::create_dir_all(work.join("sub")).unwrap();
        fs::write(work.join("a.txt"), "a").unwrap();
        fs::write(work.join("sub/b.txt"), "b").unwrap();
        fs::write(work.join("c.log"), "c").unwrap();
        std::os::unix::fs::symlink("a.txt", work.join("link.txt")).unwrap();
        fs::create_dir_all(layer.path().join("etc")).unwrap();
        fs::write(layer.path().join("etc/passwd"), "x").unwrap();

        let plan = RetrievalPlan::new(&["*.txt".to_string(), "sub".to_string()], Path::new("/home/u")).unwrap();
        let retrieved = retrieve(&plan, layer.path(), output.path());
        assert_eq!(
            retrieved.files,
            vec![PathBuf::from("a.txt"), PathBuf::from("sub/b.txt")]
        );
        assert_eq!(fs::read_to_string(output.path().join("sub/b.txt")).unwrap(), "b");
        assert!(!work.join("a.txt").exists());
        assert!(work.join("c.log").exists());

        let plan = RetrievalPlan::new(&["/".to_string()], Path::new("/home/u")).unwrap();
        let retrieved = retrieve(&plan, layer.path(), output.path());
        assert_eq!(retrieved.files, vec![PathBuf::from("home/u/c.log")]);
    }

    #[test]
    fn test_recursive_wildcard() {
        let layer = tempfile::tempdir().unwrap();
        fs::create_dir_all(layer.path().join("w/x/y")).unwrap();
        fs::write(layer.path().join("w/x/y/z.out"), "").unwrap();
        fs::write(layer.path().join("w/top.out"), "").unwrap();
        let found = expand(layer.path(), Path::new("/w/**/*.out"));
        assert_eq!(found.len(), 2);
    }
}
