//! Workspace and repository discovery for the file being edited.
//!
//! A workspace is the nearest ancestor directory holding a `.git` directory
//! or a `.gitignore` file. Its `.gitignore` also drives the private-file
//! filter.

use regex::Regex;
use std::path::{Path, PathBuf};

const GIT_DIR: &str = ".git";
const GITIGNORE: &str = ".gitignore";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workspace {
    /// Directory name shown for `%(workspace)`.
    pub name: String,
    /// Root directory, when a repository marker was found.
    pub root: Option<PathBuf>,
    pub repository_url: Option<String>,
}

/// Walks up from `dir` looking for a repository marker. Without one, the
/// workspace is just `dir` itself.
pub fn discover(dir: &Path) -> Workspace {
    if dir.as_os_str().is_empty() {
        return Workspace::default();
    }

    for candidate in dir.ancestors() {
        let git_dir = candidate.join(GIT_DIR);
        let has_git = git_dir.is_dir();
        if !has_git && !candidate.join(GITIGNORE).is_file() {
            continue;
        }

        let repository_url = if has_git {
            read_repository_url(&git_dir.join("config"))
        } else {
            None
        };
        return Workspace {
            name: dir_name(candidate),
            root: Some(candidate.to_path_buf()),
            repository_url,
        };
    }

    Workspace {
        name: dir_name(dir),
        root: None,
        repository_url: None,
    }
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

fn read_repository_url(config_path: &Path) -> Option<String> {
    match fs_err::read_to_string(config_path) {
        Ok(content) => repository_url(&content),
        Err(err) => {
            tracing::debug!(error = %err, "No readable git config");
            None
        }
    }
}

/// Extracts the `origin` remote URL from git config text, as a browsable
/// `https://` URL.
pub fn repository_url(git_config: &str) -> Option<String> {
    let mut in_origin = false;
    for line in git_config.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_origin = line == r#"[remote "origin"]"#;
            continue;
        }
        if !in_origin {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "url" {
                let url = value.trim();
                return (!url.is_empty()).then(|| normalize_remote_url(url));
            }
        }
    }
    None
}

/// `git@host:owner/repo.git` → `https://host/owner/repo.git`,
/// `http://` → `https://`.
pub fn normalize_remote_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("git@") {
        if let Some((host, path)) = rest.split_once(':') {
            return format!("https://{}/{}", host, path);
        }
    }
    if let Some(rest) = url.strip_prefix("http://") {
        return format!("https://{}", rest);
    }
    url.to_string()
}

/// Matches paths against `.gitignore` patterns.
///
/// Supports `*`, `**`, `?`, leading `/` (anchored at the root) and trailing
/// `/` (directories). Negations (`!pattern`) are ignored.
#[derive(Debug, Clone, Default)]
pub struct PrivateFilter {
    root: Option<PathBuf>,
    patterns: Vec<Regex>,
}

impl PrivateFilter {
    /// Loads `<root>/.gitignore`. A missing file yields an empty filter.
    pub fn load(root: &Path) -> Self {
        let path = root.join(GITIGNORE);
        let content = match fs_err::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };
        Self::from_patterns(root, content.lines())
    }

    pub fn from_patterns<'a>(root: &Path, lines: impl IntoIterator<Item = &'a str>) -> Self {
        let patterns = lines
            .into_iter()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
            .filter_map(|line| match Regex::new(&pattern_to_regex(line)) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    tracing::debug!(pattern = line, error = %err, "Skipping gitignore pattern");
                    None
                }
            })
            .collect();

        Self {
            root: Some(root.to_path_buf()),
            patterns,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_private(&self, path: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }

        let relative = self
            .root
            .as_deref()
            .and_then(|root| path.strip_prefix(root).ok())
            .map(Path::to_path_buf)
            .or_else(|| path.file_name().map(PathBuf::from))
            .unwrap_or_else(|| path.to_path_buf());
        let relative = relative.to_string_lossy().replace('\\', "/");

        self.patterns.iter().any(|pattern| pattern.is_match(&relative))
    }
}

fn pattern_to_regex(pattern: &str) -> String {
    let pattern = pattern.replace('\\', "/");
    let directory_only = pattern.ends_with('/');
    let pattern = pattern.trim_end_matches('/');
    let anchored = pattern.starts_with('/') || pattern.contains('/');
    let pattern = pattern.trim_start_matches('/');

    let mut body = String::new();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    body.push_str("(?:.*/)?");
                } else {
                    body.push_str(".*");
                }
            }
            '*' => body.push_str("[^/]*"),
            '?' => body.push_str("[^/]"),
            other => body.push_str(&regex::escape(&other.to_string())),
        }
    }

    let prefix = if anchored { "^" } else { "(?:^|/)" };
    let suffix = if directory_only { "/" } else { "(?:/|$)" };
    format!("{}{}{}", prefix, body, suffix)
}
