//! Builds a [`PresenceActivity`] from the editor's current status.

use presence_protocol::PresenceActivity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::PresenceConfig;
use crate::format::FormatValues;
use crate::language::{language_for_extension, LanguageInfo};
use crate::workspace::{self, PrivateFilter, Workspace};

const PRIVATE_FILE_DETAILS: &str = "Private File";

/// Snapshot of the editor, as reported by the host. Lines, columns and
/// positions are 1-based.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorStatus {
    pub file_name: String,
    /// With the leading dot, e.g. `.rs`. Derived from `file_name` when empty.
    pub extension: String,
    pub directory: PathBuf,
    pub line: u64,
    pub column: u64,
    pub position: u64,
    pub size_bytes: u64,
    pub line_count: u64,
}

impl EditorStatus {
    pub fn has_file(&self) -> bool {
        !self.file_name.trim().is_empty()
    }

    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }

    fn effective_extension(&self) -> String {
        if !self.extension.is_empty() {
            return self.extension.clone();
        }
        if self.file_name.starts_with('.') && !self.file_name[1..].contains('.') {
            return self.file_name.clone();
        }
        Path::new(&self.file_name)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default()
    }
}

struct WorkspaceCache {
    directory: PathBuf,
    workspace: Workspace,
    filter: PrivateFilter,
}

pub struct PresenceAssembler {
    config: PresenceConfig,
    cache: Option<WorkspaceCache>,
}

impl PresenceAssembler {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            cache: None,
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// The activity to display for `status`. `start_time` is left unset;
    /// the session controller owns the elapsed-time anchor.
    pub fn assemble(&mut self, status: &EditorStatus) -> PresenceActivity {
        let (workspace, matches_filter) = {
            let cache = self.workspace_for(&status.directory);
            (cache.workspace.clone(), cache.filter.is_private(&status.path()))
        };
        let private = self.config.hide_if_private && status.has_file() && matches_filter;

        if private {
            return PresenceActivity {
                details: PRIVATE_FILE_DETAILS.to_string(),
                large_image: self.config.editor_image.clone(),
                large_text: self.config.editor_name.clone(),
                enable_button_repository: self.config.button_repository,
                ..Default::default()
            };
        }

        let extension = status.effective_extension();
        let language = language_for_extension(&extension);
        let values = FormatValues {
            file: status.file_name.clone(),
            extension,
            line: status.line,
            column: status.column,
            size_bytes: status.size_bytes,
            line_count: status.line_count,
            language: language.name.to_string(),
            position: status.position,
            workspace: workspace.name,
        };

        let mut activity = PresenceActivity {
            enable_button_repository: self.config.button_repository,
            ..Default::default()
        };
        self.apply_assets(&mut activity, status, language, &values);

        if self.config.button_repository {
            activity.repository_url = workspace.repository_url.unwrap_or_default();
        }
        if status.has_file() {
            if !self.config.hide_details {
                activity.details = values.render(&self.config.details_format);
            }
            if !self.config.hide_state {
                activity.state = values.render(&self.config.state_format);
            }
        }
        activity
    }

    fn apply_assets(
        &self,
        activity: &mut PresenceActivity,
        status: &EditorStatus,
        language: LanguageInfo,
        values: &FormatValues,
    ) {
        let editor_image = &self.config.editor_image;
        if !self.config.lang_image || !status.has_file() {
            activity.large_image = editor_image.clone();
            activity.large_text = self.config.editor_name.clone();
            return;
        }

        let large_image = language.large_image.unwrap_or(editor_image.as_str());
        activity.large_image = large_image.to_string();
        activity.large_text = values.render(&self.config.large_text_format);
        if large_image != editor_image {
            activity.small_image = editor_image.clone();
            activity.small_text = self.config.editor_name.clone();
        }
    }

    fn workspace_for(&mut self, directory: &Path) -> &WorkspaceCache {
        let cache = match self.cache.take() {
            Some(cache) if cache.directory == directory => cache,
            _ => {
                let workspace = workspace::discover(directory);
                let filter = match &workspace.root {
                    Some(root) => PrivateFilter::load(root),
                    None => PrivateFilter::default(),
                };
                tracing::debug!(
                    workspace = %workspace.name,
                    has_repository = workspace.repository_url.is_some(),
                    "Resolved workspace"
                );
                WorkspaceCache {
                    directory: directory.to_path_buf(),
                    workspace,
                    filter,
                }
            }
        };
        self.cache.insert(cache)
    }
}
