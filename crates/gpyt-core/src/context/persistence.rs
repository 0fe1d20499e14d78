use crate::constants::paths;
use crate::context::conversation::{new_id, Conversation};
use crate::error::GpytError;
use chrono::{DateTime, Utc};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// One record that could not be read during [`ConversationArchive::load_all`].
#[derive(Debug, Clone)]
pub struct LoadFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of enumerating the archive. Good records load even when others fail.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Conversations with their record modification time, oldest first.
    pub conversations: Vec<(Conversation, DateTime<Utc>)>,
    pub failures: Vec<LoadFailure>,
}

/// Durable conversation records, one JSON file per conversation:
/// `<root>/conversations/convo-<id>.json`.
#[derive(Debug, Clone)]
pub struct ConversationArchive {
    root: PathBuf,
}

impl ConversationArchive {
    /// Archive rooted at the cache directory `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.root.join(paths::CONVERSATIONS_DIR)
    }

    /// Record path for a conversation id.
    pub fn record_path(&self, id: &str) -> PathBuf {
        self.conversations_dir()
            .join(format!("{}{}.json", paths::RECORD_PREFIX, id))
    }

    /// Write the conversation, replacing any record with the same id.
    ///
    /// Each write goes to its own temp file and is renamed into place, so
    /// overlapping saves of one id leave the last complete write.
    pub fn save(&self, conversation: &Conversation) -> Result<PathBuf, GpytError> {
        check_id(&conversation.id)?;
        let dir = self.conversations_dir();
        fs::create_dir_all(&dir)
            .map_err(|e| GpytError::persistence("Failed to create conversations directory", e))?;

        let path = self.record_path(&conversation.id);
        let contents = serde_json::to_string_pretty(conversation)
            .map_err(|e| GpytError::persistence("Failed to serialize conversation", e))?;

        let tmp_path = dir.join(format!(".{}{}.{}.tmp", paths::RECORD_PREFIX, conversation.id, new_id()));
        fs::write(&tmp_path, contents)
            .map_err(|e| GpytError::persistence("Failed to write temporary conversation file", e))?;

        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(GpytError::persistence("Failed to rename conversation file", e));
        }

        tracing::debug!("Saved conversation {} to {}", conversation.id, path.display());
        Ok(path)
    }

    /// Load one record by id.
    pub fn load(&self, id: &str) -> Result<Conversation, GpytError> {
        check_id(id)?;
        let path = self.record_path(id);
        if !path.exists() {
            return Err(GpytError::ConversationNotFound(id.to_string()));
        }
        read_record(&path)
    }

    /// Read every record under the root, oldest first.
    ///
    /// A missing directory is an empty archive. An unreadable directory is an
    /// error; unreadable or malformed records are reported in
    /// [`LoadReport::failures`] and skipped.
    pub fn load_all(&self) -> Result<LoadReport, GpytError> {
        let dir = self.conversations_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LoadReport::default()),
            Err(e) => {
                return Err(GpytError::persistence(
                    &format!("Failed to read {}", dir.display()),
                    e,
                ))
            }
        };

        let mut report = LoadReport::default();
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    report.failures.push(LoadFailure {
                        path: dir.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if !is_record(&path) {
                continue;
            }

            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            match read_record(&path) {
                Ok(conversation) => report.conversations.push((conversation, modified)),
                Err(e) => {
                    tracing::warn!("Skipping conversation record {}: {e}", path.display());
                    report.failures.push(LoadFailure {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.conversations.sort_by_key(|(_, modified)| *modified);
        Ok(report)
    }
}

fn is_record(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with(paths::RECORD_PREFIX) && name.ends_with(".json")
}

/// Ids become file names, so they must stay a single path component.
fn check_id(id: &str) -> Result<(), GpytError> {
    if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
        return Err(GpytError::Persistence(format!(
            "Invalid conversation id {id:?}"
        )));
    }
    Ok(())
}

/// Parse a record and check that its id matches the file it came from.
fn read_record(path: &Path) -> Result<Conversation, GpytError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| GpytError::persistence("Failed to read conversation file", e))?;
    let conversation: Conversation = serde_json::from_str(&contents)
        .map_err(|e| GpytError::persistence("Failed to parse conversation file", e))?;

    check_id(&conversation.id)?;
    let expected = format!("{}{}.json", paths::RECORD_PREFIX, conversation.id);
    if path.file_name().and_then(|n| n.to_str()) != Some(expected.as_str()) {
        return Err(GpytError::Persistence(format!(
            "Record id {} does not match file {}",
            conversation.id,
            path.display()
        )));
    }
    Ok(conversation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::conversation::ConversationMessage;
    use tempfile::TempDir;

    #[test]
    fn record_name_derives_from_id() {
        let archive = ConversationArchive::new("/cache");
        assert_eq!(
            archive.record_path("abc"),
            PathBuf::from("/cache/conversations/convo-abc.json")
        );
    }

    #[test]
    fn missing_directory_is_empty() {
        let tmp = TempDir::new().unwrap();
        let archive = ConversationArchive::new(tmp.path().join("nothing-here"));
        let report = archive.load_all().unwrap();
        assert!(report.conversations.is_empty());
        assert!(report.failures.is_empty());
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let archive = ConversationArchive::new(tmp.path());
        let mut convo = Conversation::new("Sun distance");
        convo.push(ConversationMessage::user("How far is the sun?"));

        archive.save(&convo).unwrap();
        archive.save(&convo).unwrap();

        let names: Vec<_> = fs::read_dir(archive.conversations_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
        assert_eq!(archive.load(&convo.id).unwrap(), convo);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let archive = ConversationArchive::new(tmp.path());
        assert!(matches!(
            archive.load("missing"),
            Err(GpytError::ConversationNotFound(_))
        ));
    }
}
