//! Session index store - per-project catalog of prior conversations
//!
//! One JSON index document per project, living under
//! `<agent_dir>/projects/<encoded-project-path>/index.json` and shared
//! with external tooling (which appends new sessions; we only list and
//! delete). Absence of history is a normal state, never an error: a
//! missing or malformed index reads as empty, and delete races where
//! the backing files are already gone are swallowed — the goal (the
//! entry no longer resolvable) is achieved either way.
//!
//! All writes are whole-file pretty-printed rewrites. Concurrent
//! external writers are last-writer-wins; single-user usage makes this
//! an accepted risk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::log::{log_info, log_warn};

/// Current index document version.
pub const INDEX_VERSION: u32 = 1;

/// Index document file name within a project's encoded directory.
pub const INDEX_FILE: &str = "index.json";

/// One recorded conversation session. camelCase on disk; timestamps are
/// Unix milliseconds (the external format's origin).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub session_id: String,
    /// Backing transcript file for this session
    pub full_path: String,
    pub first_prompt: String,
    pub summary: String,
    pub message_count: u64,
    pub created: i64,
    pub modified: i64,
    pub project_path: String,
    /// Sidechain sessions (sub-agent transcripts) are hidden from listings
    #[serde(default)]
    pub is_sidechain: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
}

/// The on-disk index document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIndex {
    pub version: u32,
    pub entries: Vec<SessionEntry>,
    pub original_path: String,
}

impl SessionIndex {
    pub fn new(original_path: &str) -> Self {
        Self {
            version: INDEX_VERSION,
            entries: Vec::new(),
            original_path: original_path.to_string(),
        }
    }
}

/// Encode a project's absolute path into its index directory name:
/// every path separator becomes a hyphen.
///
/// Known ambiguity, kept for compatibility with the external index
/// layout: a literal hyphen in a directory name is indistinguishable
/// from an encoded separator.
pub fn encode_project_path(project_path: &str) -> String {
    project_path.replace(std::path::MAIN_SEPARATOR, "-")
}

/// Reads and rewrites per-project session indexes.
pub struct SessionStore {
    projects_dir: PathBuf,
}

impl SessionStore {
    pub fn new(projects_dir: PathBuf) -> Self {
        Self { projects_dir }
    }

    /// Store rooted at the configured agent directory.
    pub fn open() -> Self {
        Self::new(crate::paths::projects_dir())
    }

    fn index_path(&self, project_path: &str) -> PathBuf {
        self.projects_dir
            .join(encode_project_path(project_path))
            .join(INDEX_FILE)
    }

    /// Read the raw index document. Missing file or malformed JSON is
    /// normal (no history yet) and reads as None.
    fn read_index(&self, project_path: &str) -> Option<SessionIndex> {
        let path = self.index_path(project_path);
        let data = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&data) {
            Ok(index) => Some(index),
            Err(e) => {
                log_warn(
                    "store",
                    "index.malformed",
                    &format!("{}: {}", path.display(), e),
                );
                None
            }
        }
    }

    /// List sessions for a project: sidechains filtered out, sorted
    /// descending by modified time (stable — ties keep index order).
    pub fn list(&self, project_path: &str) -> Vec<SessionEntry> {
        let Some(index) = self.read_index(project_path) else {
            return Vec::new();
        };

        let mut entries: Vec<SessionEntry> = index
            .entries
            .into_iter()
            .filter(|e| !e.is_sidechain)
            .collect();
        entries.sort_by(|a, b| b.modified.cmp(&a.modified));
        entries
    }

    /// Delete a session: remove its backing transcript file and
    /// same-named subdirectory (both best-effort), drop the entry, and
    /// rewrite the whole index. Unreadable index or unknown id is a
    /// silent no-op. Idempotent.
    ///
    /// Returns whether an entry was removed.
    pub fn delete(&self, project_path: &str, session_id: &str) -> bool {
        let Some(mut index) = self.read_index(project_path) else {
            return false;
        };

        let Some(pos) = index.entries.iter().position(|e| e.session_id == session_id) else {
            return false;
        };
        let entry = index.entries.remove(pos);

        // Backing transcript: already gone is fine
        let full_path = Path::new(&entry.full_path);
        let _ = fs::remove_file(full_path);

        // Same-named session subdirectory next to the transcript
        if let Some(parent) = full_path.parent() {
            let _ = fs::remove_dir_all(parent.join(session_id));
        }

        if let Err(e) = self.save(project_path, &index) {
            log_warn(
                "store",
                "index.rewrite_fail",
                &format!("{}: {}", project_path, e),
            );
        } else {
            log_info("store", "session.deleted", session_id);
        }
        true
    }

    /// Rewrite the whole index document, pretty-printed.
    pub fn save(&self, project_path: &str, index: &SessionIndex) -> Result<()> {
        let path = self.index_path(project_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create index dir {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(index).context("serialize session index")?;
        fs::write(&path, json).with_context(|| format!("write index {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(id: &str, modified: i64, sidechain: bool, dir: &Path) -> SessionEntry {
        SessionEntry {
            session_id: id.to_string(),
            full_path: dir.join(format!("{}.jsonl", id)).display().to_string(),
            first_prompt: format!("prompt for {}", id),
            summary: format!("summary for {}", id),
            message_count: 3,
            created: modified - 1000,
            modified,
            project_path: "/home/u/proj".to_string(),
            is_sidechain: sidechain,
            git_branch: None,
        }
    }

    fn store_with_index(entries: Vec<SessionEntry>) -> (TempDir, SessionStore) {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().to_path_buf());
        let mut index = SessionIndex::new("/home/u/proj");
        index.entries = entries;
        store.save("/home/u/proj", &index).unwrap();
        (tmp, store)
    }

    // ---- path encoding ----

    #[test]
    fn encodes_separators_as_hyphens() {
        assert_eq!(encode_project_path("/home/u/proj"), "-home-u-proj");
    }

    #[test]
    fn encoding_is_lossy_for_literal_hyphens() {
        // Documented ambiguity: these two distinct paths collide
        assert_eq!(
            encode_project_path("/home/u/my-proj"),
            encode_project_path("/home/u/my/proj")
        );
    }

    // ---- list ----

    #[test]
    fn list_missing_index_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().to_path_buf());
        assert!(store.list("/nowhere").is_empty());
    }

    #[test]
    fn list_malformed_index_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().to_path_buf());
        let dir = tmp.path().join(encode_project_path("/home/u/proj"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(INDEX_FILE), "{not json").unwrap();
        assert!(store.list("/home/u/proj").is_empty());
    }

    #[test]
    fn list_round_trip_sorted_desc_without_sidechains() {
        let tmp_art = TempDir::new().unwrap();
        let (_tmp, store) = store_with_index(vec![
            entry("old", 100, false, tmp_art.path()),
            entry("side", 300, true, tmp_art.path()),
            entry("new", 200, false, tmp_art.path()),
        ]);

        let listed = store.list("/home/u/proj");
        let ids: Vec<&str> = listed.iter().map(|e| e.session_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[test]
    fn list_stable_on_modified_ties() {
        let tmp_art = TempDir::new().unwrap();
        let (_tmp, store) = store_with_index(vec![
            entry("first", 500, false, tmp_art.path()),
            entry("second", 500, false, tmp_art.path()),
            entry("third", 500, false, tmp_art.path()),
        ]);

        let ids: Vec<String> = store
            .list("/home/u/proj")
            .into_iter()
            .map(|e| e.session_id)
            .collect();
        // Ties keep original index order
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    // ---- delete ----

    #[test]
    fn delete_removes_entry_and_artifacts() {
        let artifacts = TempDir::new().unwrap();
        let transcript = artifacts.path().join("s1.jsonl");
        fs::write(&transcript, "{}\n").unwrap();
        let side_dir = artifacts.path().join("s1");
        fs::create_dir_all(side_dir.join("nested")).unwrap();

        let (_tmp, store) = store_with_index(vec![
            entry("s1", 100, false, artifacts.path()),
            entry("s2", 200, false, artifacts.path()),
        ]);

        assert!(store.delete("/home/u/proj", "s1"));
        assert!(!transcript.exists());
        assert!(!side_dir.exists());

        let remaining = store.list("/home/u/proj");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].session_id, "s2");
    }

    #[test]
    fn delete_missing_artifact_still_removes_entry() {
        let artifacts = TempDir::new().unwrap();
        // No transcript file on disk at all
        let (_tmp, store) = store_with_index(vec![entry("ghost", 100, false, artifacts.path())]);

        assert!(store.delete("/home/u/proj", "ghost"));
        assert!(store.list("/home/u/proj").is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let artifacts = TempDir::new().unwrap();
        let (_tmp, store) = store_with_index(vec![
            entry("s1", 100, false, artifacts.path()),
            entry("s2", 200, false, artifacts.path()),
        ]);

        assert!(store.delete("/home/u/proj", "s1"));
        let after_first = store.list("/home/u/proj");

        // Second delete is a no-op with the same end state
        assert!(!store.delete("/home/u/proj", "s1"));
        assert_eq!(store.list("/home/u/proj"), after_first);
    }

    #[test]
    fn delete_unknown_id_is_noop() {
        let artifacts = TempDir::new().unwrap();
        let (_tmp, store) = store_with_index(vec![entry("s1", 100, false, artifacts.path())]);
        assert!(!store.delete("/home/u/proj", "nope"));
        assert_eq!(store.list("/home/u/proj").len(), 1);
    }

    #[test]
    fn delete_without_index_is_noop() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().to_path_buf());
        assert!(!store.delete("/home/u/proj", "s1"));
    }

    // ---- persistence format ----

    #[test]
    fn index_on_disk_is_camel_case_pretty_json() {
        let artifacts = TempDir::new().unwrap();
        let (tmp, store) = store_with_index(vec![entry("s1", 100, false, artifacts.path())]);
        let raw = fs::read_to_string(
            tmp.path()
                .join(encode_project_path("/home/u/proj"))
                .join(INDEX_FILE),
        )
        .unwrap();
        assert!(raw.contains("\"sessionId\""));
        assert!(raw.contains("\"messageCount\""));
        assert!(raw.contains('\n'), "expected pretty-printed output");
        drop(store);
    }

    #[test]
    fn entries_survive_round_trip() {
        let artifacts = TempDir::new().unwrap();
        let mut e = entry("s1", 100, false, artifacts.path());
        e.git_branch = Some("main".to_string());
        let (_tmp, store) = store_with_index(vec![e.clone()]);
        assert_eq!(store.list("/home/u/proj"), vec![e]);
    }
}
