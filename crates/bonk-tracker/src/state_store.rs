use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bonk_github::RepoRef;

use crate::state::{RepositoryTrackerState, TRACKER_STATE_SCHEMA_VERSION};

const TRACKER_STATE_DIR: &str = "trackers";

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

pub fn tracker_state_path(state_dir: &Path, repo: &RepoRef) -> PathBuf {
    state_dir
        .join(TRACKER_STATE_DIR)
        .join(format!("{}.json", repo.storage_key()))
}

/// Lists every persisted tracker state file under `state_dir`.
pub fn list_tracker_state_files(state_dir: &Path) -> Result<Vec<PathBuf>> {
    let dir = state_dir.join(TRACKER_STATE_DIR);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(&dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
    {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", dir.display()))?
            .path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Loads persisted state.
///
/// A missing file yields `Ok(None)`. Corrupt or incompatible files are
/// reported as errors so the caller can decide whether to start fresh.
pub fn load_tracker_state(path: &Path) -> Result<Option<RepositoryTrackerState>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let state = serde_json::from_str::<RepositoryTrackerState>(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    if state.schema_version != TRACKER_STATE_SCHEMA_VERSION {
        bail!(
            "unsupported tracker state schema: expected {}, found {}",
            TRACKER_STATE_SCHEMA_VERSION,
            state.schema_version
        );
    }
    Ok(Some(state))
}

/// Loads state for `repo`, starting fresh when the file is unusable.
pub fn load_or_default_tracker_state(path: &Path, repo: &RepoRef) -> RepositoryTrackerState {
    match load_tracker_state(path) {
        Ok(Some(state)) if state.repo == *repo => state,
        Ok(Some(state)) => {
            tracing::warn!(
                path = %path.display(),
                expected = %repo,
                found = %state.repo,
                "tracker state belongs to another repository; starting fresh"
            );
            RepositoryTrackerState::new(repo.clone())
        }
        Ok(None) => RepositoryTrackerState::new(repo.clone()),
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                error = %format!("{error:#}"),
                "tracker state unreadable; starting fresh"
            );
            RepositoryTrackerState::new(repo.clone())
        }
    }
}

pub fn save_tracker_state(path: &Path, state: &RepositoryTrackerState) -> Result<()> {
    let mut payload =
        serde_json::to_string_pretty(state).context("failed to serialize tracker state")?;
    payload.push('\n');
    write_text_atomic(path, &payload)
}

/// Temp file plus rename so readers never observe a partial write.
fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)
        .with_context(|| format!("failed to create {}", parent_dir.display()))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("tracker-state");
    let temp_path = parent_dir.join(format!(
        ".{file_name}.tmp-{}-{}",
        std::process::id(),
        current_unix_timestamp_ms()
    ));
    std::fs::write(&temp_path, content)
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            temp_path.display(),
            path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use bonk_github::RepoRef;
    use tempfile::tempdir;

    use super::{
        list_tracker_state_files, load_or_default_tracker_state, load_tracker_state,
        save_tracker_state, tracker_state_path,
    };
    use crate::state::{PendingCorrelation, RepositoryTrackerState};
    use crate::triggers::TriggerKind;

    #[test]
    fn functional_state_survives_save_and_load() {
        let temp = tempdir().expect("tempdir");
        let repo = RepoRef::new("Acme", "Widgets");
        let path = tracker_state_path(temp.path(), &repo);
        assert!(path.ends_with("trackers/acme__widgets.json"));

        let mut state = RepositoryTrackerState::new(repo.clone());
        state.installation_id = Some(77);
        state.pending.push(PendingCorrelation {
            key: "alice:2024-01-01T00:00:00Z".to_string(),
            actor: "alice".to_string(),
            request_timestamp: "2024-01-01T00:00:00Z".to_string(),
            issue_number: 42,
            created_unix_ms: 1_000,
        });
        state.triggers.schedule(
            TriggerKind::Cleanup {
                key: "alice:2024-01-01T00:00:00Z".to_string(),
            },
            601_000,
        );
        save_tracker_state(&path, &state).expect("save");

        let loaded = load_tracker_state(&path).expect("load").expect("present");
        assert_eq!(loaded, state);
        assert_eq!(
            list_tracker_state_files(temp.path()).expect("list"),
            vec![path]
        );
    }

    #[test]
    fn unit_missing_state_file_loads_as_none() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("trackers/none.json");
        assert!(load_tracker_state(&path).expect("load").is_none());
        assert!(list_tracker_state_files(temp.path()).expect("list").is_empty());
    }

    #[test]
    fn regression_corrupt_state_file_starts_fresh() {
        let temp = tempdir().expect("tempdir");
        let repo = RepoRef::new("acme", "widgets");
        let path = tracker_state_path(temp.path(), &repo);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, "{not json").expect("write");

        assert!(load_tracker_state(&path).is_err());
        let state = load_or_default_tracker_state(&path, &repo);
        assert_eq!(state, RepositoryTrackerState::new(repo));
    }

    #[test]
    fn regression_schema_mismatch_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let repo = RepoRef::new("acme", "widgets");
        let path = tracker_state_path(temp.path(), &repo);
        let mut state = RepositoryTrackerState::new(repo);
        state.schema_version = 99;
        save_tracker_state(&path, &state).expect("save");
        let error = load_tracker_state(&path).expect_err("schema mismatch");
        assert!(error.to_string().contains("unsupported tracker state schema"));
    }
}
