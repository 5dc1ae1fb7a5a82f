use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::{Duration, Instant},
};

use anyhow::Context as _;
use chrono::{DateTime, Local};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    recorder::GroupSink,
    recording::Recording,
    router::Provider,
};

pub const SESSION_INDEX_VERSION: &str = "1.0";
pub const MAX_RECORDINGS_PER_GROUP: usize = 1000;
pub const SESSION_INDEX_FILE_NAME: &str = "sessions.json";
pub const GROUPS_DIR_NAME: &str = "groups";

const SAVE_COUNT_THRESHOLD: u32 = 100;
const SAVE_INTERVAL: Duration = Duration::from_secs(60);

/// A set of recordings believed to share an application-level session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionGroup {
    pub trace_id: String,
    pub session_id: String,
    pub recording_ids: Vec<String>,
    pub first_timestamp: DateTime<Local>,
    pub last_timestamp: DateTime<Local>,
    pub request_count: u64,
    pub providers: Vec<Provider>,
    pub has_errors: bool,
}

#[derive(Debug, Default, Clone)]
pub struct ListGroupsOptions {
    pub page: usize,
    pub limit: usize,
    pub from_date: Option<DateTime<Local>>,
    pub to_date: Option<DateTime<Local>>,
    pub provider: Option<Provider>,
    pub has_errors: Option<bool>,
}

/// Session-keyed grouping over recordings, persisted to
/// `groups/sessions.json` on a dirty-write threshold.
pub struct SessionGroupIndex {
    path: PathBuf,
    state: RwLock<GroupState>,
}

struct GroupState {
    groups: IndexMap<String, SessionGroup>,
    by_session_id: HashMap<String, String>,
    by_recording_id: HashMap<String, String>,
    generated_at: DateTime<Local>,
    dirty: bool,
    save_count: u32,
    last_save: Instant,
}

impl Default for GroupState {
    fn default() -> Self {
        Self {
            groups: IndexMap::new(),
            by_session_id: HashMap::new(),
            by_recording_id: HashMap::new(),
            generated_at: Local::now(),
            dirty: false,
            save_count: 0,
            last_save: Instant::now(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SessionIndexFile {
    version: String,
    generated_at: DateTime<Local>,
    total_groups: usize,
    groups: IndexMap<String, SessionGroup>,
}

/// First dash-separated segment of the first `Sentry-Trace` header value.
pub fn extract_trace_id(rec: &Recording) -> Option<String> {
    for (name, values) in &rec.request.headers {
        if !name.eq_ignore_ascii_case("sentry-trace") {
            continue;
        }
        let Some(first) = values.first() else {
            continue;
        };
        // Format: "41cb435ca2a6434b913b733d81c463ae-span123"
        let segment = first.split('-').next().unwrap_or("");
        if !segment.is_empty() {
            return Some(segment.to_owned());
        }
    }
    None
}

/// Session UUID from `request.body.metadata.user_id`, the part after the
/// literal `_session_` marker.
pub fn extract_session_id(rec: &Recording) -> Option<String> {
    let user_id = rec
        .request
        .body
        .as_ref()?
        .get("metadata")?
        .get("user_id")?
        .as_str()?;

    let (_, session) = user_id.split_once("_session_")?;
    if session.is_empty() || session.contains("_session_") {
        return None;
    }
    Some(session.to_owned())
}

/// Primary grouping key: trace id wins over session id. The flag reports
/// which kind of key was found.
pub fn extract_group_key(rec: &Recording) -> Option<(String, bool)> {
    if let Some(trace_id) = extract_trace_id(rec) {
        return Some((trace_id, true));
    }
    extract_session_id(rec).map(|session_id| (session_id, false))
}

impl SessionGroupIndex {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: RwLock::new(GroupState::default()),
        }
    }

    /// Reads the session index. Missing files, parse failures, and version
    /// mismatches all start fresh; only I/O failures are errors.
    pub fn load(&self) -> anyhow::Result<()> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("session index not found, starting fresh");
                return Ok(());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read session index {}", self.path.display()));
            }
        };

        let loaded: SessionIndexFile = match serde_json::from_slice(&data) {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::error!("failed to parse session index, starting fresh: {err}");
                return Ok(());
            }
        };

        if loaded.version != SESSION_INDEX_VERSION {
            tracing::warn!(
                current = SESSION_INDEX_VERSION,
                found = %loaded.version,
                "session index version mismatch, starting fresh"
            );
            return Ok(());
        }

        let mut state = self.write_state();
        state.generated_at = loaded.generated_at;
        state.by_session_id = HashMap::new();
        state.by_recording_id = HashMap::new();
        for (key, group) in &loaded.groups {
            if !group.session_id.is_empty() {
                state.by_session_id.insert(group.session_id.clone(), key.clone());
            }
            for recording_id in &group.recording_ids {
                state.by_recording_id.insert(recording_id.clone(), key.clone());
            }
        }
        state.groups = loaded.groups;
        let (groups, recordings) = (state.groups.len(), state.by_recording_id.len());
        drop(state);

        tracing::info!(groups, recordings, "session index loaded");
        Ok(())
    }

    /// Persists the index when dirty: tmp file plus atomic rename, the same
    /// discipline as the offset index.
    pub fn save(&self) -> anyhow::Result<()> {
        let snapshot = {
            let state = self.read_state();
            if !state.dirty {
                return Ok(());
            }
            SessionIndexFile {
                version: SESSION_INDEX_VERSION.to_owned(),
                generated_at: Local::now(),
                total_groups: state.groups.len(),
                groups: state.groups.clone(),
            }
        };

        let json = serde_json::to_vec_pretty(&snapshot).context("encode session index")?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .with_context(|| format!("write temp session index {}", tmp_path.display()))?;
        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err)
                .with_context(|| format!("rename session index onto {}", self.path.display()));
        }

        let mut state = self.write_state();
        state.generated_at = snapshot.generated_at;
        state.dirty = false;
        state.save_count = 0;
        state.last_save = Instant::now();
        Ok(())
    }

    /// Buckets a recording by its grouping key. Recordings with no key are a
    /// silent no-op; a full group is an error (the write is not rolled back).
    pub fn add_recording(&self, rec: &Recording) -> anyhow::Result<()> {
        let Some((group_key, is_trace_id)) = extract_group_key(rec) else {
            return Ok(());
        };

        let mut state = self.write_state();

        if !state.groups.contains_key(&group_key) {
            let mut group = SessionGroup {
                trace_id: String::new(),
                session_id: String::new(),
                recording_ids: Vec::new(),
                first_timestamp: rec.timestamp,
                last_timestamp: rec.timestamp,
                request_count: 0,
                providers: Vec::new(),
                has_errors: false,
            };

            if is_trace_id {
                group.trace_id = group_key.clone();
                if let Some(session_id) = extract_session_id(rec) {
                    group.session_id = session_id.clone();
                    state.by_session_id.insert(session_id, group_key.clone());
                }
            } else {
                group.session_id = group_key.clone();
                state.by_session_id.insert(group_key.clone(), group_key.clone());
            }

            state.groups.insert(group_key.clone(), group);
        }

        let group = state
            .groups
            .get_mut(&group_key)
            .expect("group was just inserted");

        if group.recording_ids.len() >= MAX_RECORDINGS_PER_GROUP {
            anyhow::bail!(
                "group {group_key} size limit exceeded ({MAX_RECORDINGS_PER_GROUP} recordings)"
            );
        }

        group.recording_ids.push(rec.id.clone());
        group.last_timestamp = rec.timestamp;
        group.request_count += 1;
        if !group.providers.contains(&rec.provider) {
            group.providers.push(rec.provider);
        }
        if !rec.error.is_empty() || rec.response.status >= 400 {
            group.has_errors = true;
        }

        state.by_recording_id.insert(rec.id.clone(), group_key);
        state.dirty = true;
        state.save_count += 1;

        Ok(())
    }

    /// True when dirty and either 100 recordings accumulated or 60 seconds
    /// passed since the last save.
    pub fn should_save(&self) -> bool {
        let state = self.read_state();
        state.dirty
            && (state.save_count >= SAVE_COUNT_THRESHOLD
                || state.last_save.elapsed() >= SAVE_INTERVAL)
    }

    pub fn get_by_trace_id(&self, trace_id: &str) -> Option<SessionGroup> {
        self.read_state().groups.get(trace_id).cloned()
    }

    pub fn get_by_session_id(&self, session_id: &str) -> Option<SessionGroup> {
        let state = self.read_state();
        let key = state.by_session_id.get(session_id)?;
        state.groups.get(key).cloned()
    }

    pub fn get_by_recording_id(&self, recording_id: &str) -> Option<SessionGroup> {
        let state = self.read_state();
        let key = state.by_recording_id.get(recording_id)?;
        state.groups.get(key).cloned()
    }

    /// Filtered, newest-last-activity-first listing with pagination.
    pub fn list_groups(&self, opts: &ListGroupsOptions) -> (Vec<SessionGroup>, usize) {
        let state = self.read_state();

        let mut filtered: Vec<SessionGroup> = state
            .groups
            .values()
            .filter(|group| {
                if let Some(from) = opts.from_date {
                    if group.last_timestamp < from {
                        return false;
                    }
                }
                if let Some(to) = opts.to_date {
                    if group.first_timestamp > to {
                        return false;
                    }
                }
                if let Some(provider) = opts.provider {
                    if !group.providers.contains(&provider) {
                        return false;
                    }
                }
                if let Some(has_errors) = opts.has_errors {
                    if group.has_errors != has_errors {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        drop(state);

        let total = filtered.len();
        filtered.sort_by(|a, b| b.last_timestamp.cmp(&a.last_timestamp));

        let page = opts.page.max(1);
        let limit = if opts.limit < 1 { 50 } else { opts.limit };
        let start = (page - 1) * limit;
        if start >= filtered.len() {
            return (Vec::new(), total);
        }
        let end = (start + limit).min(filtered.len());
        (filtered[start..end].to_vec(), total)
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, GroupState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, GroupState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owns the session index and adapts it to the recorder's `GroupSink` seam.
pub struct Manager {
    sessions: SessionGroupIndex,
}

impl Manager {
    pub fn new(recordings_path: &Path) -> Self {
        let groups_path = recordings_path.join(GROUPS_DIR_NAME);
        if let Err(err) = fs::create_dir_all(&groups_path) {
            tracing::error!(path = %groups_path.display(), "failed to create groups directory: {err}");
        }

        let sessions = SessionGroupIndex::new(groups_path.join(SESSION_INDEX_FILE_NAME));
        if let Err(err) = sessions.load() {
            tracing::error!("failed to load session index: {err}");
        }

        Self { sessions }
    }

    pub fn sessions(&self) -> &SessionGroupIndex {
        &self.sessions
    }

    pub fn list_session_groups(&self, opts: &ListGroupsOptions) -> (Vec<SessionGroup>, usize) {
        self.sessions.list_groups(opts)
    }

    pub fn get_session_group(&self, trace_id: &str) -> Option<SessionGroup> {
        self.sessions.get_by_trace_id(trace_id)
    }
}

impl GroupSink for Manager {
    fn on_recording_write(&self, rec: &Recording) -> anyhow::Result<()> {
        if let Err(err) = self.sessions.add_recording(rec) {
            tracing::error!(recording_id = %rec.id, "failed to add recording to session index: {err}");
        }

        if self.sessions.should_save() {
            if let Err(err) = self.sessions.save() {
                tracing::error!("failed to save session index: {err}");
            }
        }

        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        self.sessions.save().context("save session index")?;
        tracing::info!("grouping manager closed");
        Ok(())
    }
}
