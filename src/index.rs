use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufRead as _, BufReader, Seek as _, SeekFrom},
    path::{Path, PathBuf},
    sync::RwLock,
};

use anyhow::Context as _;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::{recording::Recording, router::Provider};

pub const INDEX_FILE_NAME: &str = "index.json";
const RECORDING_FILE_PREFIX: &str = "recordings-";
const RECORDING_FILE_SUFFIX: &str = ".jsonl";

/// Locator for one recording line inside a daily JSONL file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub filename: String,
    pub offset: u64,
    pub length: u64,
    pub timestamp: DateTime<Local>,
    pub provider: Provider,
}

/// In-memory id -> location map over the recordings directory, persisted as
/// a JSON array in `index.json`.
pub struct RecordingIndex {
    path: PathBuf,
    state: RwLock<IndexState>,
}

#[derive(Default)]
struct IndexState {
    entries: HashMap<String, IndexEntry>,
    dirty: bool,
}

/// Minimal per-line parse used by Rebuild.
#[derive(Deserialize)]
struct PartialRecording {
    id: String,
    timestamp: DateTime<Local>,
    provider: Provider,
}

impl RecordingIndex {
    pub fn new(recordings_path: impl Into<PathBuf>) -> Self {
        Self {
            path: recordings_path.into(),
            state: RwLock::new(IndexState::default()),
        }
    }

    pub fn recordings_path(&self) -> &Path {
        &self.path
    }

    /// Reads `index.json`. A missing file starts empty; a malformed file is
    /// an error so the caller can trigger a rebuild.
    pub fn load(&self) -> anyhow::Result<()> {
        let index_path = self.path.join(INDEX_FILE_NAME);
        let data = match fs::read(&index_path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("open index {}", index_path.display()));
            }
        };

        let entries: Vec<IndexEntry> = serde_json::from_slice(&data)
            .with_context(|| format!("decode index {}", index_path.display()))?;

        let mut state = self.write_state();
        state.entries = entries
            .into_iter()
            .map(|entry| (entry.id.clone(), entry))
            .collect();
        let count = state.entries.len();
        drop(state);

        tracing::info!(count, "loaded recording index");
        Ok(())
    }

    /// Persists the index when dirty: pretty JSON to a tmp file, then an
    /// atomic rename onto `index.json`.
    pub fn save(&self) -> anyhow::Result<()> {
        let mut entries: Vec<IndexEntry> = {
            let state = self.read_state();
            if !state.dirty {
                return Ok(());
            }
            state.entries.values().cloned().collect()
        };
        entries.sort_by(|a, b| a.id.cmp(&b.id));

        let index_path = self.path.join(INDEX_FILE_NAME);
        let tmp_path = self.path.join(format!("{INDEX_FILE_NAME}.tmp"));

        let json = serde_json::to_vec_pretty(&entries).context("encode index")?;
        fs::write(&tmp_path, json)
            .with_context(|| format!("write temp index {}", tmp_path.display()))?;
        if let Err(err) = fs::rename(&tmp_path, &index_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err)
                .with_context(|| format!("rename temp index onto {}", index_path.display()));
        }

        self.write_state().dirty = false;
        tracing::info!(count = entries.len(), "saved recording index");
        Ok(())
    }

    pub fn add(&self, entry: IndexEntry) {
        let mut state = self.write_state();
        state.entries.insert(entry.id.clone(), entry);
        state.dirty = true;
    }

    pub fn get(&self, id: &str) -> Option<IndexEntry> {
        self.read_state().entries.get(id).cloned()
    }

    /// Exact match first, then first entry whose id starts with the prefix.
    pub fn get_by_prefix(&self, prefix: &str) -> Option<IndexEntry> {
        let state = self.read_state();
        if let Some(entry) = state.entries.get(prefix) {
            return Some(entry.clone());
        }
        state
            .entries
            .iter()
            .find(|(id, _)| id.starts_with(prefix))
            .map(|(_, entry)| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.read_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rescans every daily JSONL file and replaces the in-memory map.
    /// Unparseable lines are skipped; the running offset still advances.
    pub fn rebuild(&self) -> anyhow::Result<()> {
        tracing::info!(path = %self.path.display(), "rebuilding recording index");

        let dir = fs::read_dir(&self.path)
            .with_context(|| format!("read recordings directory {}", self.path.display()))?;

        let mut rebuilt = HashMap::new();
        let mut files = 0usize;
        for entry in dir {
            let entry = entry.context("iterate recordings directory")?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_recording_file_name(&name) {
                continue;
            }
            files += 1;

            if let Err(err) = index_file(&self.path.join(&name), &name, &mut rebuilt) {
                tracing::error!(file = %name, "failed to index file: {err}");
            }
        }

        let total = rebuilt.len();
        let mut state = self.write_state();
        state.entries = rebuilt;
        state.dirty = true;
        drop(state);

        tracing::info!(files, recordings = total, "rebuilt recording index");
        Ok(())
    }

    /// Reads one recording by id or id prefix: seek to the indexed offset,
    /// read a single line, unmarshal.
    pub fn read_recording(&self, id: &str) -> anyhow::Result<Option<Recording>> {
        let Some(entry) = self.get_by_prefix(id) else {
            return Ok(None);
        };

        let file_path = self.path.join(&entry.filename);
        let mut file = File::open(&file_path)
            .with_context(|| format!("open recording file {}", file_path.display()))?;
        file.seek(SeekFrom::Start(entry.offset))
            .with_context(|| format!("seek to offset {} in {}", entry.offset, entry.filename))?;

        let capacity = usize::try_from(entry.length).unwrap_or(usize::MAX).saturating_add(1024);
        let mut reader = BufReader::with_capacity(capacity, file);
        let mut line = Vec::new();
        reader
            .read_until(b'\n', &mut line)
            .with_context(|| format!("read recording line from {}", entry.filename))?;

        let recording: Recording = serde_json::from_slice(&line)
            .with_context(|| format!("parse recording {}", entry.id))?;
        Ok(Some(recording))
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, IndexState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, IndexState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn is_recording_file_name(name: &str) -> bool {
    name.starts_with(RECORDING_FILE_PREFIX) && name.ends_with(RECORDING_FILE_SUFFIX)
}

fn index_file(
    path: &Path,
    filename: &str,
    entries: &mut HashMap<String, IndexEntry>,
) -> anyhow::Result<()> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut offset = 0u64;
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .with_context(|| format!("read line from {filename}"))?;
        if read == 0 {
            break;
        }

        let content = match line.last() {
            Some(b'\n') => &line[..line.len() - 1],
            _ => &line[..],
        };
        let length = content.len() as u64;
        if length == 0 {
            offset += read as u64;
            continue;
        }

        match serde_json::from_slice::<PartialRecording>(content) {
            Ok(partial) => {
                entries.insert(
                    partial.id.clone(),
                    IndexEntry {
                        id: partial.id,
                        filename: filename.to_owned(),
                        offset,
                        length,
                        timestamp: partial.timestamp,
                        provider: partial.provider,
                    },
                );
            }
            Err(err) => {
                tracing::error!(file = %filename, "failed to parse recording for indexing: {err}");
            }
        }

        offset += read as u64;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::Local;

    use super::{IndexEntry, RecordingIndex};
    use crate::{recording::Recording, router::Provider};

    fn write_day_file(dir: &std::path::Path, recordings: &[Recording]) -> String {
        let filename = format!("recordings-{}.jsonl", Local::now().format("%Y-%m-%d"));
        let mut data = Vec::new();
        for rec in recordings {
            data.extend_from_slice(&serde_json::to_vec(rec).unwrap());
            data.push(b'\n');
        }
        fs::write(dir.join(&filename), data).unwrap();
        filename
    }

    fn sample_recording(path: &str) -> Recording {
        let mut rec = Recording::new(Provider::Claude, "POST", path, "", Local::now());
        rec.response.status = 200;
        rec
    }

    #[test]
    fn rebuild_then_read_round_trips_every_recording() {
        let dir = tempfile::tempdir().unwrap();
        let recordings = vec![
            sample_recording("/v1/messages"),
            sample_recording("/v1/messages/2"),
            sample_recording("/v1/messages/3"),
        ];
        write_day_file(dir.path(), &recordings);

        let index = RecordingIndex::new(dir.path());
        index.rebuild().unwrap();
        assert_eq!(index.len(), 3);

        for rec in &recordings {
            let read = index.read_recording(&rec.id).unwrap().unwrap();
            assert_eq!(read.id, rec.id);
            assert_eq!(read.request.path, rec.request.path);
        }
    }

    #[test]
    fn prefix_lookup_resolves_eight_char_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let recordings = vec![sample_recording("/v1/messages")];
        write_day_file(dir.path(), &recordings);

        let index = RecordingIndex::new(dir.path());
        index.rebuild().unwrap();

        // The date prefix is shared, so go one dash further for uniqueness.
        let prefix = &recordings[0].id[..14];
        let read = index.read_recording(prefix).unwrap().unwrap();
        assert_eq!(read.id, recordings[0].id);

        assert!(index.read_recording("99999999-none").unwrap().is_none());
    }

    #[test]
    fn rebuild_is_idempotent_and_survives_save_load() {
        let dir = tempfile::tempdir().unwrap();
        write_day_file(
            dir.path(),
            &[sample_recording("/v1/messages"), sample_recording("/v1/complete")],
        );

        let index = RecordingIndex::new(dir.path());
        index.rebuild().unwrap();
        index.save().unwrap();
        let saved: Vec<IndexEntry> = serde_json::from_slice(
            &fs::read(dir.path().join("index.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(saved.len(), 2);

        index.rebuild().unwrap();
        index.save().unwrap();
        let resaved: Vec<IndexEntry> = serde_json::from_slice(
            &fs::read(dir.path().join("index.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(saved, resaved);

        let reloaded = RecordingIndex::new(dir.path());
        reloaded.load().unwrap();
        assert_eq!(reloaded.len(), 2);
        for entry in &resaved {
            assert_eq!(reloaded.get(&entry.id), Some(entry.clone()));
        }
    }

    #[test]
    fn rebuild_skips_malformed_lines_but_keeps_offsets_correct() {
        let dir = tempfile::tempdir().unwrap();
        let good_before = sample_recording("/v1/messages");
        let good_after = sample_recording("/v1/complete");

        let filename = format!("recordings-{}.jsonl", Local::now().format("%Y-%m-%d"));
        let mut data = Vec::new();
        data.extend_from_slice(&serde_json::to_vec(&good_before).unwrap());
        data.push(b'\n');
        data.extend_from_slice(b"this is not json\n");
        data.extend_from_slice(&serde_json::to_vec(&good_after).unwrap());
        data.push(b'\n');
        fs::write(dir.path().join(filename), data).unwrap();

        let index = RecordingIndex::new(dir.path());
        index.rebuild().unwrap();
        assert_eq!(index.len(), 2);

        let read = index.read_recording(&good_after.id).unwrap().unwrap();
        assert_eq!(read.request.path, "/v1/complete");
    }

    #[test]
    fn load_missing_index_starts_empty_and_malformed_errors() {
        let dir = tempfile::tempdir().unwrap();
        let index = RecordingIndex::new(dir.path());
        index.load().unwrap();
        assert!(index.is_empty());

        fs::write(dir.path().join("index.json"), b"{ not valid").unwrap();
        let err = RecordingIndex::new(dir.path()).load().unwrap_err();
        assert!(err.to_string().contains("decode index"));
    }

    #[test]
    fn save_is_a_no_op_until_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let index = RecordingIndex::new(dir.path());
        index.save().unwrap();
        assert!(!dir.path().join("index.json").exists());

        let rec = sample_recording("/v1/messages");
        index.add(IndexEntry {
            id: rec.id.clone(),
            filename: "recordings-2025-01-01.jsonl".to_owned(),
            offset: 0,
            length: 10,
            timestamp: rec.timestamp,
            provider: rec.provider,
        });
        index.save().unwrap();
        assert!(dir.path().join("index.json").exists());
    }
}
