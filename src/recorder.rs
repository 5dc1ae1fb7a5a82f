use std::{
    fs::{self, OpenOptions},
    io::Write as _,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Context as _;
use chrono::Local;
use tokio::sync::{mpsc, oneshot};

use crate::{
    index::{IndexEntry, RecordingIndex},
    recording::Recording,
};

const RECORD_QUEUE_DEPTH: usize = 100;

/// Seam between the recorder and the grouping index. Injecting `None`
/// disables grouping without branching at every call site.
pub trait GroupSink: Send + Sync {
    fn on_recording_write(&self, rec: &Recording) -> anyhow::Result<()>;
    fn close(&self) -> anyhow::Result<()>;
}

/// Single-writer asynchronous recorder. `record` never blocks the caller:
/// the queue is bounded and overflow drops the recording with a warning.
pub struct Recorder {
    enabled: bool,
    tx: Option<mpsc::Sender<Recording>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    index: Arc<RecordingIndex>,
    groups: Option<Arc<dyn GroupSink>>,
}

impl Recorder {
    pub fn new(
        enabled: bool,
        path: PathBuf,
        groups: Option<Arc<dyn GroupSink>>,
    ) -> anyhow::Result<Self> {
        let index = Arc::new(RecordingIndex::new(path.clone()));

        if !enabled {
            return Ok(Self {
                enabled,
                tx: None,
                stop_tx: Mutex::new(None),
                worker: Mutex::new(None),
                index,
                groups,
            });
        }

        fs::create_dir_all(&path)
            .with_context(|| format!("create recordings directory {}", path.display()))?;

        match index.load() {
            Err(err) => {
                tracing::error!("failed to load index, will rebuild: {err}");
                if let Err(err) = index.rebuild() {
                    tracing::error!("failed to rebuild index: {err}");
                }
            }
            Ok(()) if index.is_empty() => {
                tracing::info!("index is empty, rebuilding from existing recordings");
                if let Err(err) = index.rebuild() {
                    tracing::error!("failed to rebuild index: {err}");
                }
            }
            Ok(()) => {}
        }

        let (tx, rx) = mpsc::channel(RECORD_QUEUE_DEPTH);
        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = tokio::spawn(worker_loop(
            path,
            rx,
            stop_rx,
            Arc::clone(&index),
            groups.clone(),
        ));

        Ok(Self {
            enabled,
            tx: Some(tx),
            stop_tx: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(Some(worker)),
            index,
            groups,
        })
    }

    /// Hands a recording to the writer without waiting. A full queue drops
    /// the recording; the client is never delayed by the recorder.
    pub fn record(&self, rec: Recording) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };

        if let Err(err) = tx.try_send(rec) {
            let id = match &err {
                mpsc::error::TrySendError::Full(rec)
                | mpsc::error::TrySendError::Closed(rec) => rec.id.clone(),
            };
            tracing::warn!(id = %id, "recording channel full, dropping recording");
        }
    }

    pub fn index(&self) -> Arc<RecordingIndex> {
        Arc::clone(&self.index)
    }

    /// Stops the worker, drains the remaining queue, closes the grouping
    /// sink, and flushes the index. Only a failed index save is fatal.
    pub async fn close(&self) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let stop_tx = self
            .stop_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(());
        }

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        if let Some(groups) = self.groups.as_ref() {
            if let Err(err) = groups.close() {
                tracing::error!("failed to close grouping manager: {err}");
            }
        }

        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || index.save())
            .await
            .context("join index save task")?
            .context("save index on close")
    }
}

async fn worker_loop(
    path: PathBuf,
    mut rx: mpsc::Receiver<Recording>,
    mut stop_rx: oneshot::Receiver<()>,
    index: Arc<RecordingIndex>,
    groups: Option<Arc<dyn GroupSink>>,
) {
    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                // Drain whatever is still queued before shutting down.
                while let Ok(rec) = rx.try_recv() {
                    write_one(&path, &index, &groups, rec).await;
                }
                return;
            }
            rec = rx.recv() => match rec {
                Some(rec) => write_one(&path, &index, &groups, rec).await,
                None => return,
            }
        }
    }
}

async fn write_one(
    path: &Path,
    index: &Arc<RecordingIndex>,
    groups: &Option<Arc<dyn GroupSink>>,
    rec: Recording,
) {
    let id = rec.id.clone();
    let path = path.to_path_buf();
    let index = Arc::clone(index);
    let groups = groups.clone();

    let result =
        tokio::task::spawn_blocking(move || write_recording_blocking(&path, &index, &groups, rec))
            .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(id = %id, "failed to write recording: {err}"),
        Err(err) => tracing::error!(id = %id, "recording write task failed: {err}"),
    }
}

fn write_recording_blocking(
    dir: &Path,
    index: &RecordingIndex,
    groups: &Option<Arc<dyn GroupSink>>,
    rec: Recording,
) -> anyhow::Result<()> {
    let filename = format!("recordings-{}.jsonl", Local::now().format("%Y-%m-%d"));
    let full_path = dir.join(&filename);

    // The current file size is the offset of the line we are about to append.
    let offset = fs::metadata(&full_path).map(|meta| meta.len()).unwrap_or(0);

    let mut data = serde_json::to_vec(&rec).context("serialize recording")?;
    let length = data.len() as u64;
    data.push(b'\n');

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&full_path)
        .with_context(|| format!("open recording file {}", full_path.display()))?;
    file.write_all(&data)
        .with_context(|| format!("append recording to {}", full_path.display()))?;

    index.add(IndexEntry {
        id: rec.id.clone(),
        filename,
        offset,
        length,
        timestamp: rec.timestamp,
        provider: rec.provider,
    });

    if let Some(groups) = groups.as_ref() {
        // Grouping failures never fail the recording write.
        if let Err(err) = groups.on_recording_write(&rec) {
            tracing::error!(id = %rec.id, "failed to update grouping indexes: {err}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use chrono::Local;

    use super::{GroupSink, Recorder};
    use crate::{recording::Recording, router::Provider};

    struct CountingSink {
        writes: AtomicUsize,
        closes: AtomicUsize,
    }

    impl GroupSink for CountingSink {
        fn on_recording_write(&self, _rec: &Recording) -> anyhow::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) -> anyhow::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample_recording(path: &str) -> Recording {
        let mut rec = Recording::new(Provider::Openai, "POST", path, "", Local::now());
        rec.response.status = 200;
        rec
    }

    #[tokio::test]
    async fn writes_are_ordered_and_flushed_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let recorder =
            Recorder::new(true, dir.path().to_path_buf(), None).expect("recorder should start");

        let first = sample_recording("/v1/chat/completions");
        let second = sample_recording("/v1/embeddings");
        let third = sample_recording("/v1/models");
        let expected = vec![first.id.clone(), second.id.clone(), third.id.clone()];

        recorder.record(first);
        recorder.record(second);
        recorder.record(third);
        recorder.close().await.unwrap();

        let filename = format!("recordings-{}.jsonl", Local::now().format("%Y-%m-%d"));
        let data = std::fs::read_to_string(dir.path().join(filename)).unwrap();
        let ids: Vec<String> = data
            .lines()
            .map(|line| {
                serde_json::from_str::<Recording>(line)
                    .expect("line should parse")
                    .id
            })
            .collect();
        assert_eq!(ids, expected);

        // Close flushed the index; a fresh load sees every entry.
        let index = crate::index::RecordingIndex::new(dir.path());
        index.load().unwrap();
        assert_eq!(index.len(), 3);
        for id in &expected {
            let read = index.read_recording(id).unwrap().unwrap();
            assert_eq!(&read.id, id);
        }
    }

    #[tokio::test]
    async fn group_sink_is_notified_per_write_and_closed_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CountingSink {
            writes: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        let recorder = Recorder::new(
            true,
            dir.path().to_path_buf(),
            Some(Arc::clone(&sink) as Arc<dyn GroupSink>),
        )
        .unwrap();

        recorder.record(sample_recording("/v1/chat/completions"));
        recorder.record(sample_recording("/v1/chat/completions"));
        recorder.close().await.unwrap();

        assert_eq!(sink.writes.load(Ordering::SeqCst), 2);
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_recorder_drops_everything_silently() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(false, dir.path().to_path_buf(), None).unwrap();

        recorder.record(sample_recording("/v1/chat/completions"));
        recorder.close().await.unwrap();

        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
