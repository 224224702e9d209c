// ===============================
// src/recorder.rs
// ===============================
//
// Session journal: one JSON line per exchange callback received and per
// command sent, so a session can be replayed or audited afterwards.
// Buffered; flushed every second, every 1000 lines and on close.
//
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::Event;

const FLUSH_BATCH: u32 = 1000;

struct Journal {
    path: PathBuf,
    out: BufWriter<File>,
    unflushed: u32,
}

impl Journal {
    async fn open(path: PathBuf) -> std::io::Result<Self> {
        let out = Self::writer(&path).await?;
        Ok(Self { path, out, unflushed: 0 })
    }

    async fn writer(path: &Path) -> std::io::Result<BufWriter<File>> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(BufWriter::new(file))
    }

    async fn write(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.out.write_all(line).await?;
        self.unflushed += 1;
        if self.unflushed >= FLUSH_BATCH {
            self.flush().await;
        }
        Ok(())
    }

    /// Appends one event; a failed write gets one retry on a fresh handle.
    async fn append(&mut self, ev: &Event) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(ev)?;
        line.push(b'\n');
        if let Err(e) = self.write(&line).await {
            warn!(?e, path = %self.path.display(), "journal write failed, reopening");
            self.out = Self::writer(&self.path).await?;
            self.write(&line).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) {
        if let Err(e) = self.out.flush().await {
            warn!(?e, "journal flush failed");
        }
        self.unflushed = 0;
    }
}

/// Drains `rx` into the journal at `path` until every sender is gone.
pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let mut journal = match Journal::open(PathBuf::from(&path)).await {
        Ok(j) => j,
        Err(e) => {
            error!(?e, %path, "cannot open journal, recording disabled");
            return;
        }
    };
    info!(%path, "journal open");

    let mut flush_tick = interval(Duration::from_secs(1));
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut written: u64 = 0;

    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(ev) => match journal.append(&ev).await {
                    Ok(()) => written += 1,
                    Err(e) => error!(?e, "journal event dropped"),
                },
                None => break,
            },
            _ = flush_tick.tick() => journal.flush().await,
        }
    }
    journal.flush().await;
    info!(written, "journal closed");
}
