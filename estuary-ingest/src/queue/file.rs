// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./file_test.rs"]
mod file_test;

use super::task::SubmissionTask;
use super::{QueueStats, TaskQueue};
use anyhow::Context;
use estuary_common::stats::Scope;
use parking_lot::Mutex;
use prometheus::{IntCounter, IntGauge};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const DEFAULT_MAX_SEGMENT_BYTES: u64 = 16 * 1024 * 1024;
const SYNC_EVERY_ADDS: u32 = 64;

#[derive(Deserialize, Serialize, Default, Clone, Copy)]
struct HeadCursor {
  segment: u64,
  offset: u64,
}

#[derive(Clone, Copy)]
struct RecordRef {
  segment: u64,
  offset: u64,
  len: u32,
}

struct Stats {
  added: IntCounter,
  removed: IntCounter,
  corrupt: IntCounter,
  lost: IntCounter,
  tasks: IntGauge,
}

struct Inner {
  index: VecDeque<RecordRef>,
  bytes: u64,
  tail_segment: u64,
  tail_offset: u64,
  tail_file: File,
  head_cache: Option<SubmissionTask>,
  adds_since_sync: u32,
}

//
// FileTaskQueue
//

// The disk spool for one handler key: rolling segment files of length-prefixed serialized
// submission tasks, plus a sidecar file recording the head cursor. Corrupt records are skipped
// and counted rather than poisoning the queue.
pub struct FileTaskQueue {
  dir: PathBuf,
  max_segment_bytes: u64,
  stats: Stats,
  locked: Mutex<Inner>,
}

fn segment_path(dir: &Path, segment: u64) -> PathBuf {
  dir.join(format!("spool.{segment}.dat"))
}

fn cursor_path(dir: &Path) -> PathBuf {
  dir.join("head.json")
}

fn list_segments(dir: &Path) -> anyhow::Result<Vec<u64>> {
  let mut segments = vec![];
  for entry in fs::read_dir(dir)? {
    let name = entry?.file_name();
    let Some(name) = name.to_str() else { continue };
    if let Some(seq) = name
      .strip_prefix("spool.")
      .and_then(|rest| rest.strip_suffix(".dat"))
      .and_then(|seq| seq.parse::<u64>().ok())
    {
      segments.push(seq);
    }
  }
  segments.sort_unstable();
  Ok(segments)
}

impl FileTaskQueue {
  pub fn open(dir: &Path, scope: &Scope) -> anyhow::Result<Self> {
    Self::open_with_max_segment_bytes(dir, scope, DEFAULT_MAX_SEGMENT_BYTES)
  }

  pub fn open_with_max_segment_bytes(
    dir: &Path,
    scope: &Scope,
    max_segment_bytes: u64,
  ) -> anyhow::Result<Self> {
    fs::create_dir_all(dir).with_context(|| format!("creating spool dir {}", dir.display()))?;
    let scope = scope.scope("spool");
    let stats = Stats {
      added: scope.counter("added"),
      removed: scope.counter("removed"),
      corrupt: scope.counter("corrupt"),
      lost: scope.counter("lost"),
      tasks: scope.gauge("tasks"),
    };

    let cursor: HeadCursor = fs::read(cursor_path(dir))
      .ok()
      .and_then(|bytes| serde_json::from_slice(&bytes).ok())
      .unwrap_or_default();

    let mut index = VecDeque::new();
    let mut bytes = 0u64;
    let mut corrupt = 0u64;
    let mut torn_tail: Option<(u64, u64)> = None;
    let mut segments = list_segments(dir)?;
    // Segments fully consumed before the cursor can be dropped immediately.
    for segment in segments.iter().filter(|s| **s < cursor.segment) {
      let _ignored = fs::remove_file(segment_path(dir, *segment));
    }
    segments.retain(|s| *s >= cursor.segment);

    for segment in &segments {
      let path = segment_path(dir, *segment);
      let mut file = File::open(&path)?;
      let file_len = file.metadata()?.len();
      let mut offset = if *segment == cursor.segment {
        cursor.offset.min(file_len)
      } else {
        0
      };
      file.seek(SeekFrom::Start(offset))?;
      while offset + 4 <= file_len {
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf);
        if len == 0 || offset + 4 + u64::from(len) > file_len {
          // Torn tail record from an unclean shutdown; cut it off so later appends stay
          // aligned.
          corrupt += 1;
          torn_tail = Some((*segment, offset));
          break;
        }
        let mut record = vec![0u8; len as usize];
        file.read_exact(&mut record)?;
        if serde_json::from_slice::<SubmissionTask>(&record).is_ok() {
          index.push_back(RecordRef {
            segment: *segment,
            offset,
            len,
          });
          bytes += 4 + u64::from(len);
        } else {
          corrupt += 1;
        }
        offset += 4 + u64::from(len);
      }
    }
    stats.corrupt.inc_by(corrupt);

    let tail_segment = segments.last().copied().unwrap_or(cursor.segment);
    let tail_path = segment_path(dir, tail_segment);
    let tail_file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&tail_path)?;
    let mut tail_offset = tail_file.metadata()?.len();
    if let Some((segment, offset)) = torn_tail {
      if segment == tail_segment {
        tail_file.set_len(offset)?;
        tail_offset = offset;
      }
    }

    #[allow(clippy::cast_possible_wrap)]
    stats.tasks.set(index.len() as i64);
    Ok(Self {
      dir: dir.to_path_buf(),
      max_segment_bytes,
      stats,
      locked: Mutex::new(Inner {
        index,
        bytes,
        tail_segment,
        tail_offset,
        tail_file,
        head_cache: None,
        adds_since_sync: 0,
      }),
    })
  }

  fn persist_cursor(&self, cursor: HeadCursor) {
    if let Ok(bytes) = serde_json::to_vec(&cursor) {
      if let Err(e) = fs::write(cursor_path(&self.dir), bytes) {
        log::warn!("failed to persist spool cursor in {}: {e}", self.dir.display());
      }
    }
  }

  fn read_record(&self, record: RecordRef) -> anyhow::Result<SubmissionTask> {
    let mut file = File::open(segment_path(&self.dir, record.segment))?;
    file.seek(SeekFrom::Start(record.offset + 4))?;
    let mut buf = vec![0u8; record.len as usize];
    file.read_exact(&mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
  }

  fn sync_inner(inner: &mut Inner) {
    if let Err(e) = inner.tail_file.sync_all() {
      log::warn!("spool fsync failed: {e}");
    }
    inner.adds_since_sync = 0;
  }
}

impl TaskQueue for FileTaskQueue {
  fn add(&self, task: &SubmissionTask) -> anyhow::Result<()> {
    let record = serde_json::to_vec(task)?;
    let len = u32::try_from(record.len()).context("record too large")?;
    let mut inner = self.locked.lock();

    if inner.tail_offset >= self.max_segment_bytes {
      Self::sync_inner(&mut inner);
      inner.tail_segment += 1;
      let path = segment_path(&self.dir, inner.tail_segment);
      inner.tail_file = OpenOptions::new().create(true).append(true).open(&path)?;
      inner.tail_offset = 0;
    }

    inner.tail_file.write_all(&len.to_le_bytes())?;
    inner.tail_file.write_all(&record)?;
    let offset = inner.tail_offset;
    let segment = inner.tail_segment;
    inner.index.push_back(RecordRef {
      segment,
      offset,
      len,
    });
    inner.tail_offset += 4 + u64::from(len);
    inner.bytes += 4 + u64::from(len);
    inner.adds_since_sync += 1;
    if inner.adds_since_sync >= SYNC_EVERY_ADDS {
      Self::sync_inner(&mut inner);
    }
    self.stats.added.inc();
    self.stats.tasks.inc();
    Ok(())
  }

  fn peek(&self) -> Option<SubmissionTask> {
    let mut inner = self.locked.lock();
    loop {
      if let Some(task) = &inner.head_cache {
        return Some(task.clone());
      }
      let record = *inner.index.front()?;
      match self.read_record(record) {
        Ok(task) => {
          inner.head_cache = Some(task.clone());
          return Some(task);
        },
        Err(e) => {
          log::warn!("skipping corrupt spool record: {e}");
          self.stats.corrupt.inc();
          inner.index.pop_front();
          inner.bytes = inner.bytes.saturating_sub(4 + u64::from(record.len));
          self.stats.tasks.dec();
        },
      }
    }
  }

  fn remove(&self) -> anyhow::Result<()> {
    let mut inner = self.locked.lock();
    let Some(record) = inner.index.pop_front() else {
      return Ok(());
    };
    inner.head_cache = None;
    inner.bytes = inner.bytes.saturating_sub(4 + u64::from(record.len));
    self.stats.removed.inc();
    self.stats.tasks.dec();

    let cursor = if let Some(next) = inner.index.front() {
      HeadCursor {
        segment: next.segment,
        offset: next.offset,
      }
    } else {
      HeadCursor {
        segment: inner.tail_segment,
        offset: inner.tail_offset,
      }
    };
    // Segments fully behind the new head are no longer needed.
    for segment in record.segment..cursor.segment {
      let _ignored = fs::remove_file(segment_path(&self.dir, segment));
    }
    self.persist_cursor(cursor);
    Ok(())
  }

  fn size(&self) -> usize {
    self.locked.lock().index.len()
  }

  fn stats(&self) -> QueueStats {
    let oldest = self.peek().map(|task| task.first_attempt_ms);
    let inner = self.locked.lock();
    QueueStats {
      tasks: inner.index.len(),
      bytes: inner.bytes,
      oldest_first_attempt_ms: oldest,
    }
  }

  fn clear(&self) -> anyhow::Result<()> {
    let mut inner = self.locked.lock();
    self
      .stats
      .lost
      .inc_by(u64::try_from(inner.index.len()).unwrap_or(0));
    self.stats.tasks.set(0);
    inner.index.clear();
    inner.bytes = 0;
    inner.head_cache = None;

    for segment in list_segments(&self.dir)? {
      let _ignored = fs::remove_file(segment_path(&self.dir, segment));
    }
    inner.tail_segment += 1;
    let path = segment_path(&self.dir, inner.tail_segment);
    inner.tail_file = OpenOptions::new().create(true).append(true).open(&path)?;
    inner.tail_offset = 0;
    inner.adds_since_sync = 0;
    self.persist_cursor(HeadCursor {
      segment: inner.tail_segment,
      offset: 0,
    });
    Ok(())
  }

  fn sync(&self) {
    let mut inner = self.locked.lock();
    Self::sync_inner(&mut inner);
  }
}
