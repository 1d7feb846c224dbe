//! Per-session hybrid scrollback: a bounded in-memory tail over persistent
//! spillover in the session store.
//!
//! Line numbers are absolute and monotonic from 0 and are never renumbered;
//! trimming removes the oldest lines, so the retained set is always the
//! contiguous range `[first_line, next_line)`. All writes for a session flow
//! through its buffer, which keeps the store's numbering and the in-memory
//! view in lockstep.

use std::collections::VecDeque;

use crate::errors::DaemonError;
use crate::store::{ScrollbackLine, SessionStore, now_rfc3339};

#[derive(Debug, Clone, Copy)]
pub struct ScrollbackConfig {
    /// Lines kept in memory before spilling to the store.
    pub memory_lines: usize,
    /// Total retained lines (memory + store); older lines are trimmed.
    pub max_total_lines: usize,
    /// Lines moved to the store per spill transaction.
    pub spill_batch_size: usize,
}

impl Default for ScrollbackConfig {
    fn default() -> Self {
        Self {
            memory_lines: 1_000,
            max_total_lines: 10_000,
            spill_batch_size: 100,
        }
    }
}

#[derive(Debug, Clone)]
struct BufferedLine {
    number: u64,
    content: String,
    timestamp: String,
}

/// Hybrid scrollback buffer for one session.
///
/// Invariants: the store holds `[first_line, persisted_upto)`; memory holds
/// `[mem_first, next_line)`; every unpersisted line is in memory
/// (`mem_first <= persisted_upto`), and the union is contiguous.
pub struct ScrollbackBuffer {
    session_id: String,
    store: SessionStore,
    config: ScrollbackConfig,
    mem: VecDeque<BufferedLine>,
    partial: String,
    /// Lowest retained line number.
    first_line: u64,
    /// Line number of the front of `mem`.
    mem_first: u64,
    /// Lines `[first_line, persisted_upto)` are in the store.
    persisted_upto: u64,
    /// The number the next appended line receives.
    next_line: u64,
}

impl ScrollbackBuffer {
    pub fn new(session_id: String, store: SessionStore, config: ScrollbackConfig) -> Self {
        Self {
            session_id,
            store,
            config,
            mem: VecDeque::new(),
            partial: String::new(),
            first_line: 0,
            mem_first: 0,
            persisted_upto: 0,
            next_line: 0,
        }
    }

    /// Re-populate counters and the memory tail from the store after a
    /// daemon restart.
    pub fn restore(&mut self) -> Result<(), DaemonError> {
        self.next_line = self.store.next_scrollback_line(&self.session_id)?;
        let count = self.store.get_scrollback_line_count(&self.session_id)?;
        self.first_line = self.next_line - count;
        self.persisted_upto = self.next_line;
        let latest = self
            .store
            .get_latest_scrollback(&self.session_id, self.config.memory_lines)?;
        self.mem = latest
            .into_iter()
            .map(|l| BufferedLine {
                number: l.line_number,
                content: l.content,
                timestamp: l.timestamp,
            })
            .collect();
        self.mem_first = self.next_line - self.mem.len() as u64;
        self.partial.clear();
        Ok(())
    }

    /// Append raw output. Concatenates with the current partial line, splits
    /// on line feeds, and retains any remainder as the new partial line.
    pub fn append(&mut self, data: &str) -> Result<(), DaemonError> {
        let mut buf = std::mem::take(&mut self.partial);
        buf.push_str(data);

        match buf.rfind('\n') {
            None => {
                self.partial = buf;
                Ok(())
            }
            Some(last_nl) => {
                self.partial = buf[last_nl + 1..].to_string();
                for line in buf[..last_nl + 1].split_terminator('\n') {
                    let line = line.strip_suffix('\r').unwrap_or(line);
                    self.push_line(line.to_string())?;
                }
                Ok(())
            }
        }
    }

    /// Flush the outstanding partial line (as a full line) and drain the
    /// memory tail to the store. Idempotent.
    pub fn flush(&mut self) -> Result<(), DaemonError> {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.push_line(line)?;
        }

        let start_idx = (self.persisted_upto - self.mem_first) as usize;
        if start_idx < self.mem.len() {
            let batch: Vec<(String, String)> = self
                .mem
                .iter()
                .skip(start_idx)
                .map(|l| (l.content.clone(), l.timestamp.clone()))
                .collect();
            let first = self.store.append_scrollback_batch(&self.session_id, &batch)?;
            debug_assert_eq!(first, self.persisted_upto, "store numbering diverged");
            self.persisted_upto = self.next_line;
        }

        while self.mem.len() > self.config.memory_lines {
            self.mem.pop_front();
            self.mem_first += 1;
        }
        Ok(())
    }

    /// The last `min(count, total_lines)` complete lines, ascending.
    pub fn get_recent(&self, count: usize) -> Result<Vec<ScrollbackLine>, DaemonError> {
        let n = (count as u64).min(self.total_lines());
        if n == 0 {
            return Ok(Vec::new());
        }
        self.get_range(self.next_line - n, n as usize)
    }

    /// A contiguous range of retained lines, starting at
    /// `max(from_line, first_line)` and bounded by `count` and the newest
    /// line. `from_line` past the end returns empty.
    pub fn get_range(
        &self,
        from_line: u64,
        count: usize,
    ) -> Result<Vec<ScrollbackLine>, DaemonError> {
        let eff = from_line.max(self.first_line);
        if eff >= self.next_line || count == 0 {
            return Ok(Vec::new());
        }
        let end = (eff + count as u64).min(self.next_line);
        let mut out: Vec<ScrollbackLine> = Vec::with_capacity((end - eff) as usize);

        if eff < self.mem_first {
            let store_end = end.min(self.mem_first);
            let fetched =
                self.store
                    .get_scrollback(&self.session_id, eff, (store_end - eff) as usize)?;
            out.extend(fetched);
        }

        if end > self.mem_first {
            let mstart = eff.max(self.mem_first);
            let lo = (mstart - self.mem_first) as usize;
            let hi = (end - self.mem_first) as usize;
            for l in self.mem.iter().skip(lo).take(hi - lo) {
                out.push(ScrollbackLine {
                    line_number: l.number,
                    content: l.content.clone(),
                    timestamp: l.timestamp.clone(),
                });
            }
        }

        debug_assert!(
            out.windows(2).all(|w| w[1].line_number == w[0].line_number + 1),
            "returned range must be contiguous"
        );
        Ok(out)
    }

    /// Number of retained complete lines.
    pub fn total_lines(&self) -> u64 {
        self.next_line - self.first_line
    }

    /// Lowest retained line number.
    pub fn first_line(&self) -> u64 {
        self.first_line
    }

    /// The number the next appended line will receive.
    pub fn next_line(&self) -> u64 {
        self.next_line
    }

    fn push_line(&mut self, content: String) -> Result<(), DaemonError> {
        self.mem.push_back(BufferedLine {
            number: self.next_line,
            content,
            timestamp: now_rfc3339(),
        });
        self.next_line += 1;
        self.spill_if_needed()?;
        self.trim_if_needed()
    }

    fn spill_if_needed(&mut self) -> Result<(), DaemonError> {
        while self.mem.len() > self.config.memory_lines + self.config.spill_batch_size {
            let start_idx = (self.persisted_upto - self.mem_first) as usize;
            let batch_len = self.config.spill_batch_size.min(self.mem.len() - start_idx);
            if batch_len > 0 {
                let batch: Vec<(String, String)> = self
                    .mem
                    .iter()
                    .skip(start_idx)
                    .take(batch_len)
                    .map(|l| (l.content.clone(), l.timestamp.clone()))
                    .collect();
                let first = self.store.append_scrollback_batch(&self.session_id, &batch)?;
                debug_assert_eq!(first, self.persisted_upto, "store numbering diverged");
                self.persisted_upto += batch_len as u64;
            }

            let droppable = (self.persisted_upto - self.mem_first) as usize;
            let drop_n = self.config.spill_batch_size.min(droppable);
            if drop_n == 0 {
                break;
            }
            for _ in 0..drop_n {
                self.mem.pop_front();
            }
            self.mem_first += drop_n as u64;
        }
        Ok(())
    }

    fn trim_if_needed(&mut self) -> Result<(), DaemonError> {
        let total = self.total_lines();
        let max = self.config.max_total_lines as u64;
        if total <= max {
            return Ok(());
        }
        let mut excess = total - max;

        // Oldest lines live in the store; trim there first.
        let store_lines = self.persisted_upto - self.first_line;
        let store_trim = excess.min(store_lines);
        if store_trim > 0 {
            self.store
                .trim_scrollback(&self.session_id, store_lines - store_trim)?;
            self.first_line += store_trim;
            excess -= store_trim;
        }

        // Drop memory-cached copies of trimmed lines.
        while let Some(front) = self.mem.front() {
            if front.number < self.first_line {
                self.mem.pop_front();
                self.mem_first += 1;
            } else {
                break;
            }
        }

        // Any remaining excess is unpersisted and sits at the memory front.
        if excess > 0 {
            for _ in 0..excess {
                self.mem.pop_front();
            }
            self.mem_first += excess;
            self.first_line += excess;
            self.persisted_upto = self.persisted_upto.max(self.first_line);
        }
        Ok(())
    }
}
