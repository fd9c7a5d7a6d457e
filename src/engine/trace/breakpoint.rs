//! Breakpoint tables and their lock-free hand-off to the trace callback.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Arena offset of the reserved empty record, also a group run terminator.
const NO_SOURCE: u32 = 0;
/// Group index that means "no breakpoints at this line".
const NO_GROUP: u32 = 0;
const RECORD_HEADER: usize = std::mem::size_of::<u32>();

/// Immutable snapshot of breakpoint locations.
///
/// `lines[line]` is a group index, `groups[group..]` is a zero terminated run of
/// arena offsets, each offset points to a length prefixed source name record.
#[derive(Debug, PartialEq)]
pub struct BreakpointTable {
    lines: Vec<u32>,
    groups: Vec<u32>,
    arena: Vec<u8>,
}

impl Default for BreakpointTable {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl BreakpointTable {
    pub fn builder() -> TableBuilder {
        TableBuilder::default()
    }

    /// Greatest line number with at least one breakpoint, 0 for an empty table.
    pub fn max_line(&self) -> u32 {
        self.lines.len().saturating_sub(1) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.lines.iter().all(|g| *g == NO_GROUP)
    }

    fn group(&self, line: u32) -> u32 {
        self.lines.get(line as usize).copied().unwrap_or(NO_GROUP)
    }

    fn record(&self, offset: u32) -> &str {
        let offset = offset as usize;
        let Some(header) = self.arena.get(offset..offset + RECORD_HEADER) else {
            return "";
        };
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let start = offset + RECORD_HEADER;
        self.arena
            .get(start..start + len)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .unwrap_or_default()
    }

    /// Source names with a breakpoint at `line`.
    pub fn sources(&self, line: u32) -> impl Iterator<Item = &str> + '_ {
        let group = self.group(line) as usize;
        self.groups[group.min(self.groups.len())..]
            .iter()
            .take_while(|offset| **offset != NO_SOURCE)
            .map(|offset| self.record(*offset))
    }

    /// Return first source name at `line` accepted by `matches`.
    pub fn find(&self, line: u32, mut matches: impl FnMut(&str) -> bool) -> Option<&str> {
        if self.group(line) == NO_GROUP {
            return None;
        }
        self.sources(line).find(|name| matches(name))
    }

    pub fn contains(&self, line: u32, file: &str) -> bool {
        self.find(line, |name| name == file).is_some()
    }
}

/// Collects (line, file) pairs and lays them out as a [`BreakpointTable`].
#[derive(Default)]
pub struct TableBuilder {
    locations: BTreeMap<u32, BTreeSet<String>>,
}

impl TableBuilder {
    /// Add a breakpoint location. Line 0 is not a valid source line and is ignored.
    pub fn insert(&mut self, line: u32, file: impl Into<String>) -> &mut Self {
        if line != 0 {
            self.locations.entry(line).or_default().insert(file.into());
        }
        self
    }

    pub fn build(&self) -> BreakpointTable {
        let mut arena = NO_SOURCE.to_le_bytes().to_vec();
        let mut records: HashMap<&str, u32> = HashMap::new();
        let mut groups = vec![NO_SOURCE];
        let mut group_index: HashMap<Vec<u32>, u32> = HashMap::new();

        let max_line = self.locations.keys().next_back().copied().unwrap_or(0);
        let mut lines = vec![NO_GROUP; max_line as usize + 1];

        for (line, files) in &self.locations {
            let run: Vec<u32> = files
                .iter()
                .map(|file| {
                    *records.entry(file.as_str()).or_insert_with(|| {
                        let offset = arena.len() as u32;
                        arena.extend_from_slice(&(file.len() as u32).to_le_bytes());
                        arena.extend_from_slice(file.as_bytes());
                        offset
                    })
                })
                .collect();

            let group = *group_index.entry(run.clone()).or_insert_with(|| {
                let start = groups.len() as u32;
                groups.extend_from_slice(&run);
                groups.push(NO_SOURCE);
                start
            });
            lines[*line as usize] = group;
        }

        BreakpointTable {
            lines,
            groups,
            arena,
        }
    }
}

struct Retired {
    table: *mut BreakpointTable,
    polls: u64,
}

// SAFETY: retired tables are only touched by the writer under the mutex.
unsafe impl Send for Retired {}

/// Two table slots shared between a writer (controller, debuggee paused) and
/// the trace callback. Readers are serialized by the interpreter lock.
pub struct BreakpointBuffer {
    slots: [AtomicPtr<BreakpointTable>; 2],
    current: AtomicUsize,
    in_use: AtomicUsize,
    polls: AtomicU64,
    retired: Mutex<Vec<Retired>>,
}

impl Default for BreakpointBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointBuffer {
    pub const fn new() -> Self {
        Self {
            slots: [
                AtomicPtr::new(ptr::null_mut()),
                AtomicPtr::new(ptr::null_mut()),
            ],
            current: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            polls: AtomicU64::new(0),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Run `f` against the current table (`None` until the first publish).
    ///
    /// The slot index is published as "in use" and checked again against the current
    /// index, a mismatch means the writer switched slots in between and the read restarts.
    pub fn read<R>(&self, f: impl FnOnce(Option<&BreakpointTable>) -> R) -> R {
        let slot = loop {
            let current = self.current.load(Ordering::SeqCst);
            self.in_use.store(current, Ordering::SeqCst);
            if self.current.load(Ordering::SeqCst) == current {
                break current;
            }
        };

        let table = self.slots[slot].load(Ordering::Acquire);
        // SAFETY: a table in the slot marked as in use is never freed before
        // this poll completes, see `BreakpointBuffer::reclaim`.
        let result = f(unsafe { table.as_ref() });
        self.polls.fetch_add(1, Ordering::SeqCst);
        result
    }

    /// Publish a new table into the slot that is not in use and make it current.
    pub fn publish(&self, table: BreakpointTable) {
        let mut retired = self
            .retired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let target = 1 - self.in_use.load(Ordering::SeqCst);
        let fresh = Box::into_raw(Box::new(table));
        let old = self.slots[target].swap(fresh, Ordering::SeqCst);
        self.current.store(target, Ordering::SeqCst);

        if !old.is_null() {
            retired.push(Retired {
                table: old,
                polls: self.polls.load(Ordering::SeqCst),
            });
        }
        self.reclaim(&mut retired);
    }

    /// Free retired tables the reader moved past.
    fn reclaim(&self, retired: &mut Vec<Retired>) {
        let polls = self.polls.load(Ordering::SeqCst);
        retired.retain(|r| {
            if polls > r.polls {
                // SAFETY: pointer came from `Box::into_raw` and left both slots.
                drop(unsafe { Box::from_raw(r.table) });
                false
            } else {
                true
            }
        });
    }

    /// Number of completed reader polls.
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn current_slot(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }
}

impl Drop for BreakpointBuffer {
    fn drop(&mut self) {
        let retired = self
            .retired
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for r in retired.drain(..) {
            drop(unsafe { Box::from_raw(r.table) });
        }
        for slot in &self.slots {
            let table = slot.swap(ptr::null_mut(), Ordering::SeqCst);
            if !table.is_null() {
                drop(unsafe { Box::from_raw(table) });
            }
        }
    }
}
