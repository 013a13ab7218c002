#![forbid(unsafe_code)]

use super::{
    Access, AddressSpace, EventControl, EventHandler, EventResponse, Introspector,
    IntrospectionError, VcpuId, WatchHandle, WriteEvent,
};
use crate::domain::{Gfn, PAGE_SIZE, Pa, Va};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

const MAX_STRING: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadRecord {
    Virtual(Va, usize),
    Physical(Pa, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRecord {
    pub vcpu: VcpuId,
    pub steps: u32,
    pub reinstall: WatchHandle,
    pub notify: bool,
}

#[derive(Debug, Default)]
struct JournalInner {
    reads: Vec<ReadRecord>,
    watched: Vec<(WatchHandle, Gfn)>,
    cleared: Vec<WatchHandle>,
    releases: usize,
    steps: Vec<StepRecord>,
    stalls: usize,
    pauses: usize,
    resumes: usize,
    closed: bool,
}

/// Shared record of every call a [`MemoryGuest`] served.
///
/// Cloned handles observe the same journal, so a test can keep one after the
/// guest itself has been moved into a monitor.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<JournalInner>>);

impl Journal {
    pub fn reads(&self) -> Vec<ReadRecord> {
        self.0.lock().reads.clone()
    }

    /// Number of virtual reads that started exactly at `va`.
    pub fn reads_at(&self, va: Va) -> usize {
        self.0
            .lock()
            .reads
            .iter()
            .filter(|read| matches!(read, ReadRecord::Virtual(at, _) if *at == va))
            .count()
    }

    pub fn forget_reads(&self) {
        self.0.lock().reads.clear();
    }

    pub fn watched(&self) -> Vec<(WatchHandle, Gfn)> {
        self.0.lock().watched.clone()
    }

    pub fn cleared(&self) -> Vec<WatchHandle> {
        self.0.lock().cleared.clone()
    }

    /// Watchpoints registered and not yet cleared.
    pub fn live_watches(&self) -> usize {
        let inner = self.0.lock();
        inner.watched.len().saturating_sub(inner.cleared.len())
    }

    pub fn releases(&self) -> usize {
        self.0.lock().releases
    }

    pub fn steps(&self) -> Vec<StepRecord> {
        self.0.lock().steps.clone()
    }

    /// Trapped writes whose handler neither released nor stepped.
    pub fn stalls(&self) -> usize {
        self.0.lock().stalls
    }

    pub fn pauses(&self) -> usize {
        self.0.lock().pauses
    }

    pub fn resumes(&self) -> usize {
        self.0.lock().resumes
    }

    pub fn is_closed(&self) -> bool {
        self.0.lock().closed
    }
}

#[derive(Debug, Clone, Copy)]
struct Watch {
    gfn: Gfn,
    access: Access,
    armed: bool,
}

/// A guest write replayed by [`MemoryGuest::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestWrite {
    pub vcpu: VcpuId,
    pub va: Va,
    pub bytes: Vec<u8>,
}

/// In-memory introspection backend.
///
/// Holds a sparse guest physical memory, kernel and per-process page
/// mappings, a symbol table and a script of guest writes. Watchpoints trap the
/// scripted writes exactly like a hypervisor would: the callback runs before
/// the write lands, and the write only retires once the handler released the
/// trap and asked for a single step.
pub struct MemoryGuest {
    name: String,
    symbols: FxHashMap<String, Va>,
    kernel_pages: BTreeMap<u64, Gfn>,
    process_pages: FxHashMap<u32, BTreeMap<u64, Gfn>>,
    frames: FxHashMap<Gfn, Box<[u8]>>,
    unreadable: FxHashSet<Va>,
    refused: FxHashSet<Gfn>,
    refuse_shared_frames: bool,
    fail_pause: bool,
    poll_failure_after: Option<usize>,
    watches: BTreeMap<WatchHandle, Watch>,
    next_handle: u64,
    script: VecDeque<GuestWrite>,
    pending_step: Option<StepRecord>,
    polls: usize,
    paused: bool,
    closed: bool,
    journal: Journal,
}

impl MemoryGuest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbols: FxHashMap::default(),
            kernel_pages: BTreeMap::new(),
            process_pages: FxHashMap::default(),
            frames: FxHashMap::default(),
            unreadable: FxHashSet::default(),
            refused: FxHashSet::default(),
            refuse_shared_frames: true,
            fail_pause: false,
            poll_failure_after: None,
            watches: BTreeMap::new(),
            next_handle: 1,
            script: VecDeque::new(),
            pending_step: None,
            polls: 0,
            paused: false,
            closed: false,
            journal: Journal::default(),
        }
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Map `pages` kernel pages starting at `va` onto frames starting at `pa`.
    pub fn map(&mut self, va: Va, pa: Pa, pages: u64) {
        for page in 0..pages {
            let gfn = Gfn(pa.gfn().0 + page);
            self.kernel_pages.insert(va.page() + page, gfn);
            self.ensure_frame(gfn);
        }
    }

    /// Like [`MemoryGuest::map`], but only visible in the address space of `pid`.
    pub fn map_process(&mut self, pid: u32, va: Va, pa: Pa, pages: u64) {
        for page in 0..pages {
            let gfn = Gfn(pa.gfn().0 + page);
            self.process_pages
                .entry(pid)
                .or_default()
                .insert(va.page() + page, gfn);
            self.ensure_frame(gfn);
        }
    }

    pub fn define_symbol(&mut self, symbol: impl Into<String>, va: Va) {
        self.symbols.insert(symbol.into(), va);
    }

    /// Store bytes directly, bypassing watchpoints.
    pub fn poke(&mut self, va: Va, bytes: &[u8]) -> Result<(), IntrospectionError> {
        for (i, byte) in bytes.iter().enumerate() {
            let pa = self.translate_in(AddressSpace::Kernel, va + i as u64)?;
            self.store_byte(pa, *byte)?;
        }
        Ok(())
    }

    pub fn poke_u64(&mut self, va: Va, value: u64) -> Result<(), IntrospectionError> {
        self.poke(va, &value.to_le_bytes())
    }

    pub fn poke_u32(&mut self, va: Va, value: u32) -> Result<(), IntrospectionError> {
        self.poke(va, &value.to_le_bytes())
    }

    /// Store a NUL-terminated string.
    pub fn poke_str(&mut self, va: Va, value: &str) -> Result<(), IntrospectionError> {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.poke(va, &bytes)
    }

    /// Queue a guest write to be replayed by the next poll.
    pub fn script_write(&mut self, vcpu: VcpuId, va: Va, bytes: Vec<u8>) {
        self.script.push_back(GuestWrite { vcpu, va, bytes });
    }

    pub fn script_write_u64(&mut self, vcpu: VcpuId, va: Va, value: u64) {
        self.script_write(vcpu, va, value.to_le_bytes().to_vec());
    }

    pub fn pending_writes(&self) -> usize {
        self.script.len()
    }

    /// Make every read that starts at `va` fail.
    pub fn fail_reads_at(&mut self, va: Va) {
        self.unreadable.insert(va);
    }

    pub fn refuse_watch(&mut self, gfn: Gfn) {
        self.refused.insert(gfn);
    }

    /// Whether a second watchpoint on an already watched frame is refused.
    pub fn set_refuse_shared_frames(&mut self, refuse: bool) {
        self.refuse_shared_frames = refuse;
    }

    pub fn fail_pause(&mut self) {
        self.fail_pause = true;
    }

    /// Let `polls` polls succeed, then fail every following one.
    pub fn fail_poll_after(&mut self, polls: usize) {
        self.poll_failure_after = Some(polls);
    }

    fn ensure_frame(&mut self, gfn: Gfn) {
        self.frames
            .entry(gfn)
            .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
    }

    fn ensure_open(&self) -> Result<(), IntrospectionError> {
        if self.closed {
            Err(IntrospectionError::Closed)
        } else {
            Ok(())
        }
    }

    fn translate_in(&self, space: AddressSpace, va: Va) -> Result<Pa, IntrospectionError> {
        let process = match space {
            AddressSpace::Kernel => None,
            AddressSpace::Process(pid) => self.process_pages.get(&pid),
        };
        process
            .and_then(|pages| pages.get(&va.page()))
            .or_else(|| self.kernel_pages.get(&va.page()))
            .map(|gfn| gfn.base() + va.page_offset())
            .ok_or(IntrospectionError::Unmapped(va))
    }

    fn load_byte(&self, pa: Pa) -> Option<u8> {
        self.frames
            .get(&pa.gfn())
            .map(|frame| frame[pa.page_offset() as usize])
    }

    fn store_byte(&mut self, pa: Pa, byte: u8) -> Result<(), IntrospectionError> {
        let frame = self
            .frames
            .get_mut(&pa.gfn())
            .ok_or(IntrospectionError::ReadPhysical(pa))?;
        frame[pa.page_offset() as usize] = byte;
        Ok(())
    }

    fn read_virtual(&mut self, va: Va, len: usize) -> Result<Vec<u8>, IntrospectionError> {
        self.ensure_open()?;
        self.journal.0.lock().reads.push(ReadRecord::Virtual(va, len));
        if self.unreadable.contains(&va) {
            return Err(IntrospectionError::ReadVirtual(va));
        }
        (0..len as u64)
            .map(|i| {
                let pa = self
                    .translate_in(AddressSpace::Kernel, va + i)
                    .map_err(|_| IntrospectionError::ReadVirtual(va))?;
                self.load_byte(pa).ok_or(IntrospectionError::ReadVirtual(va))
            })
            .collect()
    }

    fn read_physical(&mut self, pa: Pa, len: usize) -> Result<Vec<u8>, IntrospectionError> {
        self.ensure_open()?;
        self.journal.0.lock().reads.push(ReadRecord::Physical(pa, len));
        (0..len as u64)
            .map(|i| self.load_byte(pa + i).ok_or(IntrospectionError::ReadPhysical(pa)))
            .collect()
    }

    fn read_c_string(mut byte_at: impl FnMut(u64) -> Option<u8>) -> Option<String> {
        let mut bytes = Vec::new();
        for i in 0..MAX_STRING as u64 {
            match byte_at(i)? {
                0 => break,
                byte => bytes.push(byte),
            }
        }
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn trapping_watch(&self, gfn: Gfn) -> Option<WatchHandle> {
        self.watches
            .iter()
            .find(|(_, watch)| watch.gfn == gfn && watch.armed && watch.access.contains(Access::WRITE))
            .map(|(handle, _)| *handle)
    }

    fn apply(&mut self, pa: Pa, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            if let Err(err) = self.store_byte(pa + i as u64, *byte) {
                warn!(%err, "scripted write fell outside guest memory");
                return;
            }
        }
    }

    fn replay(&mut self, write: GuestWrite, handler: &mut dyn EventHandler) -> bool {
        let pa = match self.translate_in(AddressSpace::Kernel, write.va) {
            Ok(pa) => pa,
            Err(err) => {
                warn!(%err, "dropping scripted write");
                return false;
            }
        };
        let Some(handle) = self.trapping_watch(pa.gfn()) else {
            self.apply(pa, &write.bytes);
            return false;
        };

        let event = WriteEvent {
            handle,
            gfn: pa.gfn(),
            offset: pa.page_offset(),
            vcpu: write.vcpu,
            access: Access::WRITE,
        };
        self.pending_step = None;
        trace!(?event, "delivering write event");

        if handler.on_write(self, &event) == EventResponse::Unclaimed {
            debug!(?handle, "handler disowned watchpoint; dropping it");
            self.watches.remove(&handle);
            self.journal.0.lock().cleared.push(handle);
            self.apply(pa, &write.bytes);
            return true;
        }

        let released = self.watches.get(&handle).is_some_and(|watch| !watch.armed);
        match (released, self.pending_step.take()) {
            (true, Some(step)) => {
                self.apply(pa, &write.bytes);
                if let Some(watch) = self.watches.get_mut(&step.reinstall) {
                    watch.armed = true;
                }
                self.journal.0.lock().steps.push(step);
                if step.notify {
                    handler.on_step_complete(self, step.reinstall, step.vcpu);
                }
            }
            (true, None) => {
                // Trap lifted for good; the write retires and nobody re-arms.
                self.apply(pa, &write.bytes);
            }
            (false, _) => {
                // The instruction would fault again on resume.
                self.journal.0.lock().stalls += 1;
            }
        }
        true
    }
}

impl std::fmt::Debug for MemoryGuest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGuest")
            .field("name", &self.name)
            .field("symbols", &self.symbols.len())
            .field("frames", &self.frames.len())
            .field("watches", &self.watches.len())
            .field("pending_writes", &self.script.len())
            .field("paused", &self.paused)
            .field("closed", &self.closed)
            .finish()
    }
}

impl EventControl for MemoryGuest {
    fn read_u64_pa(&mut self, pa: Pa) -> Result<u64, IntrospectionError> {
        Introspector::read_u64_pa(self, pa)
    }

    fn release(&mut self, handle: WatchHandle) -> Result<(), IntrospectionError> {
        let watch = self
            .watches
            .get_mut(&handle)
            .ok_or(IntrospectionError::UnknownWatch(handle))?;
        watch.armed = false;
        self.journal.0.lock().releases += 1;
        Ok(())
    }

    fn step(
        &mut self,
        vcpu: VcpuId,
        steps: u32,
        reinstall: WatchHandle,
        notify: bool,
    ) -> Result<(), IntrospectionError> {
        if steps == 0 {
            return Err(IntrospectionError::StepFailed(vcpu));
        }
        if !self.watches.contains_key(&reinstall) {
            return Err(IntrospectionError::UnknownWatch(reinstall));
        }
        self.pending_step = Some(StepRecord {
            vcpu,
            steps,
            reinstall,
            notify,
        });
        Ok(())
    }
}

impl Introspector for MemoryGuest {
    fn guest_name(&self) -> &str {
        &self.name
    }

    fn pause(&mut self) -> Result<(), IntrospectionError> {
        self.ensure_open()?;
        if self.fail_pause {
            return Err(IntrospectionError::RunState("pause"));
        }
        self.paused = true;
        self.journal.0.lock().pauses += 1;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), IntrospectionError> {
        self.ensure_open()?;
        self.paused = false;
        self.journal.0.lock().resumes += 1;
        Ok(())
    }

    fn translate(&mut self, space: AddressSpace, va: Va) -> Result<Pa, IntrospectionError> {
        self.ensure_open()?;
        self.translate_in(space, va)
    }

    fn resolve_symbol(&mut self, symbol: &str) -> Result<Va, IntrospectionError> {
        self.ensure_open()?;
        self.symbols
            .get(symbol)
            .copied()
            .ok_or_else(|| IntrospectionError::UnknownSymbol(symbol.to_string()))
    }

    fn read_u32_va(&mut self, va: Va) -> Result<u32, IntrospectionError> {
        let bytes = self.read_virtual(va, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64_va(&mut self, va: Va) -> Result<u64, IntrospectionError> {
        let bytes = self.read_virtual(va, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn read_str_va(&mut self, va: Va) -> Result<String, IntrospectionError> {
        self.ensure_open()?;
        self.journal.0.lock().reads.push(ReadRecord::Virtual(va, 0));
        if self.unreadable.contains(&va) {
            return Err(IntrospectionError::ReadVirtual(va));
        }
        Self::read_c_string(|i| {
            let pa = self.translate_in(AddressSpace::Kernel, va + i).ok()?;
            self.load_byte(pa)
        })
        .ok_or(IntrospectionError::ReadVirtual(va))
    }

    fn read_u64_pa(&mut self, pa: Pa) -> Result<u64, IntrospectionError> {
        let bytes = self.read_physical(pa, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn read_str_pa(&mut self, pa: Pa) -> Result<String, IntrospectionError> {
        self.ensure_open()?;
        self.journal.0.lock().reads.push(ReadRecord::Physical(pa, 0));
        Self::read_c_string(|i| self.load_byte(pa + i))
            .ok_or(IntrospectionError::ReadPhysical(pa))
    }

    fn watch(&mut self, gfn: Gfn, access: Access) -> Result<WatchHandle, IntrospectionError> {
        self.ensure_open()?;
        let shared = self.watches.values().any(|watch| watch.gfn == gfn);
        if self.refused.contains(&gfn) || (shared && self.refuse_shared_frames) {
            return Err(IntrospectionError::WatchRefused(gfn));
        }
        let handle = WatchHandle(self.next_handle);
        self.next_handle += 1;
        self.watches.insert(
            handle,
            Watch {
                gfn,
                access,
                armed: true,
            },
        );
        self.journal.0.lock().watched.push((handle, gfn));
        Ok(handle)
    }

    fn clear(&mut self, handle: WatchHandle) -> Result<(), IntrospectionError> {
        self.ensure_open()?;
        self.watches
            .remove(&handle)
            .ok_or(IntrospectionError::UnknownWatch(handle))?;
        self.journal.0.lock().cleared.push(handle);
        Ok(())
    }

    fn poll(
        &mut self,
        timeout: Duration,
        handler: &mut dyn EventHandler,
    ) -> Result<usize, IntrospectionError> {
        self.ensure_open()?;
        self.polls += 1;
        if self.poll_failure_after.is_some_and(|limit| self.polls > limit) {
            return Err(IntrospectionError::PollFailed(format!(
                "event channel lost after {} polls",
                self.polls - 1
            )));
        }

        if self.paused || self.script.is_empty() {
            std::thread::sleep(timeout);
            return Ok(0);
        }

        let mut callbacks = 0;
        for _ in 0..self.script.len() {
            let Some(write) = self.script.pop_front() else {
                break;
            };
            if self.replay(write, handler) {
                callbacks += 1;
            }
        }
        Ok(callbacks)
    }

    fn close(&mut self) -> Result<(), IntrospectionError> {
        self.ensure_open()?;
        self.closed = true;
        self.journal.0.lock().closed = true;
        Ok(())
    }
}
