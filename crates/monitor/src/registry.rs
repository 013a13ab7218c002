#![forbid(unsafe_code)]

//! Arena of registered watchpoints.
//!
//! Watchpoints live in a slotmap; a separate vector keeps insertion order for
//! teardown. A frame holds at most one watchpoint: a later object on an
//! already watched frame is added to that watchpoint's targets instead of
//! asking the collaborator for a second trap on the same page. An object
//! spanning several frames is an occupant of each of them.

use crate::domain::{Gfn, Pa, TargetDescriptor, Va};
use crate::introspection::{Access, IntrospectionError, Introspector, WatchHandle};
use config::{MonitorMode, ObjectClass};
use rustc_hash::{FxHashMap, FxHashSet};
use slotmap::{SlotMap, new_key_type};
use tracing::{debug, warn};

new_key_type! { pub struct WatchId; }

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("{target} has an empty extent")]
    EmptyExtent { target: TargetDescriptor },

    #[error("watchpoint for {target} refused: {source}")]
    Refused {
        target: TargetDescriptor,
        #[source]
        source: IntrospectionError,
    },
}

#[derive(Debug, Clone)]
pub struct Watchpoint {
    pub gfn: Gfn,
    pub access: Access,
    pub handle: WatchHandle,
    /// Objects on this frame, in registration order. Never empty.
    pub targets: Vec<TargetDescriptor>,
    /// Last value observed at the most recently written word.
    pub snapshot: Option<u64>,
    /// Word to sample once the in-flight single step completes.
    pub pending: Option<Pa>,
}

impl Watchpoint {
    /// The targets a write at `address` is attributed to, at most one per
    /// class.
    ///
    /// Precise mode yields the object containing `address`, if any. Coarse
    /// mode yields one object of every class living on the frame, the one
    /// containing `address` first.
    pub fn hits(&self, address: Pa, mode: MonitorMode) -> Vec<&TargetDescriptor> {
        let containing = self.targets.iter().find(|target| target.contains(address));
        let mut hits: Vec<&TargetDescriptor> = containing.into_iter().collect();
        if mode == MonitorMode::Coarse {
            for target in &self.targets {
                if !hits.iter().any(|hit| hit.class == target.class) {
                    hits.push(target);
                }
            }
        }
        hits
    }
}

/// Outcome of re-discovering one object class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub added: usize,
    pub removed: usize,
    pub kept: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct WatchpointRegistry {
    watchpoints: SlotMap<WatchId, Watchpoint>,
    order: Vec<WatchId>,
    by_handle: FxHashMap<WatchHandle, WatchId>,
    by_gfn: FxHashMap<Gfn, WatchId>,
}

impl WatchpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch every frame `target` spans.
    ///
    /// Fails only when none of its frames could be watched. Returns the
    /// handle of the first frame that is watched.
    pub fn register<I>(
        &mut self,
        session: &mut I,
        target: TargetDescriptor,
    ) -> Result<WatchHandle, RegisterError>
    where
        I: Introspector + ?Sized,
    {
        if target.extent == 0 {
            return Err(RegisterError::EmptyExtent { target });
        }

        let first = target.base.gfn();
        let last = (target.base + (target.extent - 1)).gfn();
        let mut handle = None;
        let mut refusal = None;
        for gfn in (first.0..=last.0).map(Gfn) {
            match self.watch_frame(session, gfn, &target) {
                Ok(watched) => {
                    handle.get_or_insert(watched);
                }
                Err(err) => {
                    debug!(%target, %gfn, %err, "frame left unwatched");
                    refusal = Some(err);
                }
            }
        }

        match (handle, refusal) {
            (Some(handle), _) => Ok(handle),
            (None, Some(source)) => Err(RegisterError::Refused { target, source }),
            (None, None) => Err(RegisterError::EmptyExtent { target }),
        }
    }

    fn watch_frame<I>(
        &mut self,
        session: &mut I,
        gfn: Gfn,
        target: &TargetDescriptor,
    ) -> Result<WatchHandle, IntrospectionError>
    where
        I: Introspector + ?Sized,
    {
        if let Some(watchpoint) = self
            .by_gfn
            .get(&gfn)
            .and_then(|id| self.watchpoints.get_mut(*id))
        {
            debug!(%target, handle = ?watchpoint.handle, "sharing watched frame");
            watchpoint.targets.push(target.clone());
            return Ok(watchpoint.handle);
        }

        let handle = session.watch(gfn, Access::WRITE)?;
        debug!(%target, %gfn, ?handle, "watchpoint registered");

        let id = self.watchpoints.insert(Watchpoint {
            gfn,
            access: Access::WRITE,
            handle,
            targets: vec![target.clone()],
            snapshot: None,
            pending: None,
        });
        self.order.push(id);
        self.by_handle.insert(handle, id);
        self.by_gfn.insert(gfn, id);
        Ok(handle)
    }

    /// Register every target, skipping the ones that fail. Returns the number
    /// registered.
    pub fn register_batch<I>(
        &mut self,
        session: &mut I,
        targets: impl IntoIterator<Item = TargetDescriptor>,
    ) -> usize
    where
        I: Introspector + ?Sized,
    {
        let mut registered = 0;
        for target in targets {
            match self.register(session, target) {
                Ok(_) => registered += 1,
                Err(err) => warn!(%err, "skipping target"),
            }
        }
        registered
    }

    /// Clear every watchpoint in insertion order and empty the registry.
    /// Returns the number of watchpoints cleared.
    pub fn unregister_all<I>(&mut self, session: &mut I) -> usize
    where
        I: Introspector + ?Sized,
    {
        let mut cleared = 0;
        for id in std::mem::take(&mut self.order) {
            let Some(watchpoint) = self.watchpoints.remove(id) else {
                continue;
            };
            Self::release(session, watchpoint);
            cleared += 1;
        }
        self.by_handle.clear();
        self.by_gfn.clear();
        cleared
    }

    /// Bring the watchpoints of `class` in line with a fresh discovery.
    ///
    /// Objects still present keep their watchpoint (and snapshot); vanished
    /// ones are dropped, releasing the frame once nothing else lives on it;
    /// new ones are registered.
    pub fn reconcile<I>(
        &mut self,
        session: &mut I,
        class: ObjectClass,
        fresh: Vec<TargetDescriptor>,
    ) -> Reconciliation
    where
        I: Introspector + ?Sized,
    {
        let current: FxHashSet<(Va, Pa)> = fresh.iter().map(|t| (t.va, t.base)).collect();
        let mut report = Reconciliation::default();
        let mut known = FxHashSet::default();
        let mut gone = FxHashSet::default();
        let mut emptied = Vec::new();

        for &id in &self.order {
            let Some(watchpoint) = self.watchpoints.get_mut(id) else {
                continue;
            };
            watchpoint.targets.retain(|target| {
                if target.class != class {
                    return true;
                }
                let key = (target.va, target.base);
                if current.contains(&key) {
                    known.insert(key);
                    true
                } else {
                    if gone.insert(key) {
                        debug!(%target, "object vanished");
                    }
                    false
                }
            });
            if watchpoint.targets.is_empty() {
                emptied.push(id);
            }
        }

        report.kept = known.len();
        report.removed = gone.len();
        for id in emptied {
            self.remove(session, id);
        }

        for target in fresh {
            if known.contains(&(target.va, target.base)) {
                continue;
            }
            match self.register(session, target) {
                Ok(_) => report.added += 1,
                Err(err) => {
                    warn!(%err, "skipping new target");
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn get(&self, handle: WatchHandle) -> Option<&Watchpoint> {
        self.by_handle
            .get(&handle)
            .and_then(|id| self.watchpoints.get(*id))
    }

    pub fn get_mut(&mut self, handle: WatchHandle) -> Option<&mut Watchpoint> {
        self.by_handle
            .get(&handle)
            .and_then(|id| self.watchpoints.get_mut(*id))
    }

    /// Watchpoints in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Watchpoint> {
        self.order.iter().filter_map(|id| self.watchpoints.get(*id))
    }

    pub fn len(&self) -> usize {
        self.watchpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchpoints.is_empty()
    }

    /// Number of monitored objects, each counted once however many frames
    /// it spans or shares.
    pub fn target_count(&self) -> usize {
        self.targets().count()
    }

    pub fn count_class(&self, class: ObjectClass) -> usize {
        self.targets().filter(|target| target.class == class).count()
    }

    fn targets(&self) -> impl Iterator<Item = &TargetDescriptor> {
        let mut seen = FxHashSet::default();
        self.iter()
            .flat_map(|w| &w.targets)
            .filter(move |target| seen.insert((target.class, target.va, target.base)))
    }

    fn remove<I>(&mut self, session: &mut I, id: WatchId)
    where
        I: Introspector + ?Sized,
    {
        let Some(watchpoint) = self.watchpoints.remove(id) else {
            return;
        };
        self.order.retain(|other| *other != id);
        self.by_handle.remove(&watchpoint.handle);
        self.by_gfn.remove(&watchpoint.gfn);
        Self::release(session, watchpoint);
    }

    fn release<I>(session: &mut I, watchpoint: Watchpoint)
    where
        I: Introspector + ?Sized,
    {
        if let Err(err) = session.clear(watchpoint.handle) {
            warn!(%err, handle = ?watchpoint.handle, gfn = %watchpoint.gfn, "failed to clear watchpoint");
        }
        debug!(
            handle = ?watchpoint.handle,
            gfn = %watchpoint.gfn,
            targets = watchpoint.targets.len(),
            "watchpoint released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspection::MemoryGuest;
    use pretty_assertions::assert_eq;

    fn target(class: ObjectClass, va: u64, base: u64, extent: u64) -> TargetDescriptor {
        TargetDescriptor {
            class,
            base: Pa(base),
            extent,
            va: Va(va),
            label: format!("obj@{va:#x}"),
        }
    }

    fn guest() -> MemoryGuest {
        let mut guest = MemoryGuest::new("registry");
        guest.map(Va(0x10_0000), Pa(0x10_0000), 16);
        guest
    }

    #[test]
    fn objects_on_one_frame_share_a_watchpoint() {
        let mut guest = guest();
        let journal = guest.journal();
        let mut registry = WatchpointRegistry::new();

        let a = registry
            .register(&mut guest, target(ObjectClass::Process, 0x10_0000, 0x10_0000, 0x800))
            .unwrap();
        let b = registry
            .register(&mut guest, target(ObjectClass::OpenFiles, 0x10_0800, 0x10_0800, 0x40))
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.target_count(), 2);
        assert_eq!(journal.watched().len(), 1);

        let watchpoint = registry.get(a).unwrap();
        let classes = |address, mode| -> Vec<ObjectClass> {
            watchpoint.hits(Pa(address), mode).iter().map(|t| t.class).collect()
        };
        assert_eq!(classes(0x10_0810, MonitorMode::Precise), [ObjectClass::OpenFiles]);
        assert!(classes(0x10_0900, MonitorMode::Precise).is_empty());
        // Coarse mode reports every class living on the frame.
        assert_eq!(
            classes(0x10_0810, MonitorMode::Coarse),
            [ObjectClass::OpenFiles, ObjectClass::Process]
        );
        assert_eq!(
            classes(0x10_0900, MonitorMode::Coarse),
            [ObjectClass::Process, ObjectClass::OpenFiles]
        );
    }

    #[test]
    fn coarse_hits_name_each_class_once() {
        let mut guest = guest();
        let mut registry = WatchpointRegistry::new();
        let handle = registry
            .register(&mut guest, target(ObjectClass::OpenFiles, 0x10_0000, 0x10_0000, 0x40))
            .unwrap();
        registry
            .register(&mut guest, target(ObjectClass::OpenFiles, 0x10_0100, 0x10_0100, 0x40))
            .unwrap();

        let hits = registry.get(handle).unwrap().hits(Pa(0x10_0110), MonitorMode::Coarse);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].va, Va(0x10_0100));
    }

    #[test]
    fn object_spanning_two_frames_watches_both() {
        let mut guest = guest();
        let journal = guest.journal();
        let mut registry = WatchpointRegistry::new();
        // A task_struct starting late in its page.
        let task = target(ObjectClass::Process, 0x10_0800, 0x10_0800, 0x950);

        let handle = registry.register(&mut guest, task.clone()).unwrap();

        let frames: Vec<_> = journal.watched().iter().map(|(_, gfn)| *gfn).collect();
        assert_eq!(frames, [Gfn(0x100), Gfn(0x101)]);
        assert_eq!(registry.get(handle).unwrap().gfn, Gfn(0x100));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.target_count(), 1);

        // The tail of the object on the second frame is covered.
        let tail = registry.iter().nth(1).unwrap();
        let hits = tail.hits(Pa(0x10_1100), MonitorMode::Precise);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].label, task.label);
        assert!(tail.hits(Pa(0x10_1150), MonitorMode::Precise).is_empty());

        let report = registry.reconcile(&mut guest, ObjectClass::Process, Vec::new());
        assert_eq!(report.removed, 1);
        assert_eq!(journal.cleared().len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn partly_refused_object_is_still_registered() {
        let mut guest = guest();
        guest.refuse_watch(Gfn(0x100));
        let mut registry = WatchpointRegistry::new();

        let handle = registry
            .register(&mut guest, target(ObjectClass::Process, 0x10_0800, 0x10_0800, 0x950))
            .unwrap();

        let watchpoint = registry.get(handle).unwrap();
        assert_eq!(watchpoint.gfn, Gfn(0x101));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn batch_skips_refused_targets() {
        let mut guest = guest();
        guest.refuse_watch(Gfn(0x101));
        let mut registry = WatchpointRegistry::new();

        let registered = registry.register_batch(
            &mut guest,
            [
                target(ObjectClass::Module, 0x10_0000, 0x10_0000, 0x50),
                target(ObjectClass::Module, 0x10_1000, 0x10_1000, 0x50),
                target(ObjectClass::Module, 0x10_2000, 0x10_2000, 0x50),
                target(ObjectClass::Module, 0x10_3000, 0x10_3000, 0),
            ],
        );

        assert_eq!(registered, 2);
        let frames: Vec<_> = registry.iter().map(|w| w.gfn).collect();
        assert_eq!(frames, [Gfn(0x100), Gfn(0x102)]);
    }

    #[test]
    fn unregister_all_clears_in_order_and_is_idempotent() {
        let mut guest = guest();
        let journal = guest.journal();
        let mut registry = WatchpointRegistry::new();
        for page in [3u64, 1, 2] {
            let address = 0x10_0000 + page * 0x1000;
            registry
                .register(&mut guest, target(ObjectClass::Module, address, address, 0x50))
                .unwrap();
        }
        let handles: Vec<_> = registry.iter().map(|w| w.handle).collect();

        assert_eq!(registry.unregister_all(&mut guest), 3);
        assert_eq!(journal.cleared(), handles);
        assert!(registry.is_empty());
        assert_eq!(journal.live_watches(), 0);

        let cleared = journal.cleared();
        let releases = journal.releases();
        assert_eq!(registry.unregister_all(&mut guest), 0);
        assert_eq!(journal.cleared(), cleared);
        assert_eq!(journal.releases(), releases);
        assert_eq!(journal.live_watches(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn reconcile_adds_new_and_drops_vanished_objects() {
        let mut guest = guest();
        let journal = guest.journal();
        let mut registry = WatchpointRegistry::new();
        let old = target(ObjectClass::Process, 0x10_0000, 0x10_0000, 0x100);
        let stays = target(ObjectClass::Process, 0x10_1000, 0x10_1000, 0x100);
        let neighbour = target(ObjectClass::OpenFiles, 0x10_0800, 0x10_0800, 0x40);
        registry.register_batch(&mut guest, [old.clone(), stays.clone(), neighbour]);
        registry.get_mut(WatchHandle(2)).unwrap().snapshot = Some(7);

        let new = target(ObjectClass::Process, 0x10_2000, 0x10_2000, 0x100);
        let report = registry.reconcile(&mut guest, ObjectClass::Process, vec![stays, new]);

        assert_eq!(
            report,
            Reconciliation {
                added: 1,
                removed: 1,
                kept: 1,
                failed: 0,
            }
        );
        // The vanished task's frame still carries the files_struct.
        assert!(journal.cleared().is_empty());
        assert_eq!(registry.count_class(ObjectClass::Process), 2);
        assert_eq!(registry.count_class(ObjectClass::OpenFiles), 1);
        assert_eq!(registry.get(WatchHandle(2)).unwrap().snapshot, Some(7));

        let report = registry.reconcile(&mut guest, ObjectClass::OpenFiles, Vec::new());
        assert_eq!(report.removed, 1);
        assert_eq!(journal.cleared(), [WatchHandle(1)]);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(WatchHandle(1)).is_none());
    }
}
