#![forbid(unsafe_code)]

//! The write callback.
//!
//! Runs inside [`Introspector::poll`](crate::introspection::Introspector::poll)
//! while the faulting vCPU is stalled: no blocking, no I/O beyond reading one
//! word back from guest memory, and no error may escape.

use crate::domain::{ClassificationToken, Pa};
use crate::introspection::{
    EventControl, EventHandler, EventResponse, VcpuId, WatchHandle, WriteEvent,
};
use crate::queue::EventQueue;
use crate::registry::WatchpointRegistry;
use crate::stats::Statistics;
use config::{MonitorMode, ObjectClass};
use tracing::{trace, warn};

pub struct WriteClassifier<'a> {
    registry: &'a mut WatchpointRegistry,
    stats: &'a mut Statistics,
    queue: &'a EventQueue,
    mode: MonitorMode,
}

impl<'a> WriteClassifier<'a> {
    pub fn new(
        registry: &'a mut WatchpointRegistry,
        stats: &'a mut Statistics,
        queue: &'a EventQueue,
        mode: MonitorMode,
    ) -> Self {
        Self {
            registry,
            stats,
            queue,
            mode,
        }
    }

    /// Let the faulting instruction retire, then put the trap back.
    fn rearm(&mut self, ctl: &mut dyn EventControl, event: &WriteEvent, notify: bool) {
        let result = ctl
            .release(event.handle)
            .and_then(|()| ctl.step(event.vcpu, 1, event.handle, notify));
        if let Err(err) = result {
            self.stats.rearm_failures += 1;
            warn!(%err, handle = ?event.handle, vcpu = event.vcpu, "failed to re-arm watchpoint");
        }
    }
}

impl EventHandler for WriteClassifier<'_> {
    fn on_write(&mut self, ctl: &mut dyn EventControl, event: &WriteEvent) -> EventResponse {
        let Some(watchpoint) = self.registry.get_mut(event.handle) else {
            warn!(handle = ?event.handle, gfn = %event.gfn, "write on unknown watchpoint");
            return EventResponse::Unclaimed;
        };

        let address = event.address();
        let classes: Vec<ObjectClass> = watchpoint
            .hits(address, self.mode)
            .into_iter()
            .map(|target| {
                trace!(%address, vcpu = event.vcpu, target = %target.label, class = %target.class, "monitored write");
                target.class
            })
            .collect();

        if classes.is_empty() {
            trace!(%address, vcpu = event.vcpu, "irrelevant write");
            self.stats.record_irrelevant();
            self.rearm(ctl, event, false);
        } else {
            watchpoint.pending = Some(Pa(address.0 & !7));
            self.stats.record_hit(&classes);
            for class in classes {
                self.queue.push_back(ClassificationToken::from(class));
            }
            self.rearm(ctl, event, true);
        }
        EventResponse::Handled
    }

    fn on_step_complete(&mut self, ctl: &mut dyn EventControl, handle: WatchHandle, vcpu: VcpuId) {
        let Some(watchpoint) = self.registry.get_mut(handle) else {
            return;
        };
        let Some(word) = watchpoint.pending.take() else {
            return;
        };
        match ctl.read_u64_pa(word) {
            Ok(value) => {
                if let Some(previous) = watchpoint.snapshot.filter(|previous| *previous != value) {
                    trace!(%word, vcpu, previous, value, "watched value changed");
                }
                watchpoint.snapshot = Some(value);
            }
            Err(err) => trace!(%err, %word, "failed to sample written word"),
        }
    }
}
