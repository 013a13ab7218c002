#![forbid(unsafe_code)]

//! Interface to the hypervisor introspection library.
//!
//! Everything the monitor knows about the guest goes through [`Introspector`].
//! A live hypervisor backend and the in-memory [`MemoryGuest`] both implement
//! it; the rest of the crate never sees which one it is talking to.

mod image;
mod memory;

pub use image::{GuestImage, ImageConnector, ImageError, Mapping, MemoryCell, Word};
pub use memory::{GuestWrite, Journal, MemoryGuest, ReadRecord, StepRecord};

use crate::domain::{Gfn, Pa, Va};
use bitflags::bitflags;
use std::time::Duration;

pub type VcpuId = u32;

bitflags! {
    /// Memory access kinds a watchpoint traps on.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
    }
}

/// Opaque handle the collaborator hands out for a registered watchpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(pub u64);

/// Address-space context for translations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddressSpace {
    Kernel,
    Process(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum IntrospectionError {
    #[error("no such guest `{0}`")]
    NoSuchGuest(String),

    #[error("failed to load guest image: {0}")]
    Image(#[from] ImageError),

    #[error("session is closed")]
    Closed,

    #[error("failed to {0} guest")]
    RunState(&'static str),

    #[error("unknown kernel symbol `{0}`")]
    UnknownSymbol(String),

    #[error("no translation for {0}")]
    Unmapped(Va),

    #[error("failed to read guest memory at va {0}")]
    ReadVirtual(Va),

    #[error("failed to read guest memory at pa {0}")]
    ReadPhysical(Pa),

    #[error("watchpoint on frame {0} refused")]
    WatchRefused(Gfn),

    #[error("unknown watch handle {0:?}")]
    UnknownWatch(WatchHandle),

    #[error("single-step on vcpu {0} failed")]
    StepFailed(VcpuId),

    #[error("event poll failed: {0}")]
    PollFailed(String),
}

/// A trapped guest write, as delivered to [`EventHandler::on_write`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WriteEvent {
    pub handle: WatchHandle,
    pub gfn: Gfn,
    /// Offset of the faulting access inside the frame.
    pub offset: u64,
    pub vcpu: VcpuId,
    pub access: Access,
}

impl WriteEvent {
    pub fn address(&self) -> Pa {
        self.gfn.base() + self.offset
    }
}

/// What the collaborator should do with the watchpoint after a callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventResponse {
    Handled,
    /// The handler has no record of this watchpoint; the collaborator drops it.
    Unclaimed,
}

/// Operations a handler may issue while the poll call is in progress.
pub trait EventControl {
    fn read_u64_pa(&mut self, pa: Pa) -> Result<u64, IntrospectionError>;

    /// Lift the trap so the faulting instruction can retire.
    fn release(&mut self, handle: WatchHandle) -> Result<(), IntrospectionError>;

    /// Execute `steps` instructions on `vcpu`, then reinstall `reinstall`.
    /// With `notify` set, [`EventHandler::on_step_complete`] fires afterwards.
    fn step(
        &mut self,
        vcpu: VcpuId,
        steps: u32,
        reinstall: WatchHandle,
        notify: bool,
    ) -> Result<(), IntrospectionError>;
}

/// Callback invoked synchronously from inside [`Introspector::poll`].
///
/// The guest vCPU is stalled while this runs. Implementations must not block
/// and must not fail: errors are logged and swallowed.
pub trait EventHandler {
    fn on_write(&mut self, ctl: &mut dyn EventControl, event: &WriteEvent) -> EventResponse;

    fn on_step_complete(&mut self, _ctl: &mut dyn EventControl, _handle: WatchHandle, _vcpu: VcpuId) {}
}

pub trait Introspector {
    fn guest_name(&self) -> &str;

    fn pause(&mut self) -> Result<(), IntrospectionError>;
    fn resume(&mut self) -> Result<(), IntrospectionError>;

    fn translate(&mut self, space: AddressSpace, va: Va) -> Result<Pa, IntrospectionError>;
    fn resolve_symbol(&mut self, symbol: &str) -> Result<Va, IntrospectionError>;

    fn read_u32_va(&mut self, va: Va) -> Result<u32, IntrospectionError>;
    fn read_u64_va(&mut self, va: Va) -> Result<u64, IntrospectionError>;
    fn read_str_va(&mut self, va: Va) -> Result<String, IntrospectionError>;
    fn read_u64_pa(&mut self, pa: Pa) -> Result<u64, IntrospectionError>;
    fn read_str_pa(&mut self, pa: Pa) -> Result<String, IntrospectionError>;

    fn watch(&mut self, gfn: Gfn, access: Access) -> Result<WatchHandle, IntrospectionError>;
    fn clear(&mut self, handle: WatchHandle) -> Result<(), IntrospectionError>;

    /// Block until at least one event fired or `timeout` elapsed, running
    /// `handler` for every triggered watchpoint. Returns the number of
    /// callbacks issued.
    fn poll(
        &mut self,
        timeout: Duration,
        handler: &mut dyn EventHandler,
    ) -> Result<usize, IntrospectionError>;

    fn close(&mut self) -> Result<(), IntrospectionError>;

    fn translate_kv2p(&mut self, va: Va) -> Result<Pa, IntrospectionError> {
        self.translate(AddressSpace::Kernel, va)
    }

    /// Read a pointer-sized value.
    fn read_addr_va(&mut self, va: Va) -> Result<Va, IntrospectionError> {
        self.read_u64_va(va).map(Va)
    }
}

/// Opens introspection sessions by guest name.
pub trait Connector {
    type Session: Introspector;

    fn connect(&self, guest: &str) -> Result<Self::Session, IntrospectionError>;
}

impl<S, F> Connector for F
where
    S: Introspector,
    F: Fn(&str) -> Result<S, IntrospectionError>,
{
    type Session = S;

    fn connect(&self, guest: &str) -> Result<S, IntrospectionError> {
        self(guest)
    }
}
