#![forbid(unsafe_code)]

//! Per-class target discovery on top of the list walker.

use crate::domain::TargetDescriptor;
use crate::introspection::Introspector;
use crate::walker::{KernelListWalker, ListSpec, WalkAbort};
use config::{Layout, ObjectClass};
use tracing::{debug, warn};

fn process_list(layout: &Layout) -> ListSpec<'_> {
    let process = &layout.process;
    ListSpec {
        class: ObjectClass::Process,
        head_symbol: &process.head_symbol,
        head: process.head,
        link_offset: process.list_offset,
        name_offset: Some(process.name_offset),
        id_offset: Some(process.pid_offset),
        extent: process.extent,
    }
}

fn module_list(layout: &Layout) -> ListSpec<'_> {
    let module = &layout.module;
    ListSpec {
        class: ObjectClass::Module,
        head_symbol: &module.head_symbol,
        head: module.head,
        link_offset: module.list_offset,
        name_offset: Some(module.name_offset),
        id_offset: None,
        extent: module.extent,
    }
}

/// Find every current object of `class` in the guest.
///
/// Fails as a whole if any object cannot be read; the caller never sees a
/// partial target set.
pub fn discover<I>(
    session: &mut I,
    layout: &Layout,
    class: ObjectClass,
) -> Result<Vec<TargetDescriptor>, WalkAbort>
where
    I: Introspector + ?Sized,
{
    let targets = match class {
        ObjectClass::Process => KernelListWalker::new(session).walk(&process_list(layout))?,
        ObjectClass::Module => KernelListWalker::new(session).walk(&module_list(layout))?,
        ObjectClass::SocketInfo => socket_tables(session, layout)?,
        ObjectClass::OpenFiles => open_files(session, layout)?,
    };
    debug!(%class, count = targets.len(), "discovered targets");
    Ok(targets)
}

fn socket_tables<I>(session: &mut I, layout: &Layout) -> Result<Vec<TargetDescriptor>, WalkAbort>
where
    I: Introspector + ?Sized,
{
    let mut targets = Vec::with_capacity(layout.socket.symbols.len());
    for symbol in &layout.socket.symbols {
        let va = match session.resolve_symbol(symbol) {
            Ok(va) => va,
            Err(err) => {
                // Not every kernel build carries every protocol.
                warn!(%err, symbol, "socket table not present in guest");
                continue;
            }
        };
        let base = session
            .translate_kv2p(va)
            .map_err(|source| WalkAbort::Translation { object: va, source })?;
        targets.push(TargetDescriptor {
            class: ObjectClass::SocketInfo,
            base,
            extent: layout.socket.extent,
            va,
            label: symbol.clone(),
        });
    }
    Ok(targets)
}

fn open_files<I>(session: &mut I, layout: &Layout) -> Result<Vec<TargetDescriptor>, WalkAbort>
where
    I: Introspector + ?Sized,
{
    let processes = KernelListWalker::new(session).walk(&process_list(layout))?;
    let mut targets = Vec::with_capacity(processes.len());
    for process in processes {
        let files = session
            .read_addr_va(process.va + layout.process.files_offset)
            .map_err(|source| WalkAbort::Field {
                field: "files",
                object: process.va,
                source,
            })?;
        if files.is_null() {
            // kernel thread
            continue;
        }
        let base = session
            .translate_kv2p(files)
            .map_err(|source| WalkAbort::Translation {
                object: files,
                source,
            })?;
        targets.push(TargetDescriptor {
            class: ObjectClass::OpenFiles,
            base,
            extent: layout.files.extent,
            va: files,
            label: format!("files of {}", process.label),
        });
    }
    Ok(targets)
}
