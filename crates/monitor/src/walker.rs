#![forbid(unsafe_code)]

//! Circular kernel list traversal.
//!
//! Kernel lists are `struct list_head` links embedded in their containing
//! objects. A walk starts at a symbol, follows `next` pointers and subtracts
//! the link offset to get back to each object. It is all-or-nothing: a single
//! failed read discards everything collected so far, so a half-read list can
//! never turn into a set of watchpoints.

use crate::domain::{TargetDescriptor, Va};
use crate::introspection::{IntrospectionError, Introspector};
use config::{ListHead, ObjectClass};
use rustc_hash::FxHashSet;
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum WalkAbort {
    #[error("cannot resolve list head `{symbol}`: {source}")]
    Symbol {
        symbol: String,
        #[source]
        source: IntrospectionError,
    },

    #[error("failed to read {field} of object at {object}: {source}")]
    Field {
        field: &'static str,
        object: Va,
        #[source]
        source: IntrospectionError,
    },

    #[error("failed to follow list link at {link}: {source}")]
    Link {
        link: Va,
        #[source]
        source: IntrospectionError,
    },

    #[error("failed to translate object at {object}: {source}")]
    Translation {
        object: Va,
        #[source]
        source: IntrospectionError,
    },

    #[error("list at {head} reached {link} twice without returning to the head")]
    Cycle { head: Va, link: Va },
}

/// Where to find a list and what to read from each member.
#[derive(Debug, Clone)]
pub struct ListSpec<'a> {
    pub class: ObjectClass,
    pub head_symbol: &'a str,
    pub head: ListHead,
    /// Offset of the `list_head` inside the containing object.
    pub link_offset: u64,
    /// Offset of a NUL-terminated name field.
    pub name_offset: Option<u64>,
    /// Offset of a 32-bit id field (e.g. pid).
    pub id_offset: Option<u64>,
    /// Monitored bytes per object.
    pub extent: u64,
}

/// Walks one named list per call.
pub struct KernelListWalker<'s, I: ?Sized> {
    session: &'s mut I,
}

impl<'s, I: Introspector + ?Sized> KernelListWalker<'s, I> {
    pub fn new(session: &'s mut I) -> Self {
        Self { session }
    }

    /// Collect a descriptor for every member of the list, in list order.
    ///
    /// For a sentinel head with N members this performs N + 1 link reads; for
    /// an embedded head (the symbol is itself a member) N link reads.
    pub fn walk(&mut self, spec: &ListSpec<'_>) -> Result<Vec<TargetDescriptor>, WalkAbort> {
        let symbol = self
            .session
            .resolve_symbol(spec.head_symbol)
            .map_err(|source| WalkAbort::Symbol {
                symbol: spec.head_symbol.to_string(),
                source,
            })?;

        let (head, mut link) = match spec.head {
            ListHead::Sentinel => (symbol, self.next(symbol)?),
            ListHead::Embedded => {
                let head = symbol + spec.link_offset;
                (head, head)
            }
        };

        let mut targets = Vec::new();
        let mut visited = FxHashSet::default();
        loop {
            if spec.head == ListHead::Sentinel && link == head {
                break;
            }
            if !visited.insert(link) {
                return Err(WalkAbort::Cycle { head, link });
            }

            let object = link - spec.link_offset;
            targets.push(self.describe(spec, object)?);

            link = self.next(link)?;
            if spec.head == ListHead::Embedded && link == head {
                break;
            }
        }

        trace!(
            class = %spec.class,
            symbol = spec.head_symbol,
            count = targets.len(),
            "list walk complete"
        );
        Ok(targets)
    }

    fn next(&mut self, link: Va) -> Result<Va, WalkAbort> {
        self.session
            .read_addr_va(link)
            .map_err(|source| WalkAbort::Link { link, source })
    }

    fn describe(&mut self, spec: &ListSpec<'_>, object: Va) -> Result<TargetDescriptor, WalkAbort> {
        let id = spec
            .id_offset
            .map(|offset| {
                self.session
                    .read_u32_va(object + offset)
                    .map_err(|source| WalkAbort::Field {
                        field: "id",
                        object,
                        source,
                    })
            })
            .transpose()?;
        let name = spec
            .name_offset
            .map(|offset| {
                self.session
                    .read_str_va(object + offset)
                    .map_err(|source| WalkAbort::Field {
                        field: "name",
                        object,
                        source,
                    })
            })
            .transpose()?;
        let base = self
            .session
            .translate_kv2p(object)
            .map_err(|source| WalkAbort::Translation { object, source })?;

        let label = match (id, name) {
            (Some(id), Some(name)) => format!("[{id}] {name}"),
            (None, Some(name)) => name,
            (Some(id), None) => format!("[{id}]"),
            (None, None) => object.to_string(),
        };
        trace!(class = %spec.class, %object, %base, %label, "list member");

        Ok(TargetDescriptor {
            class: spec.class,
            base,
            extent: spec.extent,
            va: object,
            label,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Pa;
    use crate::introspection::MemoryGuest;
    use proptest::prelude::*;

    const BASE: Va = Va(0xffff_8880_0100_0000);
    const STRIDE: u64 = 0x1000;
    const LINK: u64 = 0x8;
    const NAME: u64 = 0x18;

    /// `modules`-style list: sentinel at BASE, members at BASE + k * STRIDE.
    fn module_list(names: &[&str]) -> MemoryGuest {
        let mut guest = MemoryGuest::new("walker");
        guest.map(BASE, Pa(0x100_0000), names.len() as u64 + 1);
        guest.define_symbol("modules", BASE);

        let links: Vec<Va> = (1..=names.len() as u64)
            .map(|k| BASE + k * STRIDE + LINK)
            .collect();
        let first = links.first().copied().unwrap_or(BASE);
        guest.poke_u64(BASE, first.0).unwrap();
        for (i, name) in names.iter().enumerate() {
            let next = links.get(i + 1).copied().unwrap_or(BASE);
            guest.poke_u64(links[i], next.0).unwrap();
            guest.poke_str(links[i] - LINK + NAME, name).unwrap();
        }
        guest
    }

    fn spec(head: ListHead) -> ListSpec<'static> {
        ListSpec {
            class: ObjectClass::Module,
            head_symbol: "modules",
            head,
            link_offset: LINK,
            name_offset: Some(NAME),
            id_offset: None,
            extent: 0x50,
        }
    }

    fn link_reads(guest: &MemoryGuest, count: usize) -> usize {
        let journal = guest.journal();
        std::iter::once(BASE)
            .chain((1..=count as u64).map(|k| BASE + k * STRIDE + LINK))
            .map(|link| journal.reads_at(link))
            .sum()
    }

    #[test]
    fn empty_sentinel_list_yields_nothing() {
        let mut guest = module_list(&[]);
        let targets = KernelListWalker::new(&mut guest)
            .walk(&spec(ListHead::Sentinel))
            .unwrap();
        assert!(targets.is_empty());
        assert_eq!(link_reads(&guest, 0), 1);
    }

    #[test]
    fn members_are_reported_in_list_order() {
        let mut guest = module_list(&["ext4", "nf_tables", "kvm"]);
        let targets = KernelListWalker::new(&mut guest)
            .walk(&spec(ListHead::Sentinel))
            .unwrap();

        let labels: Vec<_> = targets.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, ["ext4", "nf_tables", "kvm"]);
        assert_eq!(targets[1].va, BASE + 2 * STRIDE);
        assert_eq!(targets[1].base, Pa(0x100_2000));
        assert_eq!(targets[1].extent, 0x50);
        assert!(targets.iter().all(|t| t.class == ObjectClass::Module));
    }

    #[test]
    fn embedded_head_is_itself_a_member() {
        // Treat the first member as the head object: the walk starts there and
        // stops when it comes back, never touching the sentinel.
        let mut guest = module_list(&["a", "b"]);
        let first = BASE + STRIDE;
        guest.define_symbol("first", first);
        // Close the ring through the members only.
        guest.poke_u64(first + STRIDE + LINK, (first + LINK).0).unwrap();

        let spec = ListSpec {
            head_symbol: "first",
            ..spec(ListHead::Embedded)
        };
        let targets = KernelListWalker::new(&mut guest).walk(&spec).unwrap();

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].va, first);
        assert_eq!(guest.journal().reads_at(BASE), 0);
        assert_eq!(link_reads(&guest, 2), 2);
    }

    #[test]
    fn unreadable_name_aborts_whole_walk() {
        let mut guest = module_list(&["a", "b", "c"]);
        guest.fail_reads_at(BASE + 2 * STRIDE + NAME);

        let result = KernelListWalker::new(&mut guest).walk(&spec(ListHead::Sentinel));
        assert!(matches!(
            result,
            Err(WalkAbort::Field { field: "name", object, .. }) if object == BASE + 2 * STRIDE
        ));
    }

    #[test]
    fn broken_link_aborts_walk() {
        let mut guest = module_list(&["a", "b"]);
        let link = BASE + 2 * STRIDE + LINK;
        guest.fail_reads_at(link);

        let result = KernelListWalker::new(&mut guest).walk(&spec(ListHead::Sentinel));
        assert!(matches!(result, Err(WalkAbort::Link { link: at, .. }) if at == link));
    }

    #[test]
    fn ring_not_through_head_is_a_cycle() {
        let mut guest = module_list(&["a", "b", "c"]);
        // c -> b instead of c -> head
        let b = BASE + 2 * STRIDE + LINK;
        guest.poke_u64(BASE + 3 * STRIDE + LINK, b.0).unwrap();

        let result = KernelListWalker::new(&mut guest).walk(&spec(ListHead::Sentinel));
        assert!(matches!(result, Err(WalkAbort::Cycle { link, .. }) if link == b));
    }

    #[test]
    fn missing_symbol_aborts_walk() {
        let mut guest = module_list(&["a"]);
        let spec = ListSpec {
            head_symbol: "no_such_list",
            ..spec(ListHead::Sentinel)
        };
        assert!(matches!(
            KernelListWalker::new(&mut guest).walk(&spec),
            Err(WalkAbort::Symbol { .. })
        ));
    }

    proptest! {
        #[test]
        fn walk_visits_each_member_once(count in 0usize..24) {
            let names: Vec<String> = (0..count).map(|i| format!("mod{i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut guest = module_list(&refs);

            let targets = KernelListWalker::new(&mut guest)
                .walk(&spec(ListHead::Sentinel))
                .unwrap();

            prop_assert_eq!(targets.len(), count);
            prop_assert_eq!(link_reads(&guest, count), count + 1);
            let unique: FxHashSet<_> = targets.iter().map(|t| t.va).collect();
            prop_assert_eq!(unique.len(), count);
        }
    }
}
