//! Subscriber registry: an append-only universal list plus a type-tag-keyed
//! map, read by dispatch as an atomic snapshot so writers appending during a
//! dispatch never produce a torn read.
//!
//! Storage is an `ArcSwap` over an immutable `Vec`/`HashMap`: copy-on-write
//! on registration, snapshot-read on dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::subscriber::Subscriber;
use crate::tag::{BusEvent, TypeTag};

#[derive(Default)]
pub struct Registry {
    universal: ArcSwap<Vec<Arc<dyn Subscriber>>>,
    typed: ArcSwap<HashMap<TypeTag, Vec<Arc<dyn Subscriber>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            universal: ArcSwap::from_pointee(Vec::new()),
            typed: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Append `sub` to the universal list. Appears in no typed list as a
    /// side effect.
    pub fn add_universal(&self, sub: Arc<dyn Subscriber>) {
        let current = self.universal.load_full();
        let mut next = (*current).clone();
        next.push(sub);
        self.universal.store(Arc::new(next));
    }

    /// Append `sub` to the list for `tag`, creating the list on first use.
    /// Appears in no other tag's list as a side effect.
    pub fn add_typed(&self, tag: TypeTag, sub: Arc<dyn Subscriber>) {
        let current = self.typed.load_full();
        let mut next = (*current).clone();
        next.entry(tag).or_default().push(sub);
        self.typed.store(Arc::new(next));
    }

    /// Invoke `on_match` for every subscription that matches `event`, in
    /// dispatch order: universal, exact type, declared ancestors (nearest
    /// first), then declared interface tags (declaration order). Each
    /// category's subscribers fire in registration order.
    pub fn dispatch(&self, event: &BusEvent, mut on_match: impl FnMut(&Arc<dyn Subscriber>)) {
        let universal = self.universal.load();
        for sub in universal.iter() {
            on_match(sub);
        }

        let typed = self.typed.load();
        if let Some(list) = typed.get(&event.tag()) {
            for sub in list.iter() {
                on_match(sub);
            }
        }
        for ancestor in event.ancestors() {
            if let Some(list) = typed.get(ancestor) {
                for sub in list.iter() {
                    on_match(sub);
                }
            }
        }
        for iface in event.interfaces() {
            if let Some(list) = typed.get(iface) {
                for sub in list.iter() {
                    on_match(sub);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn universal_sees_every_event() {
        let registry = Registry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        registry.add_universal(Arc::new(move |e: &BusEvent| {
            seen2.lock().push(e.tag().name());
        }));

        registry.dispatch(&BusEvent::new(1u32), |s| s.handle(&BusEvent::new(1u32)));
        registry.dispatch(&BusEvent::new("hi"), |s| s.handle(&BusEvent::new("hi")));

        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn typed_matches_exact_and_ancestor() {
        let registry = Registry::new();
        let base_tag = TypeTag::of::<BaseMarker>();
        let hits = Arc::new(Mutex::new(0u32));
        let hits2 = hits.clone();
        registry.add_typed(
            base_tag,
            Arc::new(move |_: &BusEvent| {
                *hits2.lock() += 1;
            }),
        );

        struct BaseMarker;
        struct Derived;
        let derived_event =
            BusEvent::with_hierarchy::<Derived>(Derived, vec![base_tag], vec![]);
        registry.dispatch(&derived_event, |s| s.handle(&derived_event));
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn dispatch_order_is_universal_then_exact_then_ancestors() {
        let registry = Registry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        registry.add_universal(Arc::new(move |_: &BusEvent| o1.lock().push("universal")));

        struct Leaf;
        struct Parent;
        let leaf_tag = TypeTag::of::<Leaf>();
        let parent_tag = TypeTag::of::<Parent>();

        let o2 = order.clone();
        registry.add_typed(leaf_tag, Arc::new(move |_: &BusEvent| o2.lock().push("exact")));
        let o3 = order.clone();
        registry.add_typed(
            parent_tag,
            Arc::new(move |_: &BusEvent| o3.lock().push("ancestor")),
        );

        let event = BusEvent::with_hierarchy::<Leaf>(Leaf, vec![parent_tag], vec![]);
        registry.dispatch(&event, |s| s.handle(&event));

        assert_eq!(*order.lock(), vec!["universal", "exact", "ancestor"]);
    }
}
