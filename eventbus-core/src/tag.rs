//! Type tags stand in for a reflective class-hierarchy walk: every event
//! carries a [`TypeTag`] identity, and a publisher may additionally declare
//! the tag's supertypes when constructing the event so the registry can do
//! covariant matching without runtime reflection.

use std::any::{Any, TypeId};
use std::fmt;

/// Identity of an event's runtime type, with an explicit supertype chain
/// supplied by the publisher when the event is constructed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    pub fn of<T: Any + ?Sized + 'static>() -> Self {
        TypeTag {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({})", self.name)
    }
}

/// An opaque event value carrying its type tag plus the data needed to
/// resolve which subscriptions match it: an ordered chain of strict-ancestor
/// tags (nearest parent first, stopping before the universal root) and a
/// list of directly-implemented interface-like tags. The bus never inspects
/// or mutates the payload; it only reads these tags for dispatch.
pub struct BusEvent {
    tag: TypeTag,
    ancestors: Vec<TypeTag>,
    interfaces: Vec<TypeTag>,
    payload: std::sync::Arc<dyn Any + Send + Sync>,
}

impl BusEvent {
    /// A leaf event with no declared supertypes: matches universal
    /// subscribers and subscribers registered for exactly `T`.
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        BusEvent {
            tag: TypeTag::of::<T>(),
            ancestors: Vec::new(),
            interfaces: Vec::new(),
            payload: std::sync::Arc::new(value),
        }
    }

    /// An event that additionally declares its supertype chain and
    /// interface-like tags, enabling ancestor- and interface-based
    /// subscriber matching alongside exact-type and universal matching.
    pub fn with_hierarchy<T: Send + Sync + 'static>(
        value: T,
        ancestors: Vec<TypeTag>,
        interfaces: Vec<TypeTag>,
    ) -> Self {
        BusEvent {
            tag: TypeTag::of::<T>(),
            ancestors,
            interfaces,
            payload: std::sync::Arc::new(value),
        }
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    pub fn ancestors(&self) -> &[TypeTag] {
        &self.ancestors
    }

    pub fn interfaces(&self) -> &[TypeTag] {
        &self.interfaces
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl Clone for BusEvent {
    fn clone(&self) -> Self {
        BusEvent {
            tag: self.tag,
            ancestors: self.ancestors.clone(),
            interfaces: self.interfaces.clone(),
            payload: self.payload.clone(),
        }
    }
}

impl fmt::Debug for BusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusEvent").field("tag", &self.tag).finish()
    }
}
