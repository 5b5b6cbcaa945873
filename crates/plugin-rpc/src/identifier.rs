//! Capability identifiers.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Named token both endpoints use to address the same logical actor.
///
/// `T` is the client stub [`RpcProtocol::get_proxy`](crate::RpcProtocol::get_proxy)
/// hands out for this capability; the wire only ever sees the id string.
pub struct ProxyIdentifier<T> {
    id: &'static str,
    _proxy: PhantomData<fn() -> T>,
}

impl<T> ProxyIdentifier<T> {
    pub const fn new(id: &'static str) -> Self {
        Self {
            id,
            _proxy: PhantomData,
        }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }
}

impl<T> Clone for ProxyIdentifier<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ProxyIdentifier<T> {}

impl<T> PartialEq for ProxyIdentifier<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for ProxyIdentifier<T> {}

impl<T> Hash for ProxyIdentifier<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for ProxyIdentifier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProxyIdentifier").field(&self.id).finish()
    }
}

impl<T> fmt::Display for ProxyIdentifier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id)
    }
}
