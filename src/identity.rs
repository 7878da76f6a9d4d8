use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::hash::{BuildHasher, Hash, Hasher};

use siphasher::sip128::{Hasher128, SipHasher13};

/// The stable identity of a compiled unit.
///
/// A 128-bit hash over every descriptor field that affects compiled behavior:
/// namespace, type name, contract and body text. Two descriptors that differ
/// in any of these yield different identities, so a changed body never
/// reuses a stale artifact.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct UnitIdentity(u128);

impl UnitIdentity {
    /// Derive an identity from hashable parts.
    pub fn of<T: Hash + ?Sized>(parts: &T) -> Self {
        let mut state = SipHasher13::new();
        parts.hash(&mut state);
        Self(state.finish128().as_u128())
    }

    /// The raw hash.
    pub fn as_u128(self) -> u128 {
        self.0
    }
}

impl Debug for UnitIdentity {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "UnitIdentity({:032x})", self.0)
    }
}

/// Hash map keyed by identities that re-uses the identity as the hash value.
pub(crate) type IdentityMap<V> = HashMap<UnitIdentity, V, BuildIdentityHasher>;

#[derive(Copy, Clone, Default)]
pub(crate) struct BuildIdentityHasher;

#[derive(Default)]
pub(crate) struct IdentityHasher {
    value: u64,
}

impl Hasher for IdentityHasher {
    #[inline(always)]
    fn finish(&self) -> u64 {
        self.value
    }

    #[inline]
    fn write(&mut self, _bytes: &[u8]) {
        unimplemented!("identity maps only hash `UnitIdentity` keys")
    }

    #[inline]
    fn write_u128(&mut self, i: u128) {
        // The identity is already a siphash, so folding is enough.
        self.value = (i as u64) ^ ((i >> 64) as u64);
    }
}

impl BuildHasher for BuildIdentityHasher {
    type Hasher = IdentityHasher;

    #[inline]
    fn build_hasher(&self) -> IdentityHasher {
        IdentityHasher::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_stable_and_sensitive() {
        let a = UnitIdentity::of(&("demo", "Hex", "convert(value) = hex(value)"));
        let b = UnitIdentity::of(&("demo", "Hex", "convert(value) = hex(value)"));
        let c = UnitIdentity::of(&("demo", "Hex", "convert(value) = upper(value)"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_identity_map_lookup() {
        let mut map = IdentityMap::default();
        let a = UnitIdentity::of("alpha");
        let b = UnitIdentity::of("beta");
        map.insert(a, 1);
        map.insert(b, 2);
        assert_eq!(map.get(&a), Some(&1));
        assert_eq!(map.get(&b), Some(&2));
        assert_eq!(map.get(&UnitIdentity::of("gamma")), None);
    }
}
