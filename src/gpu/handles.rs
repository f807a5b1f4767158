// SPDX-License-Identifier: AGPL-3.0-only

//! Stable integer handles and the grow-only arenas behind them.
//!
//! Handle `0` is the null handle for every category. Valid handles are
//! assigned densely from 1 and never reused within a registry's lifetime;
//! a released slot stays empty.

use std::fmt;
use std::marker::PhantomData;

/// Category marker for program handles.
#[derive(Debug)]
pub enum ProgramTag {}
/// Category marker for kernel handles.
#[derive(Debug)]
pub enum KernelTag {}
/// Category marker for buffer handles.
#[derive(Debug)]
pub enum BufferTag {}

/// Registry category, used for diagnostics.
pub trait HandleKind {
    const NAME: &'static str;
}

impl HandleKind for ProgramTag {
    const NAME: &'static str = "program";
}
impl HandleKind for KernelTag {
    const NAME: &'static str = "kernel";
}
impl HandleKind for BufferTag {
    const NAME: &'static str = "buffer";
}

/// Typed 1-based handle into a registry arena.
pub struct Handle<K> {
    index: u32,
    _kind: PhantomData<fn() -> K>,
}

pub type ProgramHandle = Handle<ProgramTag>;
pub type KernelHandle = Handle<KernelTag>;
pub type BufferHandle = Handle<BufferTag>;

impl<K> Handle<K> {
    /// The invalid handle.
    pub const NULL: Self = Self::from_raw(0);

    #[must_use]
    pub const fn from_raw(index: u32) -> Self {
        Self {
            index,
            _kind: PhantomData,
        }
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.index == 0
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}
impl<K> Eq for Handle<K> {}

impl<K> PartialOrd for Handle<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<K> Ord for Handle<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl<K> std::hash::Hash for Handle<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<K: HandleKind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", K::NAME, self.index)
    }
}

impl<K> fmt::Display for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index)
    }
}

/// Grow-only slot storage addressed by [`Handle`].
pub struct Arena<K, T> {
    slots: Vec<Option<T>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K, T> Default for Arena<K, T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            _kind: PhantomData,
        }
    }
}

impl<K: HandleKind, T> Arena<K, T> {
    /// Store `value` and return its new handle (always > every earlier one).
    pub fn insert(&mut self, value: T) -> Handle<K> {
        self.slots.push(Some(value));
        Handle::from_raw(u32::try_from(self.slots.len()).unwrap_or(u32::MAX))
    }

    #[must_use]
    pub fn get(&self, handle: Handle<K>) -> Option<&T> {
        let slot = (handle.index as usize).checked_sub(1)?;
        self.slots.get(slot)?.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle<K>) -> Option<&mut T> {
        let slot = (handle.index as usize).checked_sub(1)?;
        self.slots.get_mut(slot)?.as_mut()
    }

    /// Empty the slot, returning its value. The handle is never reissued.
    pub fn take(&mut self, handle: Handle<K>) -> Option<T> {
        let slot = (handle.index as usize).checked_sub(1)?;
        self.slots.get_mut(slot)?.take()
    }

    /// Number of handles ever issued.
    #[must_use]
    pub fn issued(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots still holding a value.
    #[must_use]
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Live entries in ascending handle order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<K>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.as_ref()
                .map(|v| (Handle::from_raw(u32::try_from(i + 1).unwrap_or(u32::MAX)), v))
        })
    }

    /// Remove every live entry in ascending handle order.
    pub fn drain_live(&mut self) -> Vec<(Handle<K>, T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| {
                s.take()
                    .map(|v| (Handle::from_raw(u32::try_from(i + 1).unwrap_or(u32::MAX)), v))
            })
            .collect()
    }

    /// Resolve a handle or report it as invalid for this category.
    ///
    /// # Errors
    ///
    /// [`crate::error::ForgeError::InvalidHandle`] for null, unknown, or
    /// released handles.
    pub fn resolve(&self, handle: Handle<K>) -> crate::error::Result<&T> {
        self.get(handle)
            .ok_or(crate::error::ForgeError::InvalidHandle {
                kind: K::NAME,
                handle: handle.raw(),
            })
    }

    /// Mutable variant of [`Self::resolve`].
    ///
    /// # Errors
    ///
    /// [`crate::error::ForgeError::InvalidHandle`] for null, unknown, or
    /// released handles.
    pub fn resolve_mut(&mut self, handle: Handle<K>) -> crate::error::Result<&mut T> {
        self.get_mut(handle)
            .ok_or(crate::error::ForgeError::InvalidHandle {
                kind: K::NAME,
                handle: handle.raw(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_start_at_one_and_increase() {
        let mut arena: Arena<BufferTag, &str> = Arena::default();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(a.raw(), 1);
        assert_eq!(b.raw(), 2);
        assert!(a < b);
    }

    #[test]
    fn null_handle_never_resolves() {
        let mut arena: Arena<KernelTag, u8> = Arena::default();
        arena.insert(1);
        assert!(arena.get(KernelHandle::NULL).is_none());
        assert!(arena.resolve(KernelHandle::NULL).is_err());
    }

    #[test]
    fn taken_slots_are_not_reused() {
        let mut arena: Arena<ProgramTag, u8> = Arena::default();
        let a = arena.insert(1);
        assert_eq!(arena.take(a), Some(1));
        assert_eq!(arena.take(a), None);
        let b = arena.insert(2);
        assert_eq!(b.raw(), 2);
        assert_eq!(arena.issued(), 2);
        assert_eq!(arena.live(), 1);
    }

    #[test]
    fn drain_is_ascending() {
        let mut arena: Arena<BufferTag, u32> = Arena::default();
        for v in 0..5 {
            arena.insert(v);
        }
        arena.take(BufferHandle::from_raw(3));
        let order: Vec<u32> = arena.drain_live().iter().map(|(h, _)| h.raw()).collect();
        assert_eq!(order, vec![1, 2, 4, 5]);
        assert_eq!(arena.live(), 0);
    }

    #[test]
    fn debug_names_category() {
        assert_eq!(format!("{:?}", BufferHandle::from_raw(4)), "buffer#4");
    }
}
