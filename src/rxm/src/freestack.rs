//! Fixed arena of records plus a stack of free indices.

/// An arena of `T` with stable indices. `pop` hands out the most recently
/// freed index first.
pub struct FreeStack<T> {
    slots: Vec<T>,
    free: Vec<u32>,
    used: Vec<bool>,
}

impl<T: Default> FreeStack<T> {
    pub fn new(cap: usize) -> Self {
        assert!(cap <= u32::MAX as usize);
        let mut slots = Vec::with_capacity(cap);
        slots.resize_with(cap, T::default);
        // reversed so that index 0 is handed out first
        let free = (0..cap as u32).rev().collect();
        FreeStack {
            slots,
            free,
            used: vec![false; cap],
        }
    }
}

impl<T> FreeStack<T> {
    /// Takes a free slot and stores `value` in it. Returns `None` if every
    /// slot is in use, in which case `value` is dropped.
    #[inline]
    pub fn pop(&mut self, value: T) -> Option<u32> {
        let index = self.free.pop()?;
        self.slots[index as usize] = value;
        self.used[index as usize] = true;
        Some(index)
    }

    /// Returns the slot to the free stack.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not in use.
    #[inline]
    pub fn push(&mut self, index: u32) {
        assert!(
            self.is_used(index),
            "releasing slot {} that is not in use",
            index
        );
        self.used[index as usize] = false;
        self.free.push(index);
    }

    #[inline]
    pub fn is_used(&self, index: u32) -> bool {
        self.used.get(index as usize).copied().unwrap_or(false)
    }

    #[inline]
    pub fn get(&self, index: u32) -> Option<&T> {
        if self.is_used(index) {
            Some(&self.slots[index as usize])
        } else {
            None
        }
    }

    #[inline]
    pub fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        if self.is_used(index) {
            Some(&mut self.slots[index as usize])
        } else {
            None
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Indices of the slots currently in use.
    pub fn used_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.used
            .iter()
            .enumerate()
            .filter(|(_, &u)| u)
            .map(|(i, _)| i as u32)
    }
}
