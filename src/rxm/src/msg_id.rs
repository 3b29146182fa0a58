//! Dense ids correlating rendezvous control traffic with in-flight send
//! records.
//!
//! A wire id packs the table index in its low 32 bits and a generation in the
//! high 32 bits. The generation advances on every release so an ack for a
//! released id is rejected instead of completing the wrong send.
use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Message id table exhausted")]
    Exhausted,
    #[error("Unknown message id {0:#x}")]
    InvalidId(u64),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgId(pub u64);

impl MsgId {
    #[inline]
    fn new(index: u32, generation: u32) -> Self {
        MsgId((generation as u64) << 32 | index as u64)
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MsgId({}@{})", self.index(), self.generation())
    }
}

pub struct MsgIdTable {
    slots: Vec<Option<u32>>,
    generations: Vec<u32>,
    free: BTreeSet<u32>,
}

impl MsgIdTable {
    pub fn new(cap: usize) -> Self {
        assert!(cap <= u32::MAX as usize);
        MsgIdTable {
            slots: vec![None; cap],
            generations: vec![0; cap],
            free: (0..cap as u32).collect(),
        }
    }

    /// Assigns the smallest free index to `slot`.
    pub fn allocate(&mut self, slot: u32) -> Result<MsgId, Error> {
        let index = self.free.pop_first().ok_or(Error::Exhausted)?;
        self.slots[index as usize] = Some(slot);
        Ok(MsgId::new(index, self.generations[index as usize]))
    }

    /// Returns the slot `id` was allocated for.
    pub fn resolve(&self, id: MsgId) -> Result<u32, Error> {
        let index = id.index() as usize;
        match self.slots.get(index) {
            Some(Some(slot)) if self.generations[index] == id.generation() => Ok(*slot),
            _ => Err(Error::InvalidId(id.0)),
        }
    }

    /// Frees `id`, returning the slot it mapped to.
    pub fn release(&mut self, id: MsgId) -> Result<u32, Error> {
        let slot = self.resolve(id)?;
        let index = id.index();
        self.slots[index as usize] = None;
        self.generations[index as usize] = self.generations[index as usize].wrapping_add(1);
        self.free.insert(index);
        Ok(slot)
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
