//! Bounded slot table with deferred slot reuse.
//!
//! Slots freed during a tick are quarantined until [`SlotArena::commit_released`]
//! so that a key observed earlier in the same tick never names a different
//! value.

/// Fixed-capacity table addressed by `u16` slots.
#[derive(Debug, Clone)]
pub struct SlotArena<T> {
    slots: Vec<Option<T>>,
    free: Vec<u16>,
    released: Vec<u16>,
    len: usize,
    capacity: u16,
}

impl<T> SlotArena<T> {
    /// Creates an empty arena that never holds more than `capacity` values.
    pub fn new(capacity: u16) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            released: Vec::new(),
            len: 0,
            capacity,
        }
    }

    /// Stores `value` in a vacant slot. Returns the value back when full.
    pub fn insert(&mut self, value: T) -> Result<u16, T> {
        if let Some(slot) = self.free.pop() {
            self.slots[usize::from(slot)] = Some(value);
            self.len += 1;
            return Ok(slot);
        }
        if self.slots.len() >= usize::from(self.capacity) {
            return Err(value);
        }
        let slot = self.slots.len() as u16;
        self.slots.push(Some(value));
        self.len += 1;
        Ok(slot)
    }

    /// Removes the value in `slot`. The slot stays unusable until the next commit.
    pub fn remove(&mut self, slot: u16) -> Option<T> {
        let value = self.slots.get_mut(usize::from(slot))?.take()?;
        self.released.push(slot);
        self.len -= 1;
        Some(value)
    }

    /// Makes slots removed since the last commit available again.
    pub fn commit_released(&mut self) {
        self.free.append(&mut self.released);
        // Lowest slot first.
        self.free.sort_unstable_by(|a, b| b.cmp(a));
    }

    pub fn get(&self, slot: u16) -> Option<&T> {
        self.slots.get(usize::from(slot))?.as_ref()
    }

    pub fn get_mut(&mut self, slot: u16) -> Option<&mut T> {
        self.slots.get_mut(usize::from(slot))?.as_mut()
    }

    /// Whether an insert right now would succeed.
    pub fn has_vacancy(&self) -> bool {
        !self.free.is_empty() || self.slots.len() < usize::from(self.capacity)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Occupied slots in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, value)| value.as_ref().map(|v| (slot as u16, v)))
    }
}
