//! Generation-checked storage for session and reference bookkeeping.
//!
//! Clients hold a [`Handle`] instead of a pointer into manager state. A slot
//! is reused after removal but its generation is bumped, so a handle that
//! outlived its entry simply resolves to nothing.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
   index: u32,
   generation: u32,
}

impl fmt::Display for Handle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "#{}.{}", self.index, self.generation)
   }
}

#[derive(Debug)]
struct Slot<T> {
   generation: u32,
   value: Option<T>,
}

/// Arena addressed by [`Handle`]s.
#[derive(Debug)]
pub struct Registry<T> {
   slots: Vec<Slot<T>>,
   free: Vec<u32>,
   len: usize,
}

impl<T> Default for Registry<T> {
   fn default() -> Self {
      Self::new()
   }
}

impl<T> Registry<T> {
   pub const fn new() -> Self {
      Self {
         slots: Vec::new(),
         free: Vec::new(),
         len: 0,
      }
   }

   pub fn insert(&mut self, value: T) -> Handle {
      self.len += 1;
      if let Some(index) = self.free.pop() {
         let slot = &mut self.slots[index as usize];
         slot.value = Some(value);
         return Handle {
            index,
            generation: slot.generation,
         };
      }

      let index = self.slots.len() as u32;
      self.slots.push(Slot {
         generation: 0,
         value: Some(value),
      });
      Handle {
         index,
         generation: 0,
      }
   }

   pub fn remove(&mut self, handle: Handle) -> Option<T> {
      let slot = self.slots.get_mut(handle.index as usize)?;
      if slot.generation != handle.generation {
         return None;
      }
      let value = slot.value.take()?;
      slot.generation = slot.generation.wrapping_add(1);
      self.free.push(handle.index);
      self.len -= 1;
      Some(value)
   }

   pub fn get(&self, handle: Handle) -> Option<&T> {
      self
         .slots
         .get(handle.index as usize)
         .filter(|slot| slot.generation == handle.generation)
         .and_then(|slot| slot.value.as_ref())
   }

   pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
      self
         .slots
         .get_mut(handle.index as usize)
         .filter(|slot| slot.generation == handle.generation)
         .and_then(|slot| slot.value.as_mut())
   }

   pub fn contains(&self, handle: Handle) -> bool {
      self.get(handle).is_some()
   }

   pub const fn len(&self) -> usize {
      self.len
   }

   pub const fn is_empty(&self) -> bool {
      self.len == 0
   }

   pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
      self.slots.iter().enumerate().filter_map(|(index, slot)| {
         slot.value.as_ref().map(|value| {
            (
               Handle {
                  index: index as u32,
                  generation: slot.generation,
               },
               value,
            )
         })
      })
   }

   pub fn values(&self) -> impl Iterator<Item = &T> {
      self.slots.iter().filter_map(|slot| slot.value.as_ref())
   }

   /// Removes every entry, invalidating all outstanding handles.
   pub fn drain(&mut self) -> Vec<T> {
      let handles: Vec<Handle> = self.iter().map(|(handle, _)| handle).collect();
      handles
         .into_iter()
         .filter_map(|handle| self.remove(handle))
         .collect()
   }
}
