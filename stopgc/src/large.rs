//! Large-object space. Every object gets its own page-aligned mapping, so
//! freeing one hands its pages straight back to the OS.

use std::{collections::BTreeMap, ptr::NonNull};

use crate::system::{self, OS_PAGE_SIZE};

#[derive(Debug)]
pub struct LargeObject {
    pub start: usize,
    /// Mapped bytes, a multiple of the page size.
    pub size: usize,
    pub atomic: bool,
    pub marked: bool,
}

impl LargeObject {
    #[inline(always)]
    fn contains(&self, addr: usize, interior: bool) -> bool {
        if interior {
            addr >= self.start && addr < self.start + self.size
        } else {
            addr == self.start
        }
    }

    fn unmap(&self) {
        if let Some(ptr) = NonNull::new(self.start as *mut u8) {
            system::unmap_memory(ptr, self.size);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LargeSweep {
    pub live_objects: usize,
    pub live_bytes: usize,
    pub freed_objects: usize,
    pub freed_bytes: usize,
}

#[derive(Debug, Default)]
pub struct LargeSpace {
    objects: Vec<Option<LargeObject>>,
    free_ids: Vec<u32>,
    /// Start address to object id, for conservative lookups.
    index: BTreeMap<usize, u32>,
    bytes: usize,
}

impl LargeSpace {
    /// Bytes a request of `size` occupies, `None` on overflow.
    pub fn footprint(size: usize) -> Option<usize> {
        size.max(1).checked_next_multiple_of(OS_PAGE_SIZE)
    }

    /// Maps a fresh zeroed object. `None` if the OS refuses.
    pub fn allocate(&mut self, size: usize, atomic: bool) -> Option<(u32, usize)> {
        let mapped = Self::footprint(size)?;
        let start = system::map_memory(mapped)?.as_ptr() as usize;

        let object = LargeObject {
            start,
            size: mapped,
            atomic,
            marked: false,
        };
        let id = match self.free_ids.pop() {
            Some(id) => {
                self.objects[id as usize] = Some(object);
                id
            }
            None => {
                self.objects.push(Some(object));
                (self.objects.len() - 1) as u32
            }
        };
        self.index.insert(start, id);
        self.bytes += mapped;
        Some((id, start))
    }

    pub fn find(&self, addr: usize, interior: bool) -> Option<u32> {
        let (_, &id) = self.index.range(..=addr).next_back()?;
        self.get(id)
            .filter(|obj| obj.contains(addr, interior))
            .map(|_| id)
    }

    #[inline]
    pub fn get(&self, id: u32) -> Option<&LargeObject> {
        self.objects.get(id as usize)?.as_ref()
    }

    /// Marks object `id`, returns `true` if it was not marked yet.
    pub fn mark(&mut self, id: u32) -> bool {
        match self.objects.get_mut(id as usize) {
            Some(Some(obj)) if !obj.marked => {
                obj.marked = true;
                true
            }
            _ => false,
        }
    }

    /// Upper bound of ids handed out so far.
    pub fn id_bound(&self) -> u32 {
        self.objects.len() as u32
    }

    /// Unmaps every unmarked object and clears the marks of the rest.
    pub fn sweep(&mut self) -> LargeSweep {
        let mut report = LargeSweep::default();
        for id in 0..self.objects.len() {
            let Some(obj) = self.objects[id].as_mut() else {
                continue;
            };
            if obj.marked {
                obj.marked = false;
                report.live_objects += 1;
                report.live_bytes += obj.size;
                continue;
            }
            report.freed_objects += 1;
            report.freed_bytes += obj.size;
            self.remove(id as u32);
        }
        report
    }

    /// Explicitly frees the object starting at `addr`.
    pub fn free(&mut self, addr: usize) -> Option<usize> {
        let id = self.find(addr, false)?;
        let size = self.get(id)?.size;
        self.remove(id);
        Some(size)
    }

    fn remove(&mut self, id: u32) {
        if let Some(obj) = self.objects[id as usize].take() {
            self.index.remove(&obj.start);
            self.bytes -= obj.size;
            self.free_ids.push(id);
            obj.unmap();
        }
    }

    /// Lowest start and highest end over all objects.
    pub fn bounds(&self) -> Option<(usize, usize)> {
        let (&low, _) = self.index.first_key_value()?;
        let (_, &last) = self.index.last_key_value()?;
        let high = self.get(last).map(|o| o.start + o.size)?;
        Some((low, high))
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }
}

impl Drop for LargeSpace {
    fn drop(&mut self) {
        for obj in self.objects.iter().flatten() {
            obj.unmap();
        }
    }
}
