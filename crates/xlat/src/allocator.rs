//! Bounded pool of translation-table nodes.
//!
//! Every node is one 4 KiB page holding 512 descriptors and is aligned to its own
//! size, so a node's physical identity can be recovered from any descriptor that
//! points at it. The pool never grows: callers size it for the worst-case fan-out
//! of the tables they build from it.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::{PhysicalAddress, TableError};

/// Log2 of the size of one table node.
pub const TABLE_SIZE_LOG2: u32 = 12;

/// Size of one table node in bytes.
pub const TABLE_SIZE: usize = 1 << TABLE_SIZE_LOG2;

/// Number of 64-bit descriptors in one table node.
pub const TABLE_ENTRIES: usize = TABLE_SIZE / size_of::<u64>();

/// One page-sized, page-aligned table of raw 64-bit descriptors.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct TableNode {
    entries: [u64; TABLE_ENTRIES],
}

const _: () = assert!(size_of::<TableNode>() == TABLE_SIZE);
const _: () = assert!(align_of::<TableNode>() == TABLE_SIZE);

impl TableNode {
    /// Creates a node with every descriptor cleared.
    pub const fn zeroed() -> Self {
        Self {
            entries: [0; TABLE_ENTRIES],
        }
    }

    /// Returns the raw descriptor at `index`.
    #[inline]
    pub fn entry(&self, index: usize) -> u64 {
        self.entries[index]
    }

    /// Stores a raw descriptor at `index`.
    #[inline]
    pub fn set_entry(&mut self, index: usize, value: u64) {
        self.entries[index] = value;
    }

    /// Returns a reference to the descriptor at `index`, for cache maintenance.
    #[inline]
    pub fn entry_ref(&self, index: usize) -> &u64 {
        &self.entries[index]
    }

    /// Returns all descriptors.
    pub fn entries(&self) -> &[u64; TABLE_ENTRIES] {
        &self.entries
    }

    fn clear(&mut self) {
        self.entries.fill(0);
    }
}

impl Default for TableNode {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// A typed view of a [`TableNode`].
///
/// # Safety
///
/// Implementors must be `#[repr(transparent)]` wrappers around [`TableNode`].
pub unsafe trait TableView {
    /// Reinterprets a node as this view.
    fn from_node(node: &TableNode) -> &Self
    where
        Self: Sized,
    {
        // SAFETY: the trait contract guarantees `Self` has the layout of `TableNode`.
        unsafe { &*(node as *const TableNode).cast::<Self>() }
    }

    /// Reinterprets a node as a mutable view.
    fn from_node_mut(node: &mut TableNode) -> &mut Self
    where
        Self: Sized,
    {
        // SAFETY: the trait contract guarantees `Self` has the layout of `TableNode`.
        unsafe { &mut *(node as *mut TableNode).cast::<Self>() }
    }
}

// SAFETY: a node is trivially a view of itself.
unsafe impl TableView for TableNode {}

enum Backing {
    Owned(Box<[TableNode]>),
    Borrowed(&'static mut [TableNode]),
}

impl Backing {
    fn nodes(&self) -> &[TableNode] {
        match self {
            Self::Owned(nodes) => nodes,
            Self::Borrowed(nodes) => nodes,
        }
    }

    fn nodes_mut(&mut self) -> &mut [TableNode] {
        match self {
            Self::Owned(nodes) => nodes,
            Self::Borrowed(nodes) => nodes,
        }
    }
}

/// A fixed-capacity pool of table nodes with known physical addresses.
///
/// Node `i` of the pool has physical address `phys_base + i * TABLE_SIZE`. The pool
/// performs no locking; it is edited from a single control thread.
pub struct TableAllocator {
    backing: Backing,
    phys_base: PhysicalAddress,
    used: Vec<u64>,
    free: usize,
}

impl TableAllocator {
    /// Creates a heap-backed pool of `capacity` nodes whose physical window starts at
    /// `phys_base`.
    ///
    /// This is the pool used when the heap is identity-mapped at `phys_base`, and by
    /// software emulation where the physical addresses are only identities.
    pub fn new(phys_base: PhysicalAddress, capacity: usize) -> Result<Self, TableError> {
        let nodes = vec![TableNode::zeroed(); capacity].into_boxed_slice();
        Self::with_backing(Backing::Owned(nodes), phys_base)
    }

    /// Creates a pool over caller-provided table memory.
    ///
    /// # Safety
    ///
    /// `region` must be physically contiguous memory starting at `phys_base` that
    /// stays reserved for the pool for the rest of the system's lifetime.
    pub unsafe fn from_region(
        region: &'static mut [TableNode],
        phys_base: PhysicalAddress,
    ) -> Result<Self, TableError> {
        region.iter_mut().for_each(TableNode::clear);
        Self::with_backing(Backing::Borrowed(region), phys_base)
    }

    fn with_backing(backing: Backing, phys_base: PhysicalAddress) -> Result<Self, TableError> {
        if !phys_base.is_aligned(TABLE_SIZE as u64) {
            log::error!("table pool at {} is not aligned to {:#x}", phys_base, TABLE_SIZE);
            return Err(TableError::Misaligned { address: phys_base });
        }

        let capacity = backing.nodes().len();
        let end = phys_base.as_u64() + (capacity * TABLE_SIZE) as u64;
        if PhysicalAddress::try_new(end).is_none() {
            return Err(TableError::Misaligned { address: phys_base });
        }

        Ok(Self {
            backing,
            phys_base,
            used: vec![0; capacity.div_ceil(64)],
            free: capacity,
        })
    }

    /// Returns the total number of nodes in the pool.
    pub fn capacity(&self) -> usize {
        self.backing.nodes().len()
    }

    /// Returns the number of nodes available for allocation.
    pub fn free_count(&self) -> usize {
        self.free
    }

    /// Returns the number of nodes currently handed out.
    pub fn used_count(&self) -> usize {
        self.capacity() - self.free
    }

    /// Returns the physical address of the first node.
    pub fn phys_base(&self) -> PhysicalAddress {
        self.phys_base
    }

    /// Returns whether `phys` is an allocated node of this pool.
    pub fn contains(&self, phys: PhysicalAddress) -> bool {
        self.index_of(phys).is_some()
    }

    fn is_used(&self, index: usize) -> bool {
        self.used[index / 64] & (1 << (index % 64)) != 0
    }

    fn set_used(&mut self, index: usize, used: bool) {
        if used {
            self.used[index / 64] |= 1 << (index % 64);
        } else {
            self.used[index / 64] &= !(1 << (index % 64));
        }
    }

    fn index_of(&self, phys: PhysicalAddress) -> Option<usize> {
        let offset = phys.as_u64().checked_sub(self.phys_base.as_u64())?;
        if offset % TABLE_SIZE as u64 != 0 {
            return None;
        }
        let index = usize::try_from(offset >> TABLE_SIZE_LOG2).ok()?;
        (index < self.capacity() && self.is_used(index)).then_some(index)
    }

    fn phys_of(&self, index: usize) -> PhysicalAddress {
        self.phys_base + (index * TABLE_SIZE) as u64
    }

    /// Allocates a zeroed node and returns its physical address.
    pub fn construct(&mut self) -> Result<PhysicalAddress, TableError> {
        let index = self
            .used
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(word, bits)| word * 64 + bits.trailing_ones() as usize)
            .filter(|index| *index < self.capacity())
            .ok_or(TableError::OutOfMemory)?;

        self.set_used(index, true);
        self.free -= 1;
        self.backing.nodes_mut()[index].clear();

        let phys = self.phys_of(index);
        log::trace!("allocated table {} ({} free)", phys, self.free);
        Ok(phys)
    }

    /// Clears the node at `phys` and returns it to the pool.
    ///
    /// Releasing an address that is not an allocated node of this pool is logged and
    /// otherwise ignored.
    pub fn destruct(&mut self, phys: PhysicalAddress) {
        let Some(index) = self.index_of(phys) else {
            log::error!("attempt to release unknown table {}", phys);
            return;
        };

        self.backing.nodes_mut()[index].clear();
        self.set_used(index, false);
        self.free += 1;
        log::trace!("released table {} ({} free)", phys, self.free);
    }

    /// Resolves `phys` to a mutable view and calls `found`, or calls `not_found` if
    /// `phys` is not an allocated node of this pool.
    pub fn with_table<T, R>(
        &mut self,
        phys: PhysicalAddress,
        found: impl FnOnce(&mut T) -> R,
        not_found: impl FnOnce() -> R,
    ) -> R
    where
        T: TableView,
    {
        match self.index_of(phys) {
            Some(index) => found(T::from_node_mut(&mut self.backing.nodes_mut()[index])),
            None => not_found(),
        }
    }

    /// Read-only variant of [`with_table`](Self::with_table).
    pub fn inspect_table<T, R>(
        &self,
        phys: PhysicalAddress,
        found: impl FnOnce(&T) -> R,
        not_found: impl FnOnce() -> R,
    ) -> R
    where
        T: TableView,
    {
        match self.index_of(phys) {
            Some(index) => found(T::from_node(&self.backing.nodes()[index])),
            None => not_found(),
        }
    }

    /// Returns the local address at which the node `phys` can be accessed.
    pub fn local_address(&self, phys: PhysicalAddress) -> Option<usize> {
        self.index_of(phys)
            .map(|index| &self.backing.nodes()[index] as *const TableNode as usize)
    }

    /// Returns the physical address of a node that lives in this pool.
    pub fn physical_address(&self, node: &TableNode) -> Option<PhysicalAddress> {
        let base = self.backing.nodes().as_ptr() as usize;
        let offset = (node as *const TableNode as usize).checked_sub(base)?;
        let index = offset / TABLE_SIZE;
        (index < self.capacity() && self.is_used(index)).then(|| self.phys_of(index))
    }
}

impl Default for TableAllocator {
    /// An empty pool that cannot hand out any node.
    fn default() -> Self {
        Self {
            backing: Backing::Owned(Box::new([])),
            phys_base: PhysicalAddress::zero(),
            used: Vec::new(),
            free: 0,
        }
    }
}

impl core::fmt::Debug for TableAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TableAllocator")
            .field("phys_base", &self.phys_base)
            .field("capacity", &self.capacity())
            .field("free", &self.free)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: PhysicalAddress = PhysicalAddress::new(0x10_0000);

    #[repr(transparent)]
    struct Marker(TableNode);

    // SAFETY: repr(transparent) over TableNode.
    unsafe impl TableView for Marker {}

    impl Marker {
        fn mark(&mut self, value: u64) {
            self.0.set_entry(0, value);
        }
    }

    #[test]
    fn construct_hands_out_consecutive_nodes() {
        let mut alloc = TableAllocator::new(BASE, 4).unwrap();
        assert_eq!(alloc.capacity(), 4);
        assert_eq!(alloc.construct(), Ok(BASE));
        assert_eq!(alloc.construct(), Ok(BASE + 0x1000));
        assert_eq!(alloc.free_count(), 2);
        assert_eq!(alloc.used_count(), 2);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut alloc = TableAllocator::new(BASE, 2).unwrap();
        alloc.construct().unwrap();
        alloc.construct().unwrap();
        assert_eq!(alloc.construct(), Err(TableError::OutOfMemory));
    }

    #[test]
    fn capacity_beyond_one_bitmap_word() {
        let mut alloc = TableAllocator::new(BASE, 70).unwrap();
        for _ in 0..70 {
            alloc.construct().unwrap();
        }
        assert_eq!(alloc.construct(), Err(TableError::OutOfMemory));

        alloc.destruct(BASE + 65 * 0x1000);
        assert_eq!(alloc.construct(), Ok(BASE + 65 * 0x1000));
    }

    #[test]
    fn misaligned_base_is_rejected() {
        let base = PhysicalAddress::new(0x10_0800);
        assert_eq!(
            TableAllocator::new(base, 1).unwrap_err(),
            TableError::Misaligned { address: base }
        );
    }

    #[test]
    fn destruct_recycles_and_zeroes() {
        let mut alloc = TableAllocator::new(BASE, 1).unwrap();
        let phys = alloc.construct().unwrap();
        alloc.with_table(phys, |t: &mut Marker| t.mark(0xdead), || panic!("missing"));

        alloc.destruct(phys);
        assert_eq!(alloc.free_count(), 1);
        assert!(!alloc.contains(phys));

        let again = alloc.construct().unwrap();
        assert_eq!(again, phys);
        let first = alloc.inspect_table(again, |t: &TableNode| t.entry(0), || u64::MAX);
        assert_eq!(first, 0);
    }

    #[test]
    fn destruct_of_unknown_table_is_ignored() {
        let mut alloc = TableAllocator::new(BASE, 2).unwrap();
        alloc.construct().unwrap();
        alloc.destruct(BASE + 0x1000);
        alloc.destruct(PhysicalAddress::new(0x1000));
        assert_eq!(alloc.free_count(), 1);
    }

    #[test]
    fn with_table_resolves_only_allocated_nodes() {
        let mut alloc = TableAllocator::new(BASE, 2).unwrap();
        let phys = alloc.construct().unwrap();

        assert!(alloc.with_table(phys, |_: &mut TableNode| true, || false));
        assert!(!alloc.with_table(BASE + 0x1000, |_: &mut TableNode| true, || false));
        assert!(!alloc.with_table(BASE + 0x800, |_: &mut TableNode| true, || false));
    }

    #[test]
    fn local_and_physical_addresses_agree() {
        let mut alloc = TableAllocator::new(BASE, 3).unwrap();
        alloc.construct().unwrap();
        let phys = alloc.construct().unwrap();

        let local = alloc.local_address(phys).unwrap();
        assert_eq!(local % TABLE_SIZE, 0);

        let found = alloc.inspect_table(phys, |t: &TableNode| alloc.physical_address(t), || None);
        assert_eq!(found, Some(phys));
        assert_eq!(alloc.local_address(BASE + 0x2000), None);
    }

    #[test]
    fn default_pool_is_empty() {
        let mut alloc = TableAllocator::default();
        assert_eq!(alloc.capacity(), 0);
        assert_eq!(alloc.construct(), Err(TableError::OutOfMemory));
    }

    #[test]
    fn borrowed_region_is_cleared() {
        let region = Box::leak(vec![TableNode::zeroed(); 2].into_boxed_slice());
        region[1].set_entry(3, 7);

        // SAFETY: the leaked region lives forever and is used only by this pool.
        let mut alloc = unsafe { TableAllocator::from_region(region, BASE) }.unwrap();
        alloc.construct().unwrap();
        let phys = alloc.construct().unwrap();
        let entry = alloc.inspect_table(phys, |t: &TableNode| t.entry(3), || u64::MAX);
        assert_eq!(entry, 0);
    }
}
