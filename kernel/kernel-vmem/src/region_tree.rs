//! # Region Tree
//!
//! The address-space map: an ordered binary tree of non-overlapping
//! [`MemoryRegion`]s, keyed by `virtual_start`. A region goes into the left
//! subtree when its start is less than or equal to the node's start,
//! otherwise into the right subtree; every lookup uses the identical
//! comparison. There is no rebalancing; the live region count stays small.
//!
//! Nodes live in an arena of slots addressed by stable [`RegionHandle`]s
//! with an explicit free-slot pool; parent/child links are handles, never
//! references, so structural surgery cannot dangle.
//!
//! ## Invariant
//!
//! At every instant the set of live regions is pairwise non-overlapping:
//! every address belongs to at most one region. [`insert`](RegionTree::insert)
//! restores this before attaching anything, by removing and trimming whatever
//! the incoming range displaces. Physical backing owned by displaced managed
//! regions is handed back to the caller, who holds the address-space lock
//! and returns it to the frame allocator.

use crate::region::MemoryRegion;
use alloc::vec::Vec;
use kernel_addresses::{PhysicalBlock, VirtualAddress};

/// Stable identifier of a live region inside the tree's arena.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RegionHandle(u32);

#[derive(Debug)]
struct Node {
    region: MemoryRegion,
    parent: Option<RegionHandle>,
    left: Option<RegionHandle>,
    right: Option<RegionHandle>,
}

/// One arena slot: a live node, or a link in the free-slot pool.
#[derive(Debug)]
enum Slot {
    Used(Node),
    Free(Option<RegionHandle>),
}

/// The ordered, non-overlapping set of memory regions of one address space.
#[derive(Debug, Default)]
pub struct RegionTree {
    slots: Vec<Slot>,
    root: Option<RegionHandle>,
    free: Option<RegionHandle>,
    len: usize,
}

impl RegionTree {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            root: None,
            free: None,
            len: 0,
        }
    }

    /// Number of live regions.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the region behind `handle`.
    ///
    /// # Panics
    /// When `handle` does not refer to a live region (stale handle).
    #[must_use]
    pub fn region(&self, handle: RegionHandle) -> &MemoryRegion {
        &self.node(handle).region
    }

    /// Mutably borrow the region behind `handle`.
    ///
    /// The caller must not change `virtual_start`/`virtual_end` through this
    /// (that would bypass the ordering and non-overlap maintenance).
    #[must_use]
    pub fn region_mut(&mut self, handle: RegionHandle) -> &mut MemoryRegion {
        &mut self.node_mut(handle).region
    }

    /// Insert `region`, restoring the non-overlap invariant first.
    ///
    /// In order, against the current tree state:
    /// 1. every region fully contained in the incoming range is removed;
    /// 2. the (at most one) region straddling the range start is shrunk to
    ///    end there; if it originally extended beyond the range end, the
    ///    part past the end survives as a remnant region;
    /// 3. otherwise, a region straddling the range end has its start
    ///    trimmed up to it;
    /// 4. the new region is attached with the ordered-insertion rule.
    ///
    /// Returns the physical blocks released by destroyed or trimmed managed
    /// regions; the caller returns them to the frame allocator.
    pub fn insert(&mut self, region: MemoryRegion) -> Vec<PhysicalBlock> {
        let mut released = Vec::new();
        if region.is_empty() {
            return released;
        }
        let (start, end) = (region.virtual_start, region.virtual_end);

        // 1: drop fully swallowed regions.
        for handle in self.find_contained(start, end) {
            let old = self.remove(handle);
            released.extend(old.into_backing());
        }

        // 2: the region straddling `start`, if any.
        if let Some(handle) = self.find(start) {
            let straddler_end = self.node(handle).region.virtual_end;
            if straddler_end > end {
                // The incoming range punches a hole in the middle: detach,
                // split the surviving tail off, release the overlap, and
                // re-attach what is left.
                let mut old = self.remove(handle);
                let tail = old.split_tail(end);
                released.extend(old.trim_end(start));
                if !old.is_empty() {
                    self.attach(old);
                }
                self.attach(tail);
            } else {
                released.extend(self.node_mut(handle).region.trim_end(start));
                if self.node(handle).region.is_empty() {
                    let _ = self.remove(handle);
                }
                // 3: the region straddling `end`, if any.
                if let Some(handle) = self.find(end) {
                    released.extend(self.node_mut(handle).region.trim_start(end));
                }
            }
        } else if let Some(handle) = self.find(end) {
            // No straddler at the start; there may still be one at the end.
            released.extend(self.node_mut(handle).region.trim_start(end));
        }

        // 4: attach.
        self.attach(region);
        released
    }

    /// Detach and return the region behind `handle`.
    ///
    /// Standard binary-search-tree deletion: a node with at most one child
    /// is spliced out; a node with two children is replaced by its in-order
    /// successor. All parent links stay consistent. The region's backing is
    /// returned untouched inside the region; releasing it is the caller's
    /// decision.
    pub fn remove(&mut self, handle: RegionHandle) -> MemoryRegion {
        let node = self.node(handle);
        let (parent, left, right) = (node.parent, node.left, node.right);

        let replacement = match (left, right) {
            (None, None) => None,
            (Some(child), None) | (None, Some(child)) => Some(child),
            (Some(left), Some(right)) => {
                let succ = self.subtree_min(right);
                if succ != right {
                    // Detach the successor from its parent, handing its
                    // right child up, then give it the removed node's right
                    // subtree.
                    let succ_right = self.node(succ).right;
                    let succ_parent = self.node(succ).parent;
                    self.relink_child(succ_parent, succ, succ_right);
                    self.node_mut(succ).right = Some(right);
                    self.node_mut(right).parent = Some(succ);
                }
                self.node_mut(succ).left = Some(left);
                self.node_mut(left).parent = Some(succ);
                Some(succ)
            }
        };

        self.relink_child(parent, handle, replacement);
        self.len -= 1;
        self.release_slot(handle)
    }

    /// The unique region containing `addr`, or `None`.
    #[must_use]
    pub fn find(&self, addr: VirtualAddress) -> Option<RegionHandle> {
        let mut current = self.root;
        while let Some(handle) = current {
            let node = self.node(handle);
            if node.region.contains(addr) {
                return Some(handle);
            }
            current = if addr < node.region.virtual_start {
                node.left
            } else {
                node.right
            };
        }
        None
    }

    /// The region with exactly the bounds `[start, end)`, or `None`.
    #[must_use]
    pub fn find_exact(&self, start: VirtualAddress, end: VirtualAddress) -> Option<RegionHandle> {
        let mut current = self.root;
        while let Some(handle) = current {
            let region = &self.node(handle).region;
            if region.virtual_start == start && region.virtual_end == end {
                return Some(handle);
            }
            current = if start <= region.virtual_start {
                self.node(handle).left
            } else {
                self.node(handle).right
            };
        }
        None
    }

    /// Every region fully inside `[start, end)`, in address order.
    #[must_use]
    pub fn find_contained(&self, start: VirtualAddress, end: VirtualAddress) -> Vec<RegionHandle> {
        let mut out = Vec::new();
        self.collect_contained(self.root, start, end, &mut out);
        out
    }

    /// Remove every trace of `[start, end)` from the map.
    ///
    /// Expressed through the insertion machinery: a zero-permission
    /// placeholder covering the range is inserted (which removes, trims and
    /// splits whatever overlaps) and then removed again. Returns the
    /// physical blocks released by displaced managed regions.
    pub fn unmap(&mut self, start: VirtualAddress, end: VirtualAddress) -> Vec<PhysicalBlock> {
        if start >= end {
            return Vec::new();
        }
        let released = self.insert(MemoryRegion::placeholder(start, end));
        let placeholder = self
            .find_exact(start, end)
            .expect("placeholder vanished between insert and remove");
        let _ = self.remove(placeholder);
        released
    }

    /// All live regions in address order (mainly for inspection and tests).
    #[must_use]
    pub fn in_order(&self) -> Vec<RegionHandle> {
        let mut out = Vec::with_capacity(self.len);
        self.collect_in_order(self.root, &mut out);
        out
    }

    /// Attach a region at its ordered position. The range must not overlap
    /// any live region.
    fn attach(&mut self, region: MemoryRegion) -> RegionHandle {
        debug_assert!(!region.is_empty());
        let start = region.virtual_start;
        let handle = self.claim_slot(region);

        let Some(mut current) = self.root else {
            self.root = Some(handle);
            return handle;
        };
        loop {
            let node = self.node(current);
            if start <= node.region.virtual_start {
                match node.left {
                    Some(left) => current = left,
                    None => {
                        self.node_mut(current).left = Some(handle);
                        break;
                    }
                }
            } else {
                match node.right {
                    Some(right) => current = right,
                    None => {
                        self.node_mut(current).right = Some(handle);
                        break;
                    }
                }
            }
        }
        self.node_mut(handle).parent = Some(current);
        handle
    }

    fn collect_contained(
        &self,
        node: Option<RegionHandle>,
        start: VirtualAddress,
        end: VirtualAddress,
        out: &mut Vec<RegionHandle>,
    ) {
        let Some(handle) = node else { return };
        let node = self.node(handle);
        let region = &node.region;
        if start <= region.virtual_start && region.virtual_end <= end {
            self.collect_contained(node.left, start, end, out);
            out.push(handle);
            self.collect_contained(node.right, start, end, out);
        } else if region.virtual_start < start {
            // Everything to the left starts even earlier and cannot be
            // contained; regions at or past `start` sit to the right.
            self.collect_contained(node.right, start, end, out);
        } else {
            // This node starts inside or past the range but is not
            // contained; anything further right would overlap or lie
            // beyond `end`.
            self.collect_contained(node.left, start, end, out);
        }
    }

    fn collect_in_order(&self, node: Option<RegionHandle>, out: &mut Vec<RegionHandle>) {
        let Some(handle) = node else { return };
        let node = self.node(handle);
        self.collect_in_order(node.left, out);
        out.push(handle);
        self.collect_in_order(node.right, out);
    }

    /// Smallest-start node of the subtree rooted at `handle`.
    fn subtree_min(&self, handle: RegionHandle) -> RegionHandle {
        let mut current = handle;
        while let Some(left) = self.node(current).left {
            current = left;
        }
        current
    }

    /// Point `parent`'s link to `old` at `new` instead (or the root when
    /// there is no parent), fixing `new`'s parent link.
    fn relink_child(
        &mut self,
        parent: Option<RegionHandle>,
        old: RegionHandle,
        new: Option<RegionHandle>,
    ) {
        match parent {
            None => self.root = new,
            Some(parent) => {
                let node = self.node_mut(parent);
                if node.left == Some(old) {
                    node.left = new;
                } else {
                    debug_assert_eq!(node.right, Some(old));
                    node.right = new;
                }
            }
        }
        if let Some(new) = new {
            self.node_mut(new).parent = parent;
        }
    }

    fn claim_slot(&mut self, region: MemoryRegion) -> RegionHandle {
        self.len += 1;
        let node = Node {
            region,
            parent: None,
            left: None,
            right: None,
        };
        match self.free {
            Some(handle) => {
                let next = match &self.slots[handle.0 as usize] {
                    Slot::Free(next) => *next,
                    Slot::Used(_) => unreachable!("free pool points at a live slot"),
                };
                self.free = next;
                self.slots[handle.0 as usize] = Slot::Used(node);
                handle
            }
            None => {
                let handle = RegionHandle(u32::try_from(self.slots.len()).expect("arena overflow"));
                self.slots.push(Slot::Used(node));
                handle
            }
        }
    }

    fn release_slot(&mut self, handle: RegionHandle) -> MemoryRegion {
        let slot = core::mem::replace(
            &mut self.slots[handle.0 as usize],
            Slot::Free(self.free),
        );
        self.free = Some(handle);
        let Slot::Used(node) = slot else {
            unreachable!("released a slot that was already free");
        };
        node.region
    }

    fn node(&self, handle: RegionHandle) -> &Node {
        match &self.slots[handle.0 as usize] {
            Slot::Used(node) => node,
            Slot::Free(_) => panic!("stale region handle"),
        }
    }

    fn node_mut(&mut self, handle: RegionHandle) -> &mut Node {
        match &mut self.slots[handle.0 as usize] {
            Slot::Used(node) => node,
            Slot::Free(_) => panic!("stale region handle"),
        }
    }
}
