//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! The allocation policy side of the memory subsystem, in three layers with
//! a strict dependency direction:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │           Page Table Manager ([`vmm`])              │
//! │    • Region tree + translation root, one lock       │
//! │    • Lazy mappings, fault resolution                │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Kernel Heap ([`free_list`])               │
//! │    • First-fit free list, deferred coalescing       │
//! │    • Backs every dynamic allocation in the kernel   │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │      Physical Frame Allocator ([`frame_alloc`])     │
//! │    • One bit per 4 KiB frame, first-fit runs        │
//! │    • Scan hint, no wrap-around                      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The heap carves its backing out of the frame allocator; the page-table
//! manager consumes frames for page backing and intermediate tables, and
//! its region-tree nodes ride the heap through the global allocator. Each
//! layer is plain data wrapped in a `SpinMutex` by its owner; the
//! frame-allocator lock is the innermost lock in the system.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod frame_alloc;
pub mod free_list;
pub mod phys_mapper;
pub mod vmm;
