//! # Build-Time Kernel Configuration
//!
//! Compile-time constants describing the machine this kernel is built for:
//! the page granularity, the physical memory window handed to the frame
//! allocator, the initial heap size, and the number of harts brought online
//! by the boot path.
//!
//! None of these values are negotiated at runtime. Changing the memory map
//! means rebuilding the kernel.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod memory;

/// Number of hardware execution contexts (harts) the boot path starts.
pub const NUM_HARTS: usize = 4;
