//! # Kernel Physical Memory Management
//!
//! Everything between "firmware told us where RAM is" and "the kernel runs on
//! its own page tables with a working page allocator".
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ RegionTracker                                │  available / reserved ranges
//! └───────┬───────────────────────────┬──────────┘
//!         │ find_free + reserve       │ available − reserved
//! ┌───────▼──────────────┐    ┌───────▼──────────┐
//! │ BootstrapAllocator   ├───►│ BuddyAllocator   │  page metadata
//! └──────────────────────┘    └───────┬──────────┘
//!                                     │ FrameAlloc (page tables)
//!                             ┌───────▼──────────┐
//!                             │ KernelMap        │  direct map + image
//!                             └──────────────────┘
//! ```
//!
//! ## Boot order
//!
//! 1. Feed the firmware memory map into a [`RegionTracker`](region::RegionTracker)
//!    and reserve low memory, the kernel image and the boot information.
//! 2. Seed the [`BuddyAllocator`](buddy::BuddyAllocator) with metadata from the
//!    [`BootstrapAllocator`](bootmem::BootstrapAllocator), releasing only pages
//!    inside the boot stub's direct map.
//! 3. [`KernelMap::build`](kernel_map::KernelMap::build) with page tables from
//!    the buddy allocator, then activate it and drop the identity window.
//! 4. [`release_deferred`](buddy::BuddyAllocator::release_deferred) the rest.
//!
//! Every structure here is owned by the caller and passed explicitly; the
//! crate has no global state.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod bootmem;
pub mod buddy;
pub mod kernel_map;
pub mod phys_mapper;
pub mod region;
