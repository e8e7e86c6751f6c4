//! Umbra on-disk index layer: a paged B+ tree that bit-packs sorted key
//! arrays with prefix sharing to fit more entries per fixed-size page.
//!
//! The crate covers the structural tree engine (unique and non-unique
//! variants), the prefix-sharing codec, the clean/dirty page buffer
//! manager, ordered leaf iteration, and the object position index built
//! on top. Raw page I/O stays behind the [`store::PageStore`] trait.

#![warn(missing_docs)]

pub mod error;
pub mod index;
pub mod store;
pub mod types;
