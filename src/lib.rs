//! mulch - a paged, self-describing object runtime
//!
//! Typed instances live in page-granular blocks placed at random bases of a
//! synthetic address space; a radix index resolves any handle back to its
//! page. Types are ordinary instances of the root type and carry byte-exact
//! layout tables, so every byte of every object can be asked for its type,
//! its enclosing object and its field flags. Reclamation combines reference
//! cells (pinning, dependent ownership, weak references) with a two-pass
//! page sweep.
//!
//! Entry point: [`Runtime::setup`]. The bootstrap builds the built-in types
//! out of the allocator's own page memory and hands back their handles as
//! `runtime.boot`.

mod boot;
mod dict;
mod error;
mod gc;
mod index;
mod obj;
mod page;
mod refc;
mod reflect;
mod runtime;
mod types;

pub use error::{AllocError, AllocResult};
pub use index::{AddressIndex, PageId};
pub use obj::{Obj, PAGE_SIZE, WORD};
pub use reflect::ObjInfo;
pub use runtime::{Boot, PageDesc, Runtime};
pub use types::{FieldFlags, FieldSlot, PageFlags, TypeFlags, TypeHandle};

#[cfg(test)]
mod tests;
