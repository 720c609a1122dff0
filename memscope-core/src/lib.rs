/*!
Core components of the memscope physical memory forensics framework.

This crate contains the memory-access substrate the higher introspection
layers are built on: address and size types, the [`PhysicalMemory`] trait
with scatter semantics, the epoch-tagged physical page cache and the
x86/x64 address translation used to resolve guest virtual addresses.

The actual interpretation of guest memory (processes, modules, handles,
...) lives in the OS-specific crates built on top of this one.
*/

pub mod arch;
pub mod error;
pub mod mem;
pub mod types;

pub use error::{Error, Result};

pub use arch::{Architecture, Translator};
pub use mem::{PageCache, PhysicalMemory, PhysicalReadData, ReadFlags};
pub use types::Address;

// required to expose the Pod trait to structs defined by downstream crates
pub use dataview;
