/*!
This crate contains memscope's windows introspection layer.

Given a physical memory image of a running Windows system and the
directory table base of the SYSTEM process, it reconstructs the process
list, per-process module/heap/thread/handle/unloaded-module maps, the
PE export and import tables of individual modules, the physical memory
map and the user account map.

All state lives on an explicit [`Vmm`](vmm::Vmm) context value; external
engines (PDB symbols, the registry, VAD/PTE map builders) are consumed
through the traits in [`providers`].
*/

pub mod error;

pub mod offsets;

pub mod providers;

pub mod win32;

pub mod vmm;

pub mod strmap;

mod cachemap;
mod listwalk;
mod read;
mod util;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
pub use read::VirtualReadData;
pub use vmm::{SystemInfo, Vmm, VmmBuilder};

pub mod prelude {
    pub mod v1 {
        pub use crate::error::*;
        pub use crate::offsets::*;
        pub use crate::providers::*;
        pub use crate::vmm::*;
        pub use crate::win32::*;
    }
    pub use v1::*;
}
