pub mod maps;
pub mod process;

pub use maps::*;
pub use process::*;

pub(crate) mod defs;

pub mod handle;
pub mod heap;
pub mod module;
pub mod objects;
pub mod pe;
pub mod physmem;
pub mod proc_enum;
pub mod ptemap;
pub mod thread;
pub mod unicode;
pub mod unloaded;
pub mod user;
