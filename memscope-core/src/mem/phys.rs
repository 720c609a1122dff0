use crate::error::{Error, Result};
use crate::types::Address;

use dataview::Pod;

/// A single element of a scatter read.
///
/// Backends fill `out` and set `ok` to indicate whether the element was
/// read in full. Modeled after the scatter entries used by physical
/// memory acquisition devices where each element carries its own
/// completion flag.
pub struct PhysicalReadData<'a> {
    pub addr: Address,
    pub out: &'a mut [u8],
    pub ok: bool,
}

impl<'a> PhysicalReadData<'a> {
    pub fn new(addr: Address, out: &'a mut [u8]) -> Self {
        Self {
            addr,
            out,
            ok: false,
        }
    }
}

/// The `PhysicalMemory` trait is implemented by memory backends
/// and provides a generic way to read physical memory.
///
/// Reads are best-effort: an element that cannot be satisfied is flagged
/// instead of failing the whole batch, since sparse and partially
/// acquired memory images are the norm rather than the exception.
///
/// # Examples
///
/// Implementing `PhysicalMemory` for a flat memory buffer:
/// ```
/// use memscope_core::mem::{PhysicalMemory, PhysicalReadData};
/// use memscope_core::Result;
///
/// pub struct MemoryBackend {
///     mem: Box<[u8]>,
/// }
///
/// impl PhysicalMemory for MemoryBackend {
///     fn phys_read_raw_list(&mut self, data: &mut [PhysicalReadData]) -> Result<()> {
///         for read in data.iter_mut() {
///             let ofs = read.addr.as_usize();
///             if let Some(src) = self.mem.get(ofs..ofs + read.out.len()) {
///                 read.out.copy_from_slice(src);
///                 read.ok = true;
///             }
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait PhysicalMemory
where
    Self: Send,
{
    fn phys_read_raw_list(&mut self, data: &mut [PhysicalReadData]) -> Result<()>;

    // read helpers
    fn phys_read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        let mut data = [PhysicalReadData::new(addr, out)];
        self.phys_read_raw_list(&mut data)?;
        if data[0].ok {
            Ok(())
        } else {
            Err(Error::PhysicalMemory("unable to read physical memory"))
        }
    }

    fn phys_read_into<T: Pod + ?Sized>(&mut self, addr: Address, out: &mut T) -> Result<()>
    where
        Self: Sized,
    {
        self.phys_read_raw_into(addr, out.as_bytes_mut())
    }

    fn phys_read_raw(&mut self, addr: Address, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.phys_read_raw_into(addr, &mut *buf)?;
        Ok(buf)
    }

    fn phys_read<T: Pod + Sized>(&mut self, addr: Address) -> Result<T>
    where
        Self: Sized,
    {
        // zeroed memory is a valid bit pattern for any Pod type
        let mut obj: T = unsafe { std::mem::MaybeUninit::zeroed().assume_init() };
        self.phys_read_into(addr, &mut obj)?;
        Ok(obj)
    }
}

// forward impls
impl<T: PhysicalMemory + ?Sized, P: std::ops::DerefMut<Target = T> + Send> PhysicalMemory for P {
    fn phys_read_raw_list(&mut self, data: &mut [PhysicalReadData]) -> Result<()> {
        (**self).phys_read_raw_list(data)
    }
}
