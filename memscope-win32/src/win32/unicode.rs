/*!
Reading of guest `UNICODE_STRING` structures (32- and 64-bit layouts).
*/

use crate::util::va;
use crate::vmm::Vmm;
use crate::win32::process::Win32Process;

use memscope_core::mem::{PhysicalMemory, ReadFlags};
use memscope_core::types::Address;

use widestring::U16Str;

/// Converts a UTF-16LE byte buffer to a string, stopping at the first
/// NUL terminator.
pub(crate) fn utf16_bytes_to_string(pb: &[u8]) -> String {
    let units: Vec<u16> = pb
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    U16Str::from_slice(&units).to_string_lossy()
}

/// Reads a raw UTF-16 buffer of `cb` bytes at `va`.
pub(crate) fn read_wstr<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    va: Address,
    cb: usize,
    flags: ReadFlags,
) -> Option<String> {
    if va.is_null() || cb < 2 {
        return None;
    }
    let cb = cb & !1;
    let mut pb = vec![0u8; cb];
    if vmm.read_ex(proc, va, &mut pb, flags) != cb {
        return None;
    }
    Some(utf16_bytes_to_string(&pb))
}

/// Reads a `UNICODE_STRING` at `va` and its backing buffer.
///
/// The length must be even, nonzero, within `cb_max` and consistent
/// with the maximum length; the buffer pointer must be a valid address
/// for the given bitness.
pub(crate) fn read_unicode_string<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    f32: bool,
    va: Address,
    cb_max: usize,
    flags: ReadFlags,
) -> Option<String> {
    let mut hdr = [0u8; 16];
    let cb_hdr = if f32 { 8 } else { 16 };
    if vmm.read_ex(proc, va, &mut hdr[..cb_hdr], flags) != cb_hdr {
        return None;
    }
    let length = va::w(&hdr, 0) as usize;
    let maximum_length = va::w(&hdr, 2) as usize;
    let buffer = if f32 {
        u64::from(va::dw(&hdr, 4))
    } else {
        va::qw(&hdr, 8)
    };

    if length == 0 || length & 1 != 0 || length > cb_max {
        return None;
    }
    if maximum_length != 0 && length > maximum_length {
        return None;
    }
    if buffer == 0 {
        return None;
    }

    read_wstr(vmm, proc, Address::from(buffer), length, flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf16_conversion() {
        let mut pb = Vec::new();
        for u in "smss.exe".encode_utf16() {
            pb.extend_from_slice(&u.to_le_bytes());
        }
        pb.extend_from_slice(&[0, 0, b'x', 0]);
        assert_eq!(utf16_bytes_to_string(&pb), "smss.exe");
    }
}
