use bitflags::bitflags;

bitflags! {
    /// Flags altering the behavior of a virtual memory read.
    #[derive(Default)]
    pub struct ReadFlags: u32 {
        /// Zero-fill the parts of the destination buffer that could not
        /// be read instead of leaving them untouched.
        const ZEROPAD_ON_FAIL = 0b0001;
        /// Only serve the read from already cached pages. Pages that are
        /// not in the cache count as failed instead of triggering device
        /// access.
        const FORCECACHE_READ = 0b0010;
        /// Do not attempt to resolve paged-out memory.
        const NOPAGING = 0b0100;
    }
}
