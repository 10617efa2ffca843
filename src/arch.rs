use crate::result::*;

/// A checked cast from u64 to usize
///
/// We could use the `cast` crate,
/// (https://docs.rs/cast/0.2.3/cast/)
/// but this is the only one we really need.
pub fn usize<I: Into<u64>>(i: I) -> ArchiveResult<usize> {
    let i: u64 = i.into();
    usize::try_from(i).map_err(|_| ArchiveError::InsufficientAddressSpace)
}

/// The smaller of a u64 count and a buffer length, as a buffer length.
pub fn min_len(count: u64, len: usize) -> usize {
    match usize::try_from(count) {
        Ok(count) => count.min(len),
        Err(_) => len,
    }
}
