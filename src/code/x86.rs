//! This module encodes the near relative `call`/`jmp` instructions used to redirect call sites

/// Length of a near `call`/`jmp` with a 32-bit displacement
pub const REL32_LEN: usize = 5;

/// Displacement of a `REL32_LEN` instruction at `from` reaching `to`.
///
/// The displacement is relative to the end of the instruction. On 32-bit hosts the arithmetic wraps
/// like the processor's does, so every target is reachable. On 64-bit hosts `None` is returned
/// when the target is further than 2 GiB away.
pub fn displacement(from: usize, to: usize) -> Option<i32> {
    if usize::BITS <= 32 {
        Some(to.wrapping_sub(from).wrapping_sub(REL32_LEN) as u32 as i32)
    } else {
        let delta = to as i128 - from as i128 - REL32_LEN as i128;
        i32::try_from(delta).ok()
    }
}

/// Encodes `opcode` followed by the displacement from `from` to `to`, little-endian.
///
/// ```
/// use rtpatch::code::x86::rel32;
///
/// assert_eq!(rel32(0xE8, 0x2000, 0x5000), Some([0xE8, 0xFB, 0x2F, 0x00, 0x00]));
/// ```
pub fn rel32(opcode: u8, from: usize, to: usize) -> Option<[u8; REL32_LEN]> {
    let [a, b, c, d] = displacement(from, to)?.to_le_bytes();
    Some([opcode, a, b, c, d])
}
