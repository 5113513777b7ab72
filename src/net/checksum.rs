/// RFC 1071 Internet checksum over `buffer`.
///
/// Sums big-endian 16-bit words, pads an odd trailing byte as the high byte
/// of a word, folds carries back into the low 16 bits and returns the
/// one's complement.
pub fn rfc1071_checksum(buffer: &[u8]) -> u16 {
    let mut words = buffer.chunks_exact(2);
    let mut sum: u64 = words
        .by_ref()
        .map(|w| u64::from(u16::from_be_bytes([w[0], w[1]])))
        .sum();

    if let [last] = words.remainder() {
        sum += u64::from(*last) << 8;
    }

    while (sum >> 16) > 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
