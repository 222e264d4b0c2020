//! Internet checksum arithmetic.
//!
//! Full computation for IPv4 headers and TCP/UDP segments, plus the
//! incremental pieces the rewriter uses on the hot path: a per-flow delta
//! accumulated once from the old and new header words, and a single
//! add-with-carry that applies that delta (or its negation) to a checksum
//! field.

/// Folds a 32-bit sum into a 16-bit checksum.
#[inline(always)]
#[must_use]
pub fn checksum_fold(sum: u32) -> u16 {
    !fold_carries(sum)
}

/// Folds the carries of a 32-bit sum back into the low 16 bits, without
/// complementing.
///
/// A non-zero input always folds to a value in `1..=0xFFFF`.
#[inline(always)]
#[must_use]
pub fn fold_carries(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    // The loop leaves at most 16 significant bits.
    #[allow(clippy::cast_possible_truncation)]
    let folded = sum as u16;
    folded
}

/// Calculates the ones' complement sum of 16-bit words.
///
/// This is the core operation for IP/TCP/UDP checksums.
#[inline]
#[must_use]
pub fn checksum_add(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }

    // Odd trailing byte is padded with zero
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }

    sum
}

/// Calculates Internet checksum over data.
#[inline]
#[must_use]
pub fn checksum(data: &[u8]) -> u16 {
    checksum_fold(checksum_add(data))
}

/// Folds the change of one 16-bit word into a running delta.
///
/// Starting from `0` and accumulating every changed word yields the ones'
/// complement sum of `new - old` over all words. Adding that delta to
/// `~C` gives `~C'` directly.
#[inline(always)]
#[must_use]
pub fn accumulate_delta(delta: u16, old_value: u16, new_value: u16) -> u16 {
    fold_carries(u32::from(delta) + u32::from(!old_value) + u32::from(new_value))
}

/// Applies a precomputed delta to a checksum field.
///
/// With `subtract` false the delta is added; with `subtract` true its ones'
/// complement negation is added, undoing the same change. Applying both to a
/// checksum returns it to its original value.
#[inline(always)]
#[must_use]
pub fn apply_delta(checksum: u16, delta: u16, subtract: bool) -> u16 {
    let delta = if subtract { !delta } else { delta };
    !fold_carries(u32::from(!checksum) + u32::from(delta))
}

/// Calculates IPv4 header checksum.
///
/// The header checksum covers only the IP header (not payload).
/// Assumes checksum field is zeroed before calculation.
#[inline]
#[must_use]
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    debug_assert!(header.len() >= 20, "IPv4 header too short");
    checksum(header)
}

/// Sums the IPv4 pseudo-header used by TCP and UDP.
fn pseudo_header_sum(src_ip: [u8; 4], dst_ip: [u8; 4], protocol: u8, len: usize) -> u32 {
    let mut sum = checksum_add(&src_ip);
    sum = sum.wrapping_add(checksum_add(&dst_ip));
    sum = sum.wrapping_add(u32::from(protocol));
    // Segment lengths are bounded by the 16-bit IPv4 total length.
    #[allow(clippy::cast_possible_truncation)]
    let len = len as u32;
    sum.wrapping_add(len)
}

/// Calculates TCP checksum including pseudo-header.
///
/// TCP checksum covers: pseudo-header + TCP header + data. The checksum
/// field inside `tcp_segment` must be zeroed.
#[inline]
#[must_use]
pub fn tcp_checksum(src_ip: [u8; 4], dst_ip: [u8; 4], tcp_segment: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src_ip, dst_ip, 6, tcp_segment.len());
    checksum_fold(sum.wrapping_add(checksum_add(tcp_segment)))
}

/// Calculates UDP checksum including pseudo-header.
///
/// UDP checksum covers: pseudo-header + UDP header + data. The checksum
/// field inside `udp_datagram` must be zeroed.
#[inline]
#[must_use]
pub fn udp_checksum(src_ip: [u8; 4], dst_ip: [u8; 4], udp_datagram: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src_ip, dst_ip, 17, udp_datagram.len());
    let result = checksum_fold(sum.wrapping_add(checksum_add(udp_datagram)));
    // UDP uses 0xFFFF for zero checksum
    if result == 0 {
        0xFFFF
    } else {
        result
    }
}
