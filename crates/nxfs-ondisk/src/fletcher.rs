use nxfs_types::{read_le_u64, ParseError, MAX_CKSUM_SIZE};

/// Compute the Fletcher-64 digest used by the container format.
///
/// The input is the block with its leading 8-byte digest field excluded;
/// its length must be a multiple of 4 (always true for power-of-two block
/// sizes minus the digest).
pub fn fletcher64(buffer: &[u8]) -> Result<u64, ParseError> {
    if buffer.len() % 4 != 0 {
        return Err(ParseError::InvalidField {
            field: "checksum_region",
            reason: "length must be a multiple of 4",
        });
    }

    let mut lower: u64 = 0;
    let mut upper: u64 = 0;

    for word in buffer.chunks_exact(4) {
        let value = u64::from(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
        lower += value;
        upper += lower;
    }
    lower %= 0xffff_ffff;
    upper %= 0xffff_ffff;

    // The stored digest is constructed so that checksumming the whole
    // block (digest included) yields zero.
    let check_low = 0xffff_ffff - ((lower + upper) % 0xffff_ffff);
    let check_high = 0xffff_ffff - ((lower + check_low) % 0xffff_ffff);

    Ok((check_high << 32) | check_low)
}

/// Verify the digest stored in a block's first 8 bytes against the rest
/// of the block. Fails closed: any mismatch or undersized block is `false`.
#[must_use]
pub fn verify_block(block: &[u8]) -> bool {
    if block.len() <= MAX_CKSUM_SIZE {
        return false;
    }
    let Ok(stored) = read_le_u64(block, 0) else {
        return false;
    };
    match fletcher64(&block[MAX_CKSUM_SIZE..]) {
        Ok(computed) => computed == stored,
        Err(_) => false,
    }
}

/// Stamp a block's digest field. Used by image builders and tests; the
/// read path never writes.
pub fn seal_block(block: &mut [u8]) -> Result<(), ParseError> {
    if block.len() <= MAX_CKSUM_SIZE {
        return Err(ParseError::InsufficientData {
            needed: MAX_CKSUM_SIZE + 4,
            offset: 0,
            actual: block.len(),
        });
    }
    let digest = fletcher64(&block[MAX_CKSUM_SIZE..])?;
    block[..MAX_CKSUM_SIZE].copy_from_slice(&digest.to_le_bytes());
    Ok(())
}
