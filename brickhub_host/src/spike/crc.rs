//! CRC-32 (IEEE, reflected) as the Spike Prime slot upload protocol uses
//! it: chunks are zero-padded to 4-byte alignment and the previous value
//! is carried forward as the seed, so the final value over a chunked
//! transfer equals the CRC of the whole padded payload.

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xedb8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static TABLE: [u32; 256] = build_table();

/// Raw CRC-32 accumulation with a carry-forward seed. Composable:
/// feeding a payload in any partition yields the same final value.
pub fn update(seed: u32, data: &[u8]) -> u32 {
    let mut crc = seed ^ 0xffff_ffff;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ byte as u32) & 0xff) as usize];
    }
    crc ^ 0xffff_ffff
}

/// CRC over one transfer chunk as the hub expects it: the chunk is
/// zero-padded to 4-byte alignment before accumulation. Chunk sizes
/// negotiated by the hub are 4-aligned, so padding only applies to
/// the final chunk.
pub fn crc(data: &[u8], seed: u32) -> u32 {
    let mut value = update(seed, data);
    let remainder = data.len() % 4;
    if remainder != 0 {
        let padding = [0u8; 4];
        value = update(value, &padding[..4 - remainder]);
    }
    value
}
