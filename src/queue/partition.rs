//! Deterministic revalidation partitioning.
//!
//! A path is hashed with cyrb128, the 32-bit seed is avalanched once with
//! mulberry32, and the resulting fraction picks one of `max_concurrency`
//! groups. The construction is fixed so group keys agree across processes
//! and with peers that share the queue.

const GROUP_PREFIX: &str = "revalidate-";

/// `revalidate-<n>` with `n` in `0..max_concurrency`.
pub fn group_key(path: &str, max_concurrency: u32) -> String {
    format!("{GROUP_PREFIX}{}", group_index(path, max_concurrency))
}

pub fn group_index(path: &str, max_concurrency: u32) -> u32 {
    let sample = mulberry32(cyrb128(path));
    // floor(sample / 2^32 * max)
    ((u64::from(sample) * u64::from(max_concurrency.max(1))) >> 32) as u32
}

/// First 32-bit lane of cyrb128 over the UTF-16 code units of `input`.
fn cyrb128(input: &str) -> u32 {
    let mut h1: u32 = 1_779_033_703;
    let mut h2: u32 = 3_144_134_277;
    let mut h3: u32 = 1_013_904_242;
    let mut h4: u32 = 2_773_480_762;

    for unit in input.encode_utf16() {
        let k = u32::from(unit);
        h1 = h2 ^ (h1 ^ k).wrapping_mul(597_399_067);
        h2 = h3 ^ (h2 ^ k).wrapping_mul(2_869_860_233);
        h3 = h4 ^ (h3 ^ k).wrapping_mul(951_274_213);
        h4 = h1 ^ (h4 ^ k).wrapping_mul(2_716_044_179);
    }

    h1 = (h3 ^ (h1 >> 18)).wrapping_mul(597_399_067);
    h2 = (h4 ^ (h2 >> 22)).wrapping_mul(2_869_860_233);
    h3 = (h1 ^ (h3 >> 17)).wrapping_mul(951_274_213);
    h4 = (h2 ^ (h4 >> 19)).wrapping_mul(2_716_044_179);
    h1 ^ h2 ^ h3 ^ h4
}

/// One mulberry32 step seeded with `seed`.
fn mulberry32(seed: u32) -> u32 {
    let mut t = seed.wrapping_add(0x6d2b_79f5);
    t = (t ^ (t >> 15)).wrapping_mul(t | 1);
    t ^= t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61));
    t ^ (t >> 14)
}
