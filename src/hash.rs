//! Stable hash mixing for bucket selection.
//!
//! This is Robert Jenkins' `rjenkins1` hash as used by Ceph's CRUSH
//! (`~/dev/ceph/src/crush/hash.c`), not the later `lookup3` hash. The mixing
//! function is fixed and published as test vectors so independent callers
//! reproduce the same selections bit-for-bit given the same inputs.

const CRUSH_HASH_SEED: u32 = 1315423911;

#[inline]
fn crush_hashmix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*b);
    *a = a.wrapping_sub(*c);
    *a ^= *c >> 13;

    *b = b.wrapping_sub(*c);
    *b = b.wrapping_sub(*a);
    *b ^= *a << 8;

    *c = c.wrapping_sub(*a);
    *c = c.wrapping_sub(*b);
    *c ^= *b >> 13;

    *a = a.wrapping_sub(*b);
    *a = a.wrapping_sub(*c);
    *a ^= *c >> 12;

    *b = b.wrapping_sub(*c);
    *b = b.wrapping_sub(*a);
    *b ^= *a << 16;

    *c = c.wrapping_sub(*a);
    *c = c.wrapping_sub(*b);
    *c ^= *b >> 5;

    *a = a.wrapping_sub(*b);
    *a = a.wrapping_sub(*c);
    *a ^= *c >> 3;

    *b = b.wrapping_sub(*c);
    *b = b.wrapping_sub(*a);
    *b ^= *a << 10;

    *c = c.wrapping_sub(*a);
    *c = c.wrapping_sub(*b);
    *c ^= *b >> 15;
}

/// Hash two 32-bit values using rjenkins1.
pub fn crush_hash32_2(mut a: u32, mut b: u32) -> u32 {
    let mut hash = CRUSH_HASH_SEED ^ a ^ b;
    let mut x = 231232;
    let mut y = 1232;

    crush_hashmix(&mut a, &mut b, &mut hash);
    crush_hashmix(&mut x, &mut a, &mut hash);
    crush_hashmix(&mut b, &mut y, &mut hash);

    hash
}

/// Hash three 32-bit values using rjenkins1.
pub fn crush_hash32_3(mut a: u32, mut b: u32, mut c: u32) -> u32 {
    let mut hash = CRUSH_HASH_SEED ^ a ^ b ^ c;
    let mut x = 231232;
    let mut y = 1232;

    crush_hashmix(&mut a, &mut b, &mut hash);
    crush_hashmix(&mut c, &mut x, &mut hash);
    crush_hashmix(&mut y, &mut a, &mut hash);
    crush_hashmix(&mut b, &mut x, &mut hash);
    crush_hashmix(&mut y, &mut c, &mut hash);

    hash
}

/// Hash four 32-bit values using rjenkins1.
pub fn crush_hash32_4(mut a: u32, mut b: u32, mut c: u32, mut d: u32) -> u32 {
    let mut hash = CRUSH_HASH_SEED ^ a ^ b ^ c ^ d;
    let mut x = 231232;
    let mut y = 1232;

    crush_hashmix(&mut a, &mut b, &mut hash);
    crush_hashmix(&mut c, &mut d, &mut hash);
    crush_hashmix(&mut a, &mut x, &mut hash);
    crush_hashmix(&mut y, &mut b, &mut hash);
    crush_hashmix(&mut c, &mut x, &mut hash);
    crush_hashmix(&mut y, &mut d, &mut hash);

    hash
}

/// Hash five 32-bit values using rjenkins1.
pub fn crush_hash32_5(mut a: u32, mut b: u32, mut c: u32, mut d: u32, mut e: u32) -> u32 {
    let mut hash = CRUSH_HASH_SEED ^ a ^ b ^ c ^ d ^ e;
    let mut x = 231232;
    let mut y = 1232;

    crush_hashmix(&mut a, &mut b, &mut hash);
    crush_hashmix(&mut c, &mut d, &mut hash);
    crush_hashmix(&mut e, &mut x, &mut hash);
    crush_hashmix(&mut y, &mut a, &mut hash);
    crush_hashmix(&mut b, &mut x, &mut hash);
    crush_hashmix(&mut y, &mut c, &mut hash);
    crush_hashmix(&mut d, &mut x, &mut hash);
    crush_hashmix(&mut y, &mut e, &mut hash);

    hash
}

/// Tag mixed into straw2 draw hashes so they never collide with the
/// bucket-selection hash stream even when `(value, child_id, attempt)`
/// coincide with some `(value, bucket_id, replica, attempt)` tuple.
const STRAW2_DRAW_TAG: u32 = 0x5472_6177; // ASCII "Traw"

/// `hash(value, child_id, replica, attempt)` used by uniform and list
/// bucket selection.
pub fn bucket_select_hash(value: u32, id: i32, replica: u32, attempt: u32) -> u32 {
    crush_hash32_4(value, id as u32, replica, attempt)
}

/// `hash(value, child_id, attempt, "draw")` used by straw2 draws —
/// deliberately independent of replica position, which is what gives
/// straw2 its optimal-movement property: the relative order of straws for
/// a fixed `(value, attempt)` does not depend on which replica is being
/// placed.
pub fn straw2_draw_hash(value: u32, id: i32, attempt: u32) -> u32 {
    crush_hash32_4(value, id as u32, attempt, STRAW2_DRAW_TAG)
}
