//! Connection id allocation.
//!
//! An id is a random v4 UUID, hashed with 32-bit murmur3 and reduced modulo
//! `i32::MAX`. Collisions with live connections are checked by the caller.

use uuid::Uuid;

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

/// Generate a new non-negative connection id.
pub fn generate_conn_id() -> i32 {
    conn_id_from_uuid(&Uuid::new_v4().to_string())
}

/// Reduce a hyphenated UUID string to a connection id.
fn conn_id_from_uuid(uuid: &str) -> i32 {
    (murmur3_32(uuid.as_bytes(), 0) % i32::MAX as u32) as i32
}

/// MurmurHash3, x86 32-bit variant.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;
    let mut chunks = data.chunks_exact(4);

    for chunk in &mut chunks {
        let k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h ^= mix_k(k);
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k ^= (*byte as u32) << (8 * i);
        }
        h ^= mix_k(k);
    }

    h ^= data.len() as u32;
    fmix(h)
}

#[inline]
fn mix_k(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

#[inline]
fn fmix(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
