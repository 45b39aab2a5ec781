//! Content hashing for both containers.
//!
//! All hashing runs through SipHash-2-4 under a process-wide random key,
//! so hashes are stable within a process but vary between runs.

use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use rand::RngCore;
use siphasher::sip::SipHasher24;

static SIP_KEY: OnceLock<[u8; 16]> = OnceLock::new();

fn sip_key() -> &'static [u8; 16] {
    SIP_KEY.get_or_init(|| {
        let mut key = [0; 16];
        rand::thread_rng().fill_bytes(&mut key);
        key
    })
}

/// Full 64-bit hash of a single value.
pub(crate) fn hash_one<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = SipHasher24::new_with_key(sip_key());
    value.hash(&mut hasher);
    hasher.finish()
}

/// The 32-bit prefix the CHAMP trie is indexed by.
pub(crate) fn trie_hash<T: Hash + ?Sized>(value: &T) -> u32 {
    hash_one(value) as u32
}

/// 64-bit avalanche finalizer (the murmur3 fmix64 step).
pub(crate) fn avalanche(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

/// Order-dependent combining step for sequence hashing.
pub(crate) fn combine_ordered(acc: u64, hash: u64) -> u64 {
    acc ^ hash
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(acc << 6)
        .wrapping_add(acc >> 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_one_is_stable_within_a_process() {
        assert_eq!(hash_one(&42u64), hash_one(&42u64));
        assert_eq!(trie_hash("key"), trie_hash("key"));
    }

    #[test]
    fn avalanche_spreads_single_bits() {
        // Flipping one input bit must change roughly half the output.
        let a = avalanche(1);
        let b = avalanche(2);
        let differing = (a ^ b).count_ones();
        assert!(differing > 16, "only {differing} bits differ");
    }

    #[test]
    fn combine_ordered_is_order_sensitive() {
        let ab = combine_ordered(combine_ordered(0, 1), 2);
        let ba = combine_ordered(combine_ordered(0, 2), 1);
        assert_ne!(ab, ba);
    }
}
