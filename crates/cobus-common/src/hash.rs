//! ---
//! cobus_section: "01-core-functionality"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Shared primitives and utilities for the bus runtime."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---

const FNV_OFFSET_32: u32 = 2_166_136_261;
const FNV_PRIME_32: u32 = 16_777_619;

/// Derive a stable 32-bit identifier from a name using FNV-1a.
///
/// Registries on different processes must agree on identifiers without any
/// coordination, so identifiers are a pure function of the name rather than
/// a sequential assignment.
pub fn stable_hash32(key: &str) -> u32 {
    let mut h = FNV_OFFSET_32;
    for byte in key.as_bytes() {
        h ^= u32::from(*byte);
        h = h.wrapping_mul(FNV_PRIME_32);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_across_calls() {
        assert_eq!(stable_hash32("foo"), stable_hash32("foo"));
        assert_ne!(stable_hash32("foo"), stable_hash32("bar"));
    }

    #[test]
    fn hash_matches_fnv1a_reference_values() {
        // Reference values from the FNV-1a 32-bit test suite.
        assert_eq!(stable_hash32(""), 2_166_136_261);
        assert_eq!(stable_hash32("a"), 0xe40c_292c);
        assert_eq!(stable_hash32("foobar"), 0xbf9c_f968);
    }
}
