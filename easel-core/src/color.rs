use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Fixed cursor palette. Order is part of the contract: reordering changes
/// every user's color.
const PALETTE: [(u8, u8, u8); 12] = [
    (0xef, 0x44, 0x44), // red
    (0xf9, 0x73, 0x16), // orange
    (0xea, 0xb3, 0x08), // amber
    (0x22, 0xc5, 0x5e), // green
    (0x14, 0xb8, 0xa6), // teal
    (0x06, 0xb6, 0xd4), // cyan
    (0x3b, 0x82, 0xf6), // blue
    (0x63, 0x66, 0xf1), // indigo
    (0xa8, 0x55, 0xf7), // purple
    (0xec, 0x48, 0x99), // pink
    (0x84, 0xcc, 0x16), // lime
    (0x78, 0x71, 0x6c), // stone
];

/// RGBA color for a remote user's cursor and presence badge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable palette entry for `user`. Pure function of the id string, so
    /// every client agrees without coordination and the color survives
    /// reconnects.
    pub fn for_user(user: &UserId) -> Self {
        let (r, g, b) = PALETTE[Self::palette_index(user)];
        Self::from_rgb8(r, g, b)
    }

    pub fn palette_index(user: &UserId) -> usize {
        (fnv1a(user.as_str().as_bytes()) % PALETTE.len() as u64) as usize
    }

    pub fn palette_len() -> usize {
        PALETTE.len()
    }

    pub fn from_rgb8(r: u8, g: u8, b: u8) -> Self {
        Self {
            r: r as f32 / 255.0,
            g: g as f32 / 255.0,
            b: b as f32 / 255.0,
            a: 1.0,
        }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb`, alpha dropped.
    pub fn hex(&self) -> String {
        let c = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", c(self.r), c(self.g), c(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        let (r, g, b) = PALETTE[6];
        Self::from_rgb8(r, g, b)
    }
}

// 64-bit FNV-1a. std's DefaultHasher is not guaranteed stable across releases.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_color_is_deterministic() {
        let user = UserId::from("alice");
        assert_eq!(CursorColor::for_user(&user), CursorColor::for_user(&UserId::from("alice")));
    }

    #[test]
    fn test_colors_spread_across_palette() {
        let used: HashSet<usize> = (0..200)
            .map(|i| CursorColor::palette_index(&UserId::new(format!("user-{i}"))))
            .collect();
        assert!(used.len() > CursorColor::palette_len() / 2);
    }

    #[test]
    fn test_fnv1a_known_vector() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_hex_formatting() {
        assert_eq!(CursorColor::from_rgb8(0xef, 0x44, 0x44).hex(), "#ef4444");
        assert_eq!(CursorColor::rgba(1.0, 0.0, 0.0, 0.5).to_array(), [1.0, 0.0, 0.0, 0.5]);
    }
}
