//! Canonical ladder fingerprint.
//!
//! SHA-256 over the asset ID followed by every bid then every ask level as
//! `price:size;`, with decimals normalized so `0.40` and `0.4` hash alike.
//! Two books with the same levels always produce the same fingerprint.

use sha2::{Digest, Sha256};

use crate::book::BookState;
use crate::types::PriceLevel;

pub fn ladder_fingerprint(book: &BookState) -> String {
    let mut hasher = Sha256::new();
    hasher.update(book.asset_id().as_str().as_bytes());
    hash_side(&mut hasher, b'b', book.bids());
    hash_side(&mut hasher, b'a', book.asks());
    format!("{:x}", hasher.finalize())
}

fn hash_side(hasher: &mut Sha256, tag: u8, levels: &[PriceLevel]) {
    hasher.update([b'|', tag]);
    for level in levels {
        hasher.update(level.price.normalize().to_string().as_bytes());
        hasher.update(b":");
        hasher.update(level.size.normalize().to_string().as_bytes());
        hasher.update(b";");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetId, Side};
    use chrono::Utc;

    fn lvl(price: &str, size: &str) -> PriceLevel {
        PriceLevel::new(price.parse().unwrap(), size.parse().unwrap())
    }

    #[test]
    fn test_same_levels_same_fingerprint() {
        let a = BookState::from_snapshot(
            AssetId::from("X"),
            vec![lvl("0.40", "5.0")],
            vec![lvl("0.41", "30")],
            Some("feed-hash".to_string()),
            None,
            Utc::now(),
        );
        let b = BookState::from_snapshot(
            AssetId::from("X"),
            vec![lvl("0.4", "5")],
            vec![lvl("0.410", "30.00")],
            None,
            None,
            Utc::now(),
        );
        assert_eq!(ladder_fingerprint(&a), ladder_fingerprint(&b));
        assert_eq!(ladder_fingerprint(&a).len(), 64);
    }

    #[test]
    fn test_fingerprint_tracks_changes() {
        let mut book = BookState::from_snapshot(
            AssetId::from("X"),
            vec![],
            vec![lvl("0.41", "30")],
            None,
            None,
            Utc::now(),
        );
        let before = ladder_fingerprint(&book);
        book.apply_level(Side::Ask, "0.41".parse().unwrap(), "31".parse().unwrap());
        assert_ne!(before, ladder_fingerprint(&book));
    }

    #[test]
    fn test_side_matters() {
        let bid = BookState::from_snapshot(
            AssetId::from("X"),
            vec![lvl("0.41", "30")],
            vec![],
            None,
            None,
            Utc::now(),
        );
        let ask = BookState::from_snapshot(
            AssetId::from("X"),
            vec![],
            vec![lvl("0.41", "30")],
            None,
            None,
            Utc::now(),
        );
        assert_ne!(ladder_fingerprint(&bid), ladder_fingerprint(&ask));
    }
}
