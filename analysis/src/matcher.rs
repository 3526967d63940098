//! Fractional Hamming distance with bounded rotational search.

use uuid::Uuid;

use crate::code::TemplateCodes;
use crate::gallery::{GalleryCodes, GallerySnapshot};

#[derive(Debug, Clone, Copy)]
pub struct MatchParams {
    /// FHD at or below this is a match.
    pub match_threshold: f64,
    /// Stricter cutoff used for enrollment dedup.
    pub dedup_threshold: f64,
    /// Rotational search considers shifts -rotation_shift..=rotation_shift.
    pub rotation_shift: i32,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            match_threshold: 0.32,
            dedup_threshold: 0.26,
            rotation_shift: 15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BestMatch {
    pub template_id: Uuid,
    pub identity_id: Uuid,
    pub identity_name: String,
    pub distance: f64,
    pub rotation: i32,
}

/// Masked disagreement fraction at a fixed column shift.
/// Returns None when the masks leave no comparable bits.
pub fn fractional_hd(probe: &TemplateCodes, cand: &TemplateCodes, shift: i32) -> Option<f64> {
    if probe.scales.len() != cand.scales.len() {
        return None;
    }
    let mut total = 0u64;
    let mut disagree = 0u64;
    for (s, probe_code) in probe.scales.iter().enumerate() {
        let cand_code = &cand.scales[s];
        if probe_code.width != cand_code.width || probe_code.height != cand_code.height {
            return None;
        }
        let probe_mask = &probe.masks[s];
        let cand_mask = &cand.masks[s];
        let width = probe_code.width as i64;
        for row in 0..probe_code.height {
            for col in 0..probe_code.width {
                let shifted = (i64::from(col) + i64::from(shift)).rem_euclid(width) as u32;
                if !probe_mask.get(row, col) || !cand_mask.get(row, shifted) {
                    continue;
                }
                total += 1;
                if probe_code.get(row, col) != cand_code.get(row, shifted) {
                    disagree += 1;
                }
            }
        }
    }
    if total == 0 {
        return None;
    }
    Some(disagree as f64 / total as f64)
}

/// Minimum FHD over the rotation window, with the shift that achieved it.
pub fn best_distance(
    probe: &TemplateCodes,
    cand: &TemplateCodes,
    rotation_shift: i32,
) -> Option<(f64, i32)> {
    let mut best: Option<(f64, i32)> = None;
    for shift in -rotation_shift..=rotation_shift {
        if let Some(d) = fractional_hd(probe, cand, shift) {
            match best {
                Some((bd, _)) if bd <= d => {}
                _ => best = Some((d, shift)),
            }
        }
    }
    best
}

/// Best plaintext gallery candidate at or below the threshold.
/// Encrypted entries are skipped; they go through the key service.
pub fn best_match(
    probe: &TemplateCodes,
    snapshot: &GallerySnapshot,
    threshold: f64,
    rotation_shift: i32,
) -> Option<BestMatch> {
    let mut best: Option<BestMatch> = None;
    for entry in &snapshot.entries {
        let GalleryCodes::Plain(cand) = &entry.codes else {
            continue;
        };
        let Some((distance, rotation)) = best_distance(probe, cand, rotation_shift) else {
            continue;
        };
        if distance > threshold {
            continue;
        }
        match &best {
            Some(b) if b.distance <= distance => {}
            _ => {
                best = Some(BestMatch {
                    template_id: entry.template_id,
                    identity_id: entry.identity_id,
                    identity_name: entry.identity_name.clone(),
                    distance,
                    rotation,
                });
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodeArray;
    use crate::gallery::GalleryEntry;
    use std::sync::Arc;
    use wire::EyeSide;

    fn codes_from_bits(width: u32, bits: &[u8]) -> TemplateCodes {
        let mut code = CodeArray::new(width, 1);
        for (i, &b) in bits.iter().enumerate() {
            code.set(0, i as u32, b == 1);
        }
        TemplateCodes {
            masks: vec![CodeArray::filled(width, 1)],
            scales: vec![code],
        }
    }

    /// A single hot column: its cyclic autocorrelation is zero only at
    /// perfect alignment, so the recovered rotation is unambiguous.
    fn impulse(width: u32, col: u32) -> TemplateCodes {
        let mut bits = vec![0u8; width as usize];
        bits[col as usize] = 1;
        codes_from_bits(width, &bits)
    }

    #[test]
    fn identical_codes_have_zero_distance() {
        let a = codes_from_bits(32, &[1, 0, 1, 1, 0, 0, 1, 0].repeat(4));
        assert_eq!(fractional_hd(&a, &a, 0), Some(0.0));
    }

    #[test]
    fn rotation_search_recovers_shift() {
        // Probe hot at 10, candidate hot at 4: probe col c aligns with
        // candidate col c - 6, i.e. shift -6.
        let probe = impulse(32, 10);
        let cand = impulse(32, 4);
        let (d, rot) = best_distance(&probe, &cand, 15).unwrap();
        assert_eq!(d, 0.0);
        assert_eq!(rot, -6);
    }

    #[test]
    fn rotation_window_is_inclusive() {
        let probe = impulse(64, 0);
        let cand = impulse(64, 15);
        let (d, rot) = best_distance(&probe, &cand, 15).unwrap();
        assert_eq!(d, 0.0);
        assert_eq!(rot, 15);
        // One past the window must not find the perfect alignment.
        let cand16 = impulse(64, 16);
        let (d16, _) = best_distance(&probe, &cand16, 15).unwrap();
        assert!(d16 > 0.0);
    }

    #[test]
    fn masks_exclude_bits_from_comparison() {
        let mut probe = codes_from_bits(8, &[1, 1, 1, 1, 0, 0, 0, 0]);
        let cand = codes_from_bits(8, &[0, 0, 1, 1, 0, 0, 0, 0]);
        // Mask out the two disagreeing columns on the probe side.
        probe.masks[0].set(0, 0, false);
        probe.masks[0].set(0, 1, false);
        assert_eq!(fractional_hd(&probe, &cand, 0), Some(0.0));
    }

    #[test]
    fn empty_mask_yields_none() {
        let mut a = codes_from_bits(8, &[1; 8]);
        a.masks[0] = CodeArray::new(8, 1);
        let b = codes_from_bits(8, &[0; 8]);
        assert_eq!(fractional_hd(&a, &b, 0), None);
    }

    #[test]
    fn best_match_prefers_lowest_distance() {
        let bits: Vec<u8> = (0..32).map(|i| (i % 3 == 0) as u8).collect();
        let probe = codes_from_bits(32, &bits);

        let mut near_bits = bits.clone();
        near_bits[0] ^= 1;
        let near = codes_from_bits(32, &near_bits);

        let far_bits: Vec<u8> = bits.iter().map(|b| b ^ 1).collect();
        let far = codes_from_bits(32, &far_bits);

        let entry = |name: &str, codes: TemplateCodes| {
            Arc::new(GalleryEntry {
                template_id: Uuid::new_v4(),
                identity_id: Uuid::new_v4(),
                identity_name: name.to_string(),
                eye_side: EyeSide::Left,
                codes: GalleryCodes::Plain(codes),
            })
        };
        let snapshot = GallerySnapshot {
            version: 1,
            entries: vec![entry("far", far), entry("near", near)],
        };

        let best = best_match(&probe, &snapshot, 0.32, 2).unwrap();
        assert_eq!(best.identity_name, "near");
        assert!(best.distance < 0.1);
    }
}
