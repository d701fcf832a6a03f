// src/signature/descriptors.rs
//
// Low-dimensional scene descriptors extracted by Lane 2 from the resized
// frame. All four vectors are unit-normalized at extraction time so the
// bank's weighted L2 distances compare like with like.

pub const STRUCTURAL_DIM: usize = 64;
pub const SEMANTIC_PROFILE_DIM: usize = 32;
pub const CONTEXT_DIM: usize = 16;
pub const MOTION_DIM: usize = 16;

#[derive(Debug, Clone)]
pub struct DescriptorSet {
    /// 8x8 grid of block-mean luminance.
    pub structural: Vec<f32>,
    /// 32 horizontal band means, top to bottom.
    pub semantic_profile: Vec<f32>,
    /// Global statistics: mean, stddev, crack score, average luminance.
    pub context: Vec<f32>,
    /// Band-to-band change against the previous frame's profile.
    pub motion: Vec<f32>,
}

/// Zero a vector if its norm is negligible, otherwise scale to unit length.
pub fn safe_unit_norm(v: &mut [f32]) {
    let norm_sq: f32 = v.iter().map(|x| x * x).sum();
    let norm = norm_sq.sqrt();
    if norm < 1e-8 {
        v.iter_mut().for_each(|x| *x = 0.0);
    } else {
        let inv = 1.0 / norm;
        v.iter_mut().for_each(|x| *x *= inv);
    }
}

/// Weighted-component L2 distance over the shorter of the two vectors.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

/// Extract the descriptor set from a luminance plane. `prev_profile` is the
/// previous frame's (pre-normalization) band profile kept by Lane 2; absent
/// on the first frame, which yields a zero motion signature.
pub fn extract(
    luma: &[u8],
    width: usize,
    height: usize,
    crack_score: f32,
    prev_profile: Option<&[f32]>,
) -> (DescriptorSet, RawProfile) {
    debug_assert_eq!(luma.len(), width * height);

    // --- Global statistics ---
    let total = (width * height) as f64;
    let sum: f64 = luma.iter().map(|&p| p as f64).sum();
    let mean = sum / total;
    let var: f64 = luma
        .iter()
        .map(|&p| {
            let d = p as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / total;
    let avg_luminance = (mean / 255.0) as f32;

    // --- 8x8 block-mean structural fingerprint ---
    let mut structural = vec![0.0f32; STRUCTURAL_DIM];
    let block_h = (height / 8).max(1);
    let block_w = (width / 8).max(1);
    for by in 0..8 {
        for bx in 0..8 {
            let y0 = (by * block_h).min(height - 1);
            let x0 = (bx * block_w).min(width - 1);
            let y1 = (y0 + block_h).min(height);
            let x1 = (x0 + block_w).min(width);

            let mut acc = 0u64;
            let mut count = 0u64;
            for y in y0..y1 {
                let row = y * width;
                for x in x0..x1 {
                    acc += luma[row + x] as u64;
                    count += 1;
                }
            }
            if count > 0 {
                structural[by * 8 + bx] = acc as f32 / (count as f32 * 255.0);
            }
        }
    }

    // --- 32-band vertical profile ---
    let mut raw_profile = vec![0.0f32; SEMANTIC_PROFILE_DIM];
    let band_h = (height / SEMANTIC_PROFILE_DIM).max(1);
    for (band, slot) in raw_profile.iter_mut().enumerate() {
        let y0 = (band * band_h).min(height - 1);
        let y1 = (y0 + band_h).min(height);
        let mut acc = 0u64;
        let mut count = 0u64;
        for y in y0..y1 {
            let row = y * width;
            for x in 0..width {
                acc += luma[row + x] as u64;
                count += 1;
            }
        }
        if count > 0 {
            *slot = acc as f32 / (count as f32 * 255.0);
        }
    }

    // --- Context vector ---
    let mut context = vec![0.0f32; CONTEXT_DIM];
    context[0] = avg_luminance;
    context[1] = (var.sqrt() / 255.0) as f32;
    context[2] = crack_score;
    context[3] = avg_luminance;

    // --- Motion signature: pairwise band deltas vs the previous frame ---
    let mut motion = vec![0.0f32; MOTION_DIM];
    if let Some(prev) = prev_profile {
        for (i, slot) in motion.iter_mut().enumerate() {
            let a = raw_profile[2 * i] - prev.get(2 * i).copied().unwrap_or(0.0);
            let b = raw_profile[2 * i + 1] - prev.get(2 * i + 1).copied().unwrap_or(0.0);
            *slot = (a.abs() + b.abs()) * 0.5;
        }
    }

    let mut semantic_profile = raw_profile.clone();
    safe_unit_norm(&mut structural);
    safe_unit_norm(&mut semantic_profile);
    safe_unit_norm(&mut context);
    safe_unit_norm(&mut motion);

    (
        DescriptorSet {
            structural,
            semantic_profile,
            context,
            motion,
        },
        RawProfile {
            bands: raw_profile,
            avg_luminance,
        },
    )
}

/// Un-normalized per-frame profile carried between Lane 2 iterations for the
/// motion signature.
#[derive(Debug, Clone)]
pub struct RawProfile {
    pub bands: Vec<f32>,
    pub avg_luminance: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_norm() {
        let mut v = vec![3.0, 4.0];
        safe_unit_norm(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut tiny = vec![1e-12, 0.0];
        safe_unit_norm(&mut tiny);
        assert_eq!(tiny, vec![0.0, 0.0]);
    }

    #[test]
    fn test_extract_dimensions() {
        let luma = vec![128u8; 416 * 234];
        let (desc, profile) = extract(&luma, 416, 234, 0.1, None);
        assert_eq!(desc.structural.len(), STRUCTURAL_DIM);
        assert_eq!(desc.semantic_profile.len(), SEMANTIC_PROFILE_DIM);
        assert_eq!(desc.context.len(), CONTEXT_DIM);
        assert_eq!(desc.motion.len(), MOTION_DIM);
        assert_eq!(profile.bands.len(), SEMANTIC_PROFILE_DIM);
        assert!((profile.avg_luminance - 128.0 / 255.0).abs() < 1e-3);
    }

    #[test]
    fn test_identical_frames_zero_motion() {
        let luma = vec![100u8; 416 * 234];
        let (_, profile) = extract(&luma, 416, 234, 0.0, None);
        let (desc, _) = extract(&luma, 416, 234, 0.0, Some(&profile.bands));
        assert!(desc.motion.iter().all(|&m| m == 0.0));
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let luma: Vec<u8> = (0..416 * 234).map(|i| (i * 13 % 256) as u8).collect();
        let (a, _) = extract(&luma, 416, 234, 0.2, None);
        let (b, _) = extract(&luma, 416, 234, 0.2, None);
        assert_eq!(a.structural, b.structural);
        assert_eq!(a.semantic_profile, b.semantic_profile);
    }

    #[test]
    fn test_distance_zero_for_identical() {
        let luma: Vec<u8> = (0..416 * 234).map(|i| (i % 251) as u8).collect();
        let (a, _) = extract(&luma, 416, 234, 0.0, None);
        let (b, _) = extract(&luma, 416, 234, 0.0, None);
        assert_eq!(l2_distance(&a.structural, &b.structural), 0.0);
        assert_eq!(l2_distance(&a.semantic_profile, &b.semantic_profile), 0.0);
    }
}
