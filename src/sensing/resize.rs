// src/sensing/resize.rs

/// Area-average resize for contiguous BGR buffers (3 bytes per pixel,
/// row-major). Each destination pixel averages the exact source rectangle it
/// covers, with fractional weights at the edges, so downscaling does not
/// alias the thin structures the sensing kernel looks for.
pub fn resize_area_bgr(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    assert!(src_w > 0 && src_h > 0 && dst_w > 0 && dst_h > 0);
    assert_eq!(src.len(), src_w * src_h * 3);

    if src_w == dst_w && src_h == dst_h {
        return src.to_vec();
    }

    let mut dst = vec![0u8; dst_w * dst_h * 3];
    let x_ratio = src_w as f64 / dst_w as f64;
    let y_ratio = src_h as f64 / dst_h as f64;

    for dy in 0..dst_h {
        let sy0 = dy as f64 * y_ratio;
        let sy1 = (dy as f64 + 1.0) * y_ratio;
        let row_start = sy0.floor() as usize;
        let row_end = (sy1.ceil() as usize).min(src_h);

        for dx in 0..dst_w {
            let sx0 = dx as f64 * x_ratio;
            let sx1 = (dx as f64 + 1.0) * x_ratio;
            let col_start = sx0.floor() as usize;
            let col_end = (sx1.ceil() as usize).min(src_w);

            let mut acc = [0.0f64; 3];
            let mut area = 0.0f64;

            for sy in row_start..row_end {
                let wy = overlap(sy as f64, sy0, sy1);
                if wy <= 0.0 {
                    continue;
                }
                let row_off = sy * src_w * 3;
                for sx in col_start..col_end {
                    let wx = overlap(sx as f64, sx0, sx1);
                    if wx <= 0.0 {
                        continue;
                    }
                    let w = wx * wy;
                    let idx = row_off + sx * 3;
                    acc[0] += src[idx] as f64 * w;
                    acc[1] += src[idx + 1] as f64 * w;
                    acc[2] += src[idx + 2] as f64 * w;
                    area += w;
                }
            }

            let out = (dy * dst_w + dx) * 3;
            if area > 0.0 {
                dst[out] = (acc[0] / area).round().clamp(0.0, 255.0) as u8;
                dst[out + 1] = (acc[1] / area).round().clamp(0.0, 255.0) as u8;
                dst[out + 2] = (acc[2] / area).round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}

/// Overlap of the unit source cell [cell, cell+1) with [lo, hi).
fn overlap(cell: f64, lo: f64, hi: f64) -> f64 {
    let start = cell.max(lo);
    let end = (cell + 1.0).min(hi);
    (end - start).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_when_same_size() {
        let src: Vec<u8> = (0..12 * 8 * 3).map(|i| (i % 251) as u8).collect();
        let dst = resize_area_bgr(&src, 12, 8, 12, 8);
        assert_eq!(src, dst);
    }

    #[test]
    fn test_uniform_stays_uniform() {
        let src = vec![128u8; 640 * 480 * 3];
        let dst = resize_area_bgr(&src, 640, 480, 416, 234);
        assert_eq!(dst.len(), 416 * 234 * 3);
        assert!(dst.iter().all(|&p| p == 128));
    }

    #[test]
    fn test_integer_downscale_averages_blocks() {
        // 4x4 image of four 2x2 uniform quadrants -> 2x2 of quadrant means.
        let mut src = vec![0u8; 4 * 4 * 3];
        for y in 0..4 {
            for x in 0..4 {
                let v = match (y < 2, x < 2) {
                    (true, true) => 10,
                    (true, false) => 50,
                    (false, true) => 90,
                    (false, false) => 130,
                };
                let idx = (y * 4 + x) * 3;
                src[idx] = v;
                src[idx + 1] = v;
                src[idx + 2] = v;
            }
        }
        let dst = resize_area_bgr(&src, 4, 4, 2, 2);
        assert_eq!(dst[0], 10);
        assert_eq!(dst[3], 50);
        assert_eq!(dst[6], 90);
        assert_eq!(dst[9], 130);
    }

    #[test]
    fn test_deterministic() {
        let src: Vec<u8> = (0..100 * 60 * 3).map(|i| (i * 7 % 256) as u8).collect();
        let a = resize_area_bgr(&src, 100, 60, 41, 23);
        let b = resize_area_bgr(&src, 100, 60, 41, 23);
        assert_eq!(a, b);
    }
}
