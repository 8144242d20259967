//! Bilinear point sampling of mask rasters.
//!
//! Mask losses are estimated on a fixed budget of points per mask instead of
//! the full raster. Points are normalized `(x, y)` in `[0, 1]`; sampling uses
//! pixel-center alignment with zero padding outside the raster.

use candle_core::{DType, Tensor};
use rand::Rng;
use simcis_core::{Error, Result};

/// Normalized sample locations, `num_points` per mask.
#[derive(Debug, Clone)]
pub struct PointCoords {
    num_masks: usize,
    num_points: usize,
    data: Vec<[f32; 2]>,
}

impl PointCoords {
    pub fn new(num_masks: usize, num_points: usize, data: Vec<[f32; 2]>) -> Result<Self> {
        if data.len() != num_masks * num_points {
            return Err(Error::InvalidInput(format!(
                "expected {} point coordinates, got {}",
                num_masks * num_points,
                data.len()
            )));
        }
        Ok(Self {
            num_masks,
            num_points,
            data,
        })
    }

    pub fn num_masks(&self) -> usize {
        self.num_masks
    }

    pub fn num_points(&self) -> usize {
        self.num_points
    }

    pub fn points(&self, mask: usize) -> &[[f32; 2]] {
        &self.data[mask * self.num_points..(mask + 1) * self.num_points]
    }
}

/// Four bilinear taps `(flat index, weight)` for a point on an `h x w` raster.
/// Out-of-range taps get weight zero.
fn bilinear_taps(x: f32, y: f32, h: usize, w: usize) -> [(usize, f32); 4] {
    let px = x * w as f32 - 0.5;
    let py = y * h as f32 - 0.5;
    let x0 = px.floor();
    let y0 = py.floor();
    let fx = px - x0;
    let fy = py - y0;

    let tap = |xi: f32, yi: f32, weight: f32| {
        if xi < 0.0 || yi < 0.0 || xi >= w as f32 || yi >= h as f32 {
            (0, 0.0)
        } else {
            (yi as usize * w + xi as usize, weight)
        }
    };

    [
        tap(x0, y0, (1.0 - fx) * (1.0 - fy)),
        tap(x0 + 1.0, y0, fx * (1.0 - fy)),
        tap(x0, y0 + 1.0, (1.0 - fx) * fy),
        tap(x0 + 1.0, y0 + 1.0, fx * fy),
    ]
}

/// Sample `[N, H, W]` rasters at `coords`, returning `[N, P]`.
///
/// Differentiable with respect to `input`: the taps are gathered from the
/// flattened raster and blended with constant weights.
pub fn point_sample(input: &Tensor, coords: &PointCoords) -> Result<Tensor> {
    let (n, h, w) = input.dims3()?;
    if n != coords.num_masks {
        return Err(Error::ShapeMismatch {
            context: "point_sample",
            expected: vec![coords.num_masks],
            actual: vec![n],
        });
    }
    let p = coords.num_points;
    let device = input.device();
    if n == 0 || p == 0 {
        return Ok(Tensor::zeros((n, p), input.dtype(), device)?);
    }

    // Layout [N, 4, P] so the four taps reduce along dim 1.
    let mut indices = vec![0u32; n * 4 * p];
    let mut weights = vec![0f32; n * 4 * p];
    for m in 0..n {
        for (j, &[x, y]) in coords.points(m).iter().enumerate() {
            for (t, (idx, weight)) in bilinear_taps(x, y, h, w).into_iter().enumerate() {
                let slot = m * 4 * p + t * p + j;
                indices[slot] = idx as u32;
                weights[slot] = weight;
            }
        }
    }

    let indices = Tensor::from_vec(indices, (n, 4 * p), device)?;
    let weights = Tensor::from_vec(weights, (n, 4, p), device)?.to_dtype(input.dtype())?;
    let gathered = input
        .reshape((n, h * w))?
        .contiguous()?
        .gather(&indices, 1)?
        .reshape((n, 4, p))?;

    Ok((gathered * weights)?.sum(1)?)
}

fn sample_cpu(raster: &[f32], h: usize, w: usize, x: f32, y: f32) -> f32 {
    bilinear_taps(x, y, h, w)
        .iter()
        .map(|&(idx, weight)| if weight == 0.0 { 0.0 } else { raster[idx] * weight })
        .sum()
}

/// Choose sample points biased towards uncertain logits.
///
/// Draws `oversample_ratio * num_points` uniform candidates, keeps the
/// `importance_sample_ratio * num_points` with the highest uncertainty
/// (`-|logit|`) and fills the rest with fresh uniform points.
pub fn sample_uncertain_points<R: Rng>(
    logits: &Tensor,
    num_points: usize,
    oversample_ratio: f64,
    importance_sample_ratio: f64,
    rng: &mut R,
) -> Result<PointCoords> {
    let (n, h, w) = logits.dims3()?;
    let raster: Vec<f32> = logits
        .detach()
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1()?;

    let num_sampled = ((num_points as f64) * oversample_ratio) as usize;
    let num_uncertain = ((num_points as f64) * importance_sample_ratio) as usize;
    let num_uncertain = num_uncertain.min(num_sampled);
    let num_random = num_points - num_uncertain;

    let mut data = Vec::with_capacity(n * num_points);
    let mut candidates: Vec<([f32; 2], f32)> = Vec::with_capacity(num_sampled);
    for m in 0..n {
        let mask = &raster[m * h * w..(m + 1) * h * w];

        candidates.clear();
        for _ in 0..num_sampled {
            let point = [rng.gen::<f32>(), rng.gen::<f32>()];
            let uncertainty = -sample_cpu(mask, h, w, point[0], point[1]).abs();
            candidates.push((point, uncertainty));
        }
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
        data.extend(candidates.iter().take(num_uncertain).map(|(point, _)| *point));

        for _ in 0..num_random {
            data.push([rng.gen::<f32>(), rng.gen::<f32>()]);
        }
    }

    PointCoords::new(n, num_points, data)
}

/// Resize `[N, h, w]` rasters to `size = (H, W)` with bilinear interpolation.
///
/// Pixel-center aligned with edge clamping. Not differentiable; used on
/// frozen old-model masks.
pub fn resize_bilinear(input: &Tensor, size: (usize, usize)) -> Result<Tensor> {
    let (n, h, w) = input.dims3()?;
    let (out_h, out_w) = size;
    if (h, w) == size {
        return Ok(input.detach());
    }
    if h == 0 || w == 0 {
        return Ok(Tensor::zeros((n, out_h, out_w), input.dtype(), input.device())?);
    }
    let raster: Vec<f32> = input
        .detach()
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1()?;

    let axis = |dst: usize, src_len: usize, dst_len: usize| {
        let scale = src_len as f32 / dst_len as f32;
        let src = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(src_len - 1);
        let i1 = (i0 + 1).min(src_len - 1);
        (i0, i1, src - i0 as f32)
    };
    let cols: Vec<_> = (0..out_w).map(|x| axis(x, w, out_w)).collect();
    let rows: Vec<_> = (0..out_h).map(|y| axis(y, h, out_h)).collect();

    let mut out = vec![0f32; n * out_h * out_w];
    for m in 0..n {
        let src = &raster[m * h * w..(m + 1) * h * w];
        let dst = &mut out[m * out_h * out_w..(m + 1) * out_h * out_w];
        for (y, &(y0, y1, fy)) in rows.iter().enumerate() {
            for (x, &(x0, x1, fx)) in cols.iter().enumerate() {
                let top = src[y0 * w + x0] * (1.0 - fx) + src[y0 * w + x1] * fx;
                let bottom = src[y1 * w + x0] * (1.0 - fx) + src[y1 * w + x1] * fx;
                dst[y * out_w + x] = top * (1.0 - fy) + bottom * fy;
            }
        }
    }

    Ok(Tensor::from_vec(out, (n, out_h, out_w), input.device())?.to_dtype(input.dtype())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_point_sample_pixel_centers() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::new(&[[[1.0f32, 2.0], [3.0, 4.0]]], &device)?;
        // Pixel centers of a 2x2 raster are at 0.25 and 0.75.
        let coords = PointCoords::new(
            1,
            3,
            vec![[0.25, 0.25], [0.75, 0.75], [0.5, 0.5]],
        )?;
        let sampled: Vec<Vec<f32>> = point_sample(&input, &coords)?.to_vec2()?;
        assert!((sampled[0][0] - 1.0).abs() < 1e-5);
        assert!((sampled[0][1] - 4.0).abs() < 1e-5);
        assert!((sampled[0][2] - 2.5).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_point_sample_zero_padding() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::ones((1, 2, 2), DType::F32, &device)?;
        // At the corner only one of four taps is inside the raster.
        let coords = PointCoords::new(1, 1, vec![[0.0, 0.0]])?;
        let sampled: Vec<Vec<f32>> = point_sample(&input, &coords)?.to_vec2()?;
        assert!((sampled[0][0] - 0.25).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_point_sample_gradient() -> Result<()> {
        let device = Device::Cpu;
        let input = Var::from_tensor(&Tensor::zeros((1, 2, 2), DType::F32, &device)?)?;
        let coords = PointCoords::new(1, 1, vec![[0.5, 0.5]])?;
        let loss = point_sample(input.as_tensor(), &coords)?.sum_all()?;
        let grads = loss.backward()?;
        let grad: Vec<f32> = grads
            .get(input.as_tensor())
            .ok_or(Error::MissingOutput("gradient"))?
            .flatten_all()?
            .to_vec1()?;
        for g in grad {
            assert!((g - 0.25).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_uncertain_points_budget() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 1.0, (3, 8, 8), &device)?;
        let mut rng = StdRng::seed_from_u64(7);
        let coords = sample_uncertain_points(&logits, 20, 3.0, 0.75, &mut rng)?;
        assert_eq!(coords.num_masks(), 3);
        assert_eq!(coords.num_points(), 20);
        for m in 0..3 {
            for &[x, y] in coords.points(m) {
                assert!((0.0..=1.0).contains(&x) && (0.0..=1.0).contains(&y));
            }
        }
        Ok(())
    }

    #[test]
    fn test_resize_bilinear() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::new(&[[[0.0f32, 1.0], [0.0, 1.0]]], &device)?;
        let out = resize_bilinear(&input, (4, 4))?;
        assert_eq!(out.dims(), &[1, 4, 4]);
        let row: Vec<f32> = out.get(0)?.get(0)?.to_vec1()?;
        // Edge clamped, interpolated in the middle.
        assert!((row[0] - 0.0).abs() < 1e-5);
        assert!((row[1] - 0.25).abs() < 1e-5);
        assert!((row[2] - 0.75).abs() < 1e-5);
        assert!((row[3] - 1.0).abs() < 1e-5);
        Ok(())
    }
}
