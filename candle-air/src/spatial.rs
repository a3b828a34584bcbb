//! Default glimpse warper.
//!
//! `GridWarper` maps between image space and glimpse space through a
//! diagonal affine transform over normalized [-1, 1] coordinates, using
//! nearest-neighbour gathers. Gradients flow into the gathered pixel values;
//! the pose enters through host-computed indices, so pose gradients come from
//! the KL terms rather than the reconstruction. A bilinear or fully
//! differentiable warper can be substituted through `SpatialTransformerT`.

use candle_core::{Result, Tensor};

use crate::error::AirError;
use crate::model_traits::SpatialTransformerT;

/// Scales this close to zero are snapped away from it before inversion.
const MIN_SCALE: f32 = 1e-3;

pub struct GridWarper {
    img_size: (usize, usize),
    glimpse_size: (usize, usize),
}

impl GridWarper {
    pub fn new(img_size: (usize, usize), glimpse_size: (usize, usize)) -> Self {
        Self {
            img_size,
            glimpse_size,
        }
    }
}

/// Normalized coordinate of pixel `i` on an axis of `size` pixels.
fn norm_coord(i: usize, size: usize) -> f32 {
    if size > 1 {
        2. * i as f32 / (size - 1) as f32 - 1.
    } else {
        0.
    }
}

/// Nearest pixel index for a normalized coordinate; None when out of bounds.
fn to_pixel(coord: f32, size: usize) -> Option<usize> {
    if size == 1 {
        return if coord.abs() <= 1. { Some(0) } else { None };
    }
    let pix = ((coord + 1.) / 2. * (size - 1) as f32).round();
    if pix < 0. || pix > (size - 1) as f32 {
        None
    } else {
        Some(pix as usize)
    }
}

fn safe_scale(s: f32) -> f32 {
    if s.abs() < MIN_SCALE {
        if s.is_sign_negative() {
            -MIN_SCALE
        } else {
            MIN_SCALE
        }
    } else {
        s
    }
}

fn check_pose(where_n4: &Tensor, n: usize) -> Result<Vec<Vec<f32>>> {
    let dims = where_n4.dims2()?;
    if dims != (n, 4) {
        return Err(AirError::ShapeMismatch(format!(
            "pose tensor has shape {:?}, expected ({}, 4)",
            dims, n
        ))
        .into());
    }
    where_n4.to_vec2::<f32>()
}

impl SpatialTransformerT for GridWarper {
    fn extract(&self, img_nhw: &Tensor, where_n4: &Tensor) -> Result<Tensor> {
        let (n, h, w) = img_nhw.dims3()?;
        if (h, w) != self.img_size {
            return Err(AirError::ShapeMismatch(format!(
                "image is {}x{}, warper configured for {}x{}",
                h, w, self.img_size.0, self.img_size.1
            ))
            .into());
        }
        let (gh, gw) = self.glimpse_size;
        let pose = check_pose(where_n4, n)?;

        let mut idx = Vec::with_capacity(n * gh * gw);
        let mut mask = Vec::with_capacity(n * gh * gw);
        for p in &pose {
            let (sx, tx, sy, ty) = (p[0], p[1], p[2], p[3]);
            for gi in 0..gh {
                for gj in 0..gw {
                    let u = tx + sx * norm_coord(gj, gw);
                    let v = ty + sy * norm_coord(gi, gh);
                    match (to_pixel(v, h), to_pixel(u, w)) {
                        (Some(row), Some(col)) => {
                            idx.push((row * w + col) as u32);
                            mask.push(1f32);
                        }
                        _ => {
                            idx.push(0);
                            mask.push(0.);
                        }
                    }
                }
            }
        }

        let device = img_nhw.device();
        let idx_nf = Tensor::from_vec(idx, (n, gh * gw), device)?;
        let mask_nf = Tensor::from_vec(mask, (n, gh * gw), device)?;
        let glimpse_nf = (img_nhw.flatten_from(1)?.gather(&idx_nf, 1)? * mask_nf)?;
        glimpse_nf.reshape((n, gh, gw))
    }

    fn render(&self, glimpse_nhw: &Tensor, where_n4: &Tensor) -> Result<Tensor> {
        let (n, gh, gw) = glimpse_nhw.dims3()?;
        if (gh, gw) != self.glimpse_size {
            return Err(AirError::ShapeMismatch(format!(
                "glimpse is {}x{}, warper configured for {}x{}",
                gh, gw, self.glimpse_size.0, self.glimpse_size.1
            ))
            .into());
        }
        let (h, w) = self.img_size;
        let pose = check_pose(where_n4, n)?;

        let mut idx = Vec::with_capacity(n * h * w);
        let mut mask = Vec::with_capacity(n * h * w);
        for p in &pose {
            let (sx, tx, sy, ty) = (
                safe_scale(p[0]),
                p[1],
                safe_scale(p[2]),
                p[3],
            );
            for i in 0..h {
                for j in 0..w {
                    let gx = (norm_coord(j, w) - tx) / sx;
                    let gy = (norm_coord(i, h) - ty) / sy;
                    match (to_pixel(gy, gh), to_pixel(gx, gw)) {
                        (Some(row), Some(col)) => {
                            idx.push((row * gw + col) as u32);
                            mask.push(1f32);
                        }
                        _ => {
                            idx.push(0);
                            mask.push(0.);
                        }
                    }
                }
            }
        }

        let device = glimpse_nhw.device();
        let idx_nf = Tensor::from_vec(idx, (n, h * w), device)?;
        let mask_nf = Tensor::from_vec(mask, (n, h * w), device)?;
        let canvas_nf = (glimpse_nhw.flatten_from(1)?.gather(&idx_nf, 1)? * mask_nf)?;
        canvas_nf.reshape((n, h, w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn identity_pose(n: usize, device: &Device) -> Result<Tensor> {
        let pose: Vec<f32> = (0..n).flat_map(|_| [1f32, 0., 1., 0.]).collect();
        Tensor::from_vec(pose, (n, 4), device)
    }

    #[test]
    fn identity_extract_returns_image() -> Result<()> {
        let device = Device::Cpu;
        let img = Tensor::rand(0f32, 1f32, (2, 3, 3), &device)?;
        let warper = GridWarper::new((3, 3), (3, 3));
        let glimpse = warper.extract(&img, &identity_pose(2, &device)?)?;
        let diff: f32 = (glimpse - &img)?.abs()?.sum_all()?.to_scalar()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn identity_render_returns_glimpse() -> Result<()> {
        let device = Device::Cpu;
        let glimpse = Tensor::rand(0f32, 1f32, (1, 4, 4), &device)?;
        let warper = GridWarper::new((4, 4), (4, 4));
        let canvas = warper.render(&glimpse, &identity_pose(1, &device)?)?;
        let diff: f32 = (canvas - &glimpse)?.abs()?.sum_all()?.to_scalar()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn small_window_renders_inside_bounds() -> Result<()> {
        let device = Device::Cpu;
        // half-scale window shifted to the top-left corner
        let pose = Tensor::from_vec(vec![0.5f32, -0.5, 0.5, -0.5], (1, 4), &device)?;
        let glimpse = Tensor::ones((1, 2, 2), candle_core::DType::F32, &device)?;
        let warper = GridWarper::new((6, 6), (2, 2));
        let canvas = warper.render(&glimpse, &pose)?;
        assert_eq!(canvas.dims(), &[1, 6, 6]);
        let total: f32 = canvas.sum_all()?.to_scalar()?;
        // some pixels covered, but not the whole canvas
        assert!(total > 0. && total < 36.);
        // bottom-right quadrant untouched
        let br: f32 = canvas.narrow(1, 4, 2)?.narrow(2, 4, 2)?.sum_all()?.to_scalar()?;
        assert_eq!(br, 0.);
        Ok(())
    }

    #[test]
    fn mismatched_pose_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let img = Tensor::zeros((2, 3, 3), candle_core::DType::F32, &device)?;
        let bad_pose = Tensor::zeros((2, 3), candle_core::DType::F32, &device)?;
        let warper = GridWarper::new((3, 3), (2, 2));
        assert!(warper.extract(&img, &bad_pose).is_err());
        Ok(())
    }
}
