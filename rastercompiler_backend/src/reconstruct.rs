//! Turns raw synchronously-sampled input streams back into images.
//!
//! Input sample `i` was taken on the same clock tick as output sample `i`, so the flat stream of
//! one channel follows the scan order of [`crate::waveform::raster_waveform`]: scan lines top to
//! bottom, positions left to right within a line, `pixel_samples` consecutive samples per
//! position. Reconstruction therefore reshapes each channel to
//! `(total_y, total_x, pixel_samples)`, averages the dwell samples of every position and crops
//! the padding columns, producing a `(total_y, numsteps_x)` image per channel.

use ndarray::{s, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

use crate::error::{ScanError, ScanResult};
use crate::geometry::ScanGeometry;

fn shape_error(found: usize, geometry: &ScanGeometry) -> ScanError {
    ScanError::ReconstructionShape {
        found,
        expected: geometry.total_samples(),
        total_y: geometry.total_y(),
        total_x: geometry.total_x(),
        pixel_samples: geometry.pixel_samples(),
    }
}

/// Averages the dwell samples of every scan position, returning the uncropped
/// `(total_y, total_x)` grid.
///
/// A stream whose length differs from `geometry.total_samples()` is rejected with
/// [`ScanError::ReconstructionShape`]; samples are never dropped or invented to make it fit.
pub fn average_pixels(raw: ArrayView1<f64>, geometry: &ScanGeometry) -> ScanResult<Array2<f64>> {
    if raw.len() != geometry.total_samples() {
        return Err(shape_error(raw.len(), geometry));
    }
    let cube = raw
        .to_shape((
            geometry.total_y(),
            geometry.total_x(),
            geometry.pixel_samples(),
        ))
        .map_err(|_| shape_error(raw.len(), geometry))?;
    cube.mean_axis(Axis(2))
        .ok_or_else(|| shape_error(raw.len(), geometry))
}

/// Removes `padding_steps` columns from both sides of an uncropped grid.
///
/// With `padding_steps == 0` the grid is returned unchanged.
pub fn crop_padding(pixels: ArrayView2<f64>, padding_steps: usize) -> Array2<f64> {
    let start = padding_steps.min(pixels.ncols());
    let stop = pixels.ncols().saturating_sub(padding_steps).max(start);
    pixels.slice(s![.., start..stop]).to_owned()
}

/// Reconstructs the cropped `(total_y, numsteps_x)` image of a single channel.
///
/// # Examples
///
/// ```
/// use ndarray::{array, Array1};
/// use rastercompiler_backend::geometry::*;
/// use rastercompiler_backend::reconstruct::reconstruct_channel;
///
/// let geometry = ScanGeometry::new(ScanParams {
///     numsteps_x: 1,
///     numsteps_y: 2,
///     padding_steps: 1,
///     dwell_time: 4e-6,
///     sample_rate: 1e6,
///     ..ScanParams::default()
/// })
/// .unwrap();
/// let raw: Array1<f64> = (1..=6)
///     .flat_map(|v| std::iter::repeat(v as f64).take(4))
///     .collect();
/// let image = reconstruct_channel(raw.view(), &geometry).unwrap();
/// assert_eq!(image, array![[2.], [5.]]);
/// ```
pub fn reconstruct_channel(
    raw: ArrayView1<f64>,
    geometry: &ScanGeometry,
) -> ScanResult<Array2<f64>> {
    let pixels = average_pixels(raw, geometry)?;
    Ok(crop_padding(pixels.view(), geometry.padding_steps()))
}

/// Reconstructs one image per row of `raw` (`channels x total_samples`), keeping the order of
/// the input channels.
///
/// Channels are independent and are reconstructed in parallel.
pub fn reconstruct(raw: ArrayView2<f64>, geometry: &ScanGeometry) -> ScanResult<Vec<Array2<f64>>> {
    if raw.ncols() != geometry.total_samples() {
        return Err(shape_error(raw.ncols(), geometry));
    }
    let channels: Vec<ArrayView1<f64>> = raw.outer_iter().collect();
    channels
        .par_iter()
        .map(|chan| reconstruct_channel(chan.view(), geometry))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ScanParams;
    use ndarray::{array, Array1};

    fn geometry(numsteps_x: usize, numsteps_y: usize, padding_steps: usize, pixel_samples: usize) -> ScanGeometry {
        ScanGeometry::new(ScanParams {
            numsteps_x,
            numsteps_y,
            padding_steps,
            dwell_time: pixel_samples as f64 * 1e-6,
            sample_rate: 1e6,
            ..ScanParams::default()
        })
        .unwrap()
    }

    /// Expands a `(total_y, total_x)` pattern into scan order.
    fn expand(pattern: &Array2<f64>, pixel_samples: usize) -> Array1<f64> {
        pattern
            .iter()
            .flat_map(|&v| std::iter::repeat(v).take(pixel_samples))
            .collect()
    }

    #[test]
    fn averages_then_crops() {
        let geometry = geometry(1, 2, 1, 4);
        let raw = array![
            1., 1., 1., 1., 2., 2., 2., 2., 3., 3., 3., 3., 4., 4., 4., 4., 5., 5., 5., 5., 6., 6.,
            6., 6.
        ];
        let pixels = average_pixels(raw.view(), &geometry).unwrap();
        assert_eq!(pixels, array![[1., 2., 3.], [4., 5., 6.]]);
        let image = reconstruct_channel(raw.view(), &geometry).unwrap();
        assert_eq!(image, array![[2.], [5.]]);
        assert_eq!(image.dim(), geometry.image_shape());
    }

    #[test]
    fn rejects_wrong_length() {
        let geometry = geometry(1, 2, 1, 4);
        let raw = Array1::<f64>::zeros(23);
        assert_eq!(
            reconstruct_channel(raw.view(), &geometry),
            Err(ScanError::ReconstructionShape {
                found: 23,
                expected: 24,
                total_y: 2,
                total_x: 3,
                pixel_samples: 4,
            })
        );
        let raw = Array2::<f64>::zeros((2, 25));
        assert!(matches!(
            reconstruct(raw.view(), &geometry),
            Err(ScanError::ReconstructionShape { found: 25, .. })
        ));
    }

    #[test]
    fn recovers_pattern_without_padding() {
        let geometry = geometry(5, 3, 0, 3);
        let pattern = Array2::from_shape_fn((3, 5), |(r, c)| (r * 10 + c) as f64 * 0.1);
        let raw = expand(&pattern, 3);
        let image = reconstruct_channel(raw.view(), &geometry).unwrap();
        assert_eq!(image.dim(), (3, 5));
        for (a, b) in image.iter().zip(pattern.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn crop_removes_outer_columns() {
        let k = 2;
        let geometry = geometry(3, 2, k, 2);
        let pattern = Array2::from_shape_fn((2, 7), |(r, c)| (r * 7 + c) as f64);
        let raw = expand(&pattern, 2);
        let uncropped = average_pixels(raw.view(), &geometry).unwrap();
        let image = reconstruct_channel(raw.view(), &geometry).unwrap();
        assert_eq!(image.ncols(), geometry.numsteps_x());
        assert_eq!(image, uncropped.slice(s![.., k..7 - k]).to_owned());
        assert_eq!(image, array![[2., 3., 4.], [9., 10., 11.]]);
    }

    #[test]
    fn crop_with_zero_padding_is_identity() {
        let pixels = array![[1., 2.], [3., 4.]];
        assert_eq!(crop_padding(pixels.view(), 0), pixels);
    }

    #[test]
    fn multichannel_keeps_order() {
        let geometry = geometry(2, 2, 1, 2);
        let first = Array2::from_shape_fn((2, 4), |(r, c)| (r * 4 + c) as f64);
        let second = first.mapv(|v| -v);
        let mut raw = Array2::zeros((2, geometry.total_samples()));
        raw.row_mut(0).assign(&expand(&first, 2));
        raw.row_mut(1).assign(&expand(&second, 2));

        let images = reconstruct(raw.view(), &geometry).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0], array![[1., 2.], [5., 6.]]);
        assert_eq!(images[1], array![[-1., -2.], [-5., -6.]]);
    }
}
