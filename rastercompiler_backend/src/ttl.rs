//! Derives a trigger (TTL) waveform from a mask image, aligned to the raster pixel clock.
//!
//! The trigger output gates downstream equipment on selected pixels only. A mask pixel is
//! *active* when its intensity lies strictly above the midpoint of its type's intensity range
//! (`> 127.5` for 8-bit images, `> 0.5` for normalized floats, `true` for boolean masks).
//!
//! Masks of any size are accepted: a mask whose shape differs from `(total_y, total_x)` is
//! resized with nearest-neighbour sampling, which keeps every sample strictly on or off.
//! The binary grid is then expanded in scan order, each pixel held for `pixel_samples` ticks,
//! and scaled to the configured high voltage.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};

use crate::error::{ScanError, ScanResult};
use crate::geometry::ScanGeometry;

/// Pixel types accepted as trigger masks.
pub trait MaskIntensity: Copy {
    /// Top of the intensity range of the pixel type.
    const FULL_SCALE: f64;
    fn intensity(self) -> f64;

    fn is_active(self) -> bool {
        self.intensity() > Self::FULL_SCALE / 2.0
    }
}

impl MaskIntensity for u8 {
    const FULL_SCALE: f64 = u8::MAX as f64;
    fn intensity(self) -> f64 {
        self as f64
    }
}

impl MaskIntensity for u16 {
    const FULL_SCALE: f64 = u16::MAX as f64;
    fn intensity(self) -> f64 {
        self as f64
    }
}

impl MaskIntensity for bool {
    const FULL_SCALE: f64 = 1.0;
    fn intensity(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }
}

impl MaskIntensity for f32 {
    const FULL_SCALE: f64 = 1.0;
    fn intensity(self) -> f64 {
        self as f64
    }
}

impl MaskIntensity for f64 {
    const FULL_SCALE: f64 = 1.0;
    fn intensity(self) -> f64 {
        self
    }
}

/// Thresholds a mask at the midpoint of its intensity range.
pub fn binarize<T: MaskIntensity>(mask: ArrayView2<T>) -> Array2<bool> {
    mask.mapv(T::is_active)
}

/// Nearest-neighbour resize of a binary mask to `(rows, cols)`.
///
/// Destination pixel `d` samples source pixel `floor((d + 0.5) * src / dst)`, i.e. the source
/// pixel under the destination pixel's center.
pub fn resize_nearest(mask: ArrayView2<bool>, rows: usize, cols: usize) -> ScanResult<Array2<bool>> {
    let (src_rows, src_cols) = mask.dim();
    if src_rows == 0 || src_cols == 0 {
        return Err(ScanError::MaskDimension(format!(
            "cannot resize an empty {src_rows}x{src_cols} mask to {rows}x{cols}"
        )));
    }
    let nearest = |dst: usize, dst_len: usize, src_len: usize| {
        ((2 * dst + 1) * src_len / (2 * dst_len)).min(src_len - 1)
    };
    Ok(Array2::from_shape_fn((rows, cols), |(r, c)| {
        mask[[nearest(r, rows, src_rows), nearest(c, cols, src_cols)]]
    }))
}

/// Builds the trigger waveform of `mask` for one frame of `geometry`.
///
/// # Examples
///
/// ```
/// use ndarray::array;
/// use rastercompiler_backend::geometry::*;
/// use rastercompiler_backend::ttl::ttl_waveform;
///
/// let geometry = ScanGeometry::new(ScanParams {
///     numsteps_x: 2,
///     numsteps_y: 2,
///     padding_steps: 0,
///     dwell_time: 2e-6,
///     sample_rate: 1e6,
///     ..ScanParams::default()
/// })
/// .unwrap();
/// let mask: ndarray::Array2<u8> = array![[0, 255], [255, 0]];
/// let ttl = ttl_waveform(mask.view(), &geometry, 5.0).unwrap();
/// assert_eq!(ttl.to_vec(), vec![0., 0., 5., 5., 5., 5., 0., 0.]);
/// ```
pub fn ttl_waveform<T: MaskIntensity>(
    mask: ArrayView2<T>,
    geometry: &ScanGeometry,
    high_voltage: f64,
) -> ScanResult<Array1<f64>> {
    let scan_shape = (geometry.total_y(), geometry.total_x());
    let binary = binarize(mask);
    let binary = if binary.dim() == scan_shape {
        binary
    } else {
        resize_nearest(binary.view(), scan_shape.0, scan_shape.1)?
    };

    let pixel_samples = geometry.pixel_samples();
    // Row-major iteration is scan order: lines top to bottom, pixels left to right
    let ttl: Array1<f64> = binary
        .iter()
        .flat_map(|&active| std::iter::repeat(active).take(pixel_samples))
        .map(|active| if active { high_voltage } else { 0.0 })
        .collect();

    if ttl.len() != geometry.total_samples() {
        return Err(ScanError::MaskDimension(format!(
            "trigger waveform has {} samples, scan needs {}",
            ttl.len(),
            geometry.total_samples()
        )));
    }
    Ok(ttl)
}

/// Appends `ttl` to `waveform` as an additional output row.
pub fn append_trigger_row(waveform: &Array2<f64>, ttl: ArrayView1<f64>) -> ScanResult<Array2<f64>> {
    if ttl.len() != waveform.ncols() {
        return Err(ScanError::MaskDimension(format!(
            "trigger waveform has {} samples, drive waveform has {}",
            ttl.len(),
            waveform.ncols()
        )));
    }
    let mut stacked = Array2::zeros((waveform.nrows() + 1, waveform.ncols()));
    stacked
        .slice_mut(s![..waveform.nrows(), ..])
        .assign(waveform);
    stacked.row_mut(waveform.nrows()).assign(&ttl);
    Ok(stacked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ScanParams;
    use crate::waveform::raster_waveform;
    use ndarray::array;

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

    #[test]
    fn threshold_is_type_midpoint() {
        let mask: Array2<u8> = array![[0, 127, 128, 255]];
        assert_eq!(binarize(mask.view()), array![[false, false, true, true]]);
        let mask: Array2<f64> = array![[0.0, 0.5, 0.51, 1.0]];
        assert_eq!(binarize(mask.view()), array![[false, false, true, true]]);
        let mask = array![[true, false]];
        assert_eq!(binarize(mask.view()), mask);
    }

    #[test]
    fn single_active_row_is_contiguous() {
        let geometry = geometry(4, 3, 1, 3);
        let (rows, cols) = (geometry.total_y(), geometry.total_x());
        let active_row = 1;
        let mask = Array2::from_shape_fn((rows, cols), |(r, _)| if r == active_row { 255u8 } else { 0 });
        let ttl = ttl_waveform(mask.view(), &geometry, 5.0).unwrap();

        let line = cols * geometry.pixel_samples();
        assert_eq!(ttl.len(), geometry.total_samples());
        for (i, &v) in ttl.iter().enumerate() {
            let expected = if i / line == active_row { 5.0 } else { 0.0 };
            assert_eq!(v, expected, "sample {i}");
        }
        assert_eq!(ttl.iter().filter(|&&v| v == 5.0).count(), line);
    }

    #[test]
    fn resizes_with_nearest_neighbour() {
        let mask = array![[true, false], [false, true]];
        let resized = resize_nearest(mask.view(), 4, 4).unwrap();
        assert_eq!(
            resized,
            array![
                [true, true, false, false],
                [true, true, false, false],
                [false, false, true, true],
                [false, false, true, true]
            ]
        );
        let shrunk = resize_nearest(resized.view(), 2, 2).unwrap();
        assert_eq!(shrunk, mask);
    }

    #[test]
    fn mismatched_mask_is_resized_not_rejected() {
        let geometry = geometry(6, 4, 0, 2);
        let mask: Array2<u8> = Array2::from_elem((400, 400), 255);
        let ttl = ttl_waveform(mask.view(), &geometry, 3.3).unwrap();
        assert_eq!(ttl.len(), geometry.total_samples());
        assert!(ttl.iter().all(|&v| v == 3.3));
    }

    #[test]
    fn empty_mask_is_rejected() {
        let geometry = geometry(2, 2, 0, 1);
        let mask = Array2::<u8>::zeros((0, 3));
        assert!(matches!(
            ttl_waveform(mask.view(), &geometry, 5.0),
            Err(ScanError::MaskDimension(_))
        ));
    }

    #[test]
    fn trigger_row_is_appended() {
        let geometry = geometry(2, 2, 0, 1);
        let waveform = raster_waveform(&geometry);
        let ttl = array![0., 5., 5., 0.];
        let stacked = append_trigger_row(&waveform, ttl.view()).unwrap();
        assert_eq!(stacked.dim(), (3, 4));
        assert_eq!(stacked.row(0), waveform.row(0));
        assert_eq!(stacked.row(1), waveform.row(1));
        assert_eq!(stacked.row(2), ttl);

        let short = array![0., 5., 5.];
        assert!(matches!(
            append_trigger_row(&waveform, short.view()),
            Err(ScanError::MaskDimension(_))
        ));
    }
}
