//! Compiles a [`ScanGeometry`] into the analog drive signals of the two galvo mirrors.
//!
//! ## Layout
//!
//! [`raster_waveform`] returns a `2 x total_samples` array. Row 0 drives the fast (x) mirror,
//! row 1 the slow (y) mirror; column `i` is the voltage pair generated on clock tick `i`.
//!
//! - **x**: `total_x` levels spanning `[-amp_x, amp_x] + offset_x` with the geometry's
//!   [`RowSpacing`](crate::geometry::RowSpacing), each held for `pixel_samples` ticks. The
//!   resulting sweep is repeated once per scan line.
//! - **y**: `total_y` levels from `amp_y` down to `-amp_y` (both included) around `offset_y`,
//!   descending so that the first scan line is the top row of the image. Each level is held for one full sweep of
//!   the fast axis (`total_x * pixel_samples` ticks).
//!
//! Both rows are passed through [`fit_to_len`] before they are stacked, so the output always
//! has exactly `total_samples` columns.

use ndarray::{Array1, Array2};

use crate::geometry::{RowSpacing, ScanGeometry};

/// Pads `samples` with copies of its last value, or truncates it, to exactly `len` samples.
///
/// An empty input is padded with zeros.
///
/// # Examples
///
/// ```
/// use ndarray::array;
/// use rastercompiler_backend::waveform::fit_to_len;
///
/// assert_eq!(fit_to_len(array![1., 2.], 4), array![1., 2., 2., 2.]);
/// assert_eq!(fit_to_len(array![1., 2., 3.], 2), array![1., 2.]);
/// ```
pub fn fit_to_len(samples: Array1<f64>, len: usize) -> Array1<f64> {
    if samples.len() == len {
        return samples;
    }
    let fill = samples.last().copied().unwrap_or(0.0);
    samples
        .iter()
        .copied()
        .chain(std::iter::repeat(fill))
        .take(len)
        .collect()
}

/// Voltage levels of one fast-axis sweep, padding positions included.
pub fn x_levels(geometry: &ScanGeometry) -> Array1<f64> {
    geometry
        .spacing()
        .levels(-geometry.amp_x(), geometry.amp_x(), geometry.total_x())
        + geometry.offset_x()
}

/// Voltage levels of the scan lines, top line first. The first and last lines sit on the
/// two ends of the slow-axis range whatever the fast-axis spacing.
pub fn y_levels(geometry: &ScanGeometry) -> Array1<f64> {
    RowSpacing::EndpointInclusive.levels(geometry.amp_y(), -geometry.amp_y(), geometry.total_y())
        + geometry.offset_y()
}

/// Fast-axis drive signal for a full frame.
pub fn x_waveform(geometry: &ScanGeometry) -> Array1<f64> {
    let levels = x_levels(geometry);
    let pixel_samples = geometry.pixel_samples();
    let sweep: Vec<f64> = levels
        .iter()
        .flat_map(|&v| std::iter::repeat(v).take(pixel_samples))
        .collect();
    let tiled: Array1<f64> = (0..geometry.total_y())
        .flat_map(|_| sweep.iter().copied())
        .collect();
    fit_to_len(tiled, geometry.total_samples())
}

/// Slow-axis drive signal for a full frame.
pub fn y_waveform(geometry: &ScanGeometry) -> Array1<f64> {
    let line_samples = geometry.total_x() * geometry.pixel_samples();
    let held: Array1<f64> = y_levels(geometry)
        .iter()
        .flat_map(|&v| std::iter::repeat(v).take(line_samples))
        .collect();
    fit_to_len(held, geometry.total_samples())
}

/// Compiles the two-row `[x, y]` drive waveform of one raster frame.
///
/// The result depends on nothing but `geometry`: compiling the same geometry twice yields
/// bit-identical arrays.
///
/// # Examples
///
/// ```
/// use rastercompiler_backend::geometry::*;
/// use rastercompiler_backend::waveform::raster_waveform;
///
/// let geometry = ScanGeometry::new(ScanParams {
///     amp_x: 1.0,
///     amp_y: 1.0,
///     offset_x: 0.0,
///     offset_y: 0.0,
///     numsteps_x: 4,
///     numsteps_y: 2,
///     padding_steps: 0,
///     dwell_time: 1e-6,
///     sample_rate: 1e6,
///     ..ScanParams::default()
/// })
/// .unwrap();
/// let waveform = raster_waveform(&geometry);
/// assert_eq!(waveform.shape(), &[2, 8]);
/// assert_eq!(waveform.row(0).to_vec(), vec![-1., -0.5, 0., 0.5, -1., -0.5, 0., 0.5]);
/// assert_eq!(waveform.row(1).to_vec(), vec![1., 1., 1., 1., -1., -1., -1., -1.]);
/// ```
pub fn raster_waveform(geometry: &ScanGeometry) -> Array2<f64> {
    let mut waveform = Array2::zeros((2, geometry.total_samples()));
    waveform.row_mut(0).assign(&x_waveform(geometry));
    waveform.row_mut(1).assign(&y_waveform(geometry));
    waveform
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ScanParams;
    use ndarray::array;

    fn geometry(params: ScanParams) -> ScanGeometry {
        ScanGeometry::new(params).unwrap()
    }

    fn small(spacing: RowSpacing) -> ScanParams {
        ScanParams {
            amp_x: 0.5,
            amp_y: 0.25,
            offset_x: -1.2,
            offset_y: 1.5,
            numsteps_x: 5,
            numsteps_y: 3,
            padding_steps: 2,
            dwell_time: 3e-6,
            sample_rate: 1e6,
            spacing,
        }
    }

    #[test]
    fn fit_to_len_clamps() {
        assert_eq!(fit_to_len(array![1., 2., 3.], 3), array![1., 2., 3.]);
        assert_eq!(fit_to_len(array![1., 2., 3.], 5), array![1., 2., 3., 3., 3.]);
        assert_eq!(fit_to_len(array![1., 2., 3.], 1), array![1.]);
        assert_eq!(fit_to_len(Array1::zeros(0), 2), array![0., 0.]);
    }

    #[test]
    fn waveform_length_matches_geometry() {
        for spacing in [RowSpacing::EndpointExclusive, RowSpacing::EndpointInclusive] {
            let geometry = geometry(small(spacing));
            let waveform = raster_waveform(&geometry);
            assert_eq!(waveform.nrows(), 2);
            assert_eq!(waveform.ncols(), geometry.total_samples());
            assert_eq!(waveform.ncols(), 9 * 3 * 3);
        }
    }

    #[test]
    fn waveform_stays_in_range() {
        for spacing in [RowSpacing::EndpointExclusive, RowSpacing::EndpointInclusive] {
            let geometry = geometry(small(spacing));
            let waveform = raster_waveform(&geometry);
            let [x_min, x_max, y_min, y_max] = geometry.voltage_extent();
            let eps = 1e-12;
            assert!(waveform.row(0).iter().all(|&v| v >= x_min - eps && v <= x_max + eps));
            assert!(waveform.row(1).iter().all(|&v| v >= y_min - eps && v <= y_max + eps));
        }
    }

    #[test]
    fn waveform_is_deterministic() {
        let geometry = geometry(small(RowSpacing::EndpointExclusive));
        let first = raster_waveform(&geometry);
        let second = raster_waveform(&geometry);
        assert!(first
            .iter()
            .zip(second.iter())
            .all(|(a, b)| a.to_bits() == b.to_bits()));
    }

    #[test]
    fn x_dwells_and_tiles() {
        let geometry = geometry(small(RowSpacing::EndpointExclusive));
        let x = x_waveform(&geometry);
        let levels = x_levels(&geometry);
        let sweep_len = geometry.total_x() * geometry.pixel_samples();
        for (i, &v) in x.iter().enumerate() {
            let level = (i % sweep_len) / geometry.pixel_samples();
            assert_eq!(v, levels[level]);
        }
        // Exclusive spacing never reaches the positive amplitude
        assert!((levels[0] + 1.7).abs() < 1e-12);
        assert!(levels.iter().all(|&v| v < -0.7));
    }

    #[test]
    fn y_holds_for_one_sweep_and_descends() {
        let geometry = geometry(small(RowSpacing::EndpointInclusive));
        let y = y_waveform(&geometry);
        let levels = y_levels(&geometry);
        assert_eq!(levels.to_vec(), vec![1.75, 1.5, 1.25]);
        let sweep_len = geometry.total_x() * geometry.pixel_samples();
        for (i, &v) in y.iter().enumerate() {
            assert_eq!(v, levels[i / sweep_len]);
        }
    }

    #[test]
    fn scan_lines_reach_both_ends_of_the_slow_axis() {
        let two_lines = geometry(ScanParams {
            amp_y: 1.0,
            offset_y: 0.0,
            numsteps_y: 2,
            ..ScanParams::default()
        });
        assert_eq!(two_lines.spacing(), RowSpacing::EndpointExclusive);
        assert_eq!(y_levels(&two_lines).to_vec(), vec![1.0, -1.0]);
        assert_eq!(two_lines.voltage_extent()[2..], [-1.0, 1.0]);

        for spacing in [RowSpacing::EndpointExclusive, RowSpacing::EndpointInclusive] {
            let geometry = geometry(small(spacing));
            let [_, _, y_min, y_max] = geometry.voltage_extent();
            let levels = y_levels(&geometry);
            assert_eq!(levels[0], y_max);
            assert_eq!(levels[levels.len() - 1], y_min);
        }
    }

    #[test]
    fn single_line_scan() {
        let geometry = geometry(ScanParams {
            numsteps_y: 1,
            ..small(RowSpacing::EndpointInclusive)
        });
        let waveform = raster_waveform(&geometry);
        assert!(waveform.row(1).iter().all(|&v| v == 1.75));
    }
}
