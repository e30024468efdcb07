//! Color types and utilities for tile reduction.
//!
//! This module contains color-related functionality including:
//! - `Rgb565` packed hardware color values
//! - `CieLab` perceptual color conversion and distance metrics
//! - `ColorReducer`, a global median-cut palette reducer

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::ops::{AddAssign, DivAssign};

use log::{debug, info};
use once_cell::sync::Lazy;

/// Number of representable RGB565 values.
const LUT_SIZE: usize = 0x10000;

/// A 16-bit packed 5:6:5 hardware color value.
///
/// Equality is bitwise. The derived raw-value ordering exists only so the
/// type can key ordered collections; perceptual ordering always goes
/// through [`CieLab::sort_by_axis`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rgb565 {
    pub value: u16,
}

impl Rgb565 {
    /// Round 8-bit RGB to the nearest 5/6 bit color. Note that simple
    /// bit truncation does NOT produce the best result.
    pub fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        let r5 = (u16::from(r) * 31 + 128) / 255;
        let g6 = (u16::from(g) * 63 + 128) / 255;
        let b5 = (u16::from(b) * 31 + 128) / 255;
        Rgb565 {
            value: (r5 << 11) | (g6 << 5) | b5,
        }
    }

    pub fn from_value(value: u16) -> Self {
        Rgb565 { value }
    }

    pub fn red(self) -> u8 {
        let r5 = (self.value >> 11) & 0x1f;
        (r5 * 255 / 31) as u8
    }

    pub fn green(self) -> u8 {
        let g6 = (self.value >> 5) & 0x3f;
        (g6 * 255 / 63) as u8
    }

    pub fn blue(self) -> u8 {
        let b5 = self.value & 0x1f;
        (b5 * 255 / 31) as u8
    }

    /// Make a slight (1 LSB) modification to the low byte.
    pub fn wiggle(self) -> Self {
        Rgb565 {
            value: self.value ^ 1,
        }
    }
}

/// CIE L*a*b* conversion of an [`Rgb565`] color, D50 white point,
/// gamma 2.2. Conversions run through a lazily built table covering the
/// whole 16-bit color space, so they are cheap and bit-for-bit
/// reproducible.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CieLab {
    pub l: f64,
    pub a: f64,
    pub b: f64,
}

const GAMMA: f64 = 2.2;
const EP: f64 = 216.0 / 24389.0;
const KA: f64 = 24389.0 / 27.0;
const D50_WHITE: [f64; 3] = [0.964220, 1.0, 0.825211];

/// Gamma-2.2 RGB to XYZ, adapted to the D50 white point.
const RGB_TO_XYZ: [[f64; 3]; 3] = [
    [0.79767484649999998, 0.13519170820000001, 0.031353408800000003],
    [0.28804020250000001, 0.71187413249999998, 8.5665099999999994e-05],
    [0.0, 0.0, 0.82521143890000004],
];

static LAB_LUT: Lazy<Vec<CieLab>> = Lazy::new(|| {
    (0..LUT_SIZE)
        .map(|v| CieLab::convert(Rgb565::from_value(v as u16)))
        .collect()
});

fn decode_gamma(v: u8) -> f64 {
    (f64::from(v) / 255.0).powf(GAMMA) * 255.0
}

fn f_cbrt(r: f64) -> f64 {
    let r = r / 255.0;
    if r > EP {
        r.powf(1.0 / 3.0)
    } else {
        (KA * r + 16.0) / 116.0
    }
}

impl From<Rgb565> for CieLab {
    fn from(color: Rgb565) -> Self {
        LAB_LUT[color.value as usize]
    }
}

impl AddAssign for CieLab {
    fn add_assign(&mut self, other: CieLab) {
        self.l += other.l;
        self.a += other.a;
        self.b += other.b;
    }
}

impl DivAssign<f64> for CieLab {
    fn div_assign(&mut self, divisor: f64) {
        self.l /= divisor;
        self.a /= divisor;
        self.b /= divisor;
    }
}

impl CieLab {
    /// Full conversion from packed RGB565, bypassing the lookup table.
    fn convert(color: Rgb565) -> CieLab {
        let red = decode_gamma(color.red());
        let green = decode_gamma(color.green());
        let blue = decode_gamma(color.blue());

        let mut xyz = [0.0f64; 3];
        for (i, row) in RGB_TO_XYZ.iter().enumerate() {
            xyz[i] = row[0] * red + row[1] * green + row[2] * blue;
            xyz[i] = f_cbrt(xyz[i] / D50_WHITE[i]);
        }

        CieLab {
            l: 116.0 * xyz[1] - 16.0,
            a: 500.0 * (xyz[0] - xyz[1]),
            b: 200.0 * (xyz[1] - xyz[2]),
        }
    }

    /// Perceptual squared distance. Symmetric, zero iff equal.
    pub fn squared_error(self, other: CieLab) -> f64 {
        let dl = self.l - other.l;
        let da = self.a - other.a;
        let db = self.b - other.b;
        dl * dl + da * da + db * db
    }

    /// Channel value along a numbered axis (0 = L, 1 = a, 2 = b).
    pub fn axis(self, axis: usize) -> f64 {
        match axis {
            0 => self.l,
            1 => self.a,
            _ => self.b,
        }
    }

    /// Of all the colors given, find the component axis which occupies
    /// the widest range of values. This is the axis that benefits most
    /// from a sort or split.
    pub fn find_major_axis(colors: &[Rgb565]) -> usize {
        let mut lo = [f64::MAX; 3];
        let mut hi = [f64::MIN; 3];

        for &color in colors {
            let lab = CieLab::from(color);
            for axis in 0..3 {
                lo[axis] = lo[axis].min(lab.axis(axis));
                hi[axis] = hi[axis].max(lab.axis(axis));
            }
        }

        let mut major = 0;
        let mut max_diff = f64::MIN;
        for axis in 0..3 {
            let diff = hi[axis] - lo[axis];
            if diff > max_diff {
                max_diff = diff;
                major = axis;
            }
        }
        major
    }

    /// Stable sort of packed colors by their Lab value along one axis.
    pub fn sort_by_axis(colors: &mut [Rgb565], axis: usize) {
        colors.sort_by(|a, b| {
            CieLab::from(*a)
                .axis(axis)
                .partial_cmp(&CieLab::from(*b).axis(axis))
                .unwrap_or(Ordering::Equal)
        });
    }
}

/// One median-cut box: a half-open range of indices into the reducer's
/// color pool.
#[derive(Debug, Clone, Copy)]
struct ColorBox {
    begin: usize,
    end: usize,
}

/// Maintains a pool of color values, reduces them to a shared palette
/// subject to a maximum-error budget, and answers nearest-color lookups
/// against the reduced palette.
///
/// Every occurrence of every pixel should be `add()`ed, so that a color's
/// prevalence in the input weights the reduction. Internally this is a
/// median cut over CIE L*a*b* space; the number of output colors is not
/// fixed in advance but determined by the error budget.
pub struct ColorReducer {
    colors: Vec<Rgb565>,
    boxes: Vec<ColorBox>,
    box_queue: VecDeque<usize>,
    inverse_lut: Vec<u16>,
    inverse_stamps: Vec<u32>,
    newest_stamp: u32,
    reduced: bool,
}

impl Default for ColorReducer {
    fn default() -> Self {
        Self::new()
    }
}

impl ColorReducer {
    pub fn new() -> Self {
        ColorReducer {
            colors: Vec::new(),
            boxes: Vec::new(),
            box_queue: VecDeque::new(),
            inverse_lut: vec![0; LUT_SIZE],
            inverse_stamps: vec![0; LUT_SIZE],
            newest_stamp: 1,
            reduced: false,
        }
    }

    /// Record one occurrence of a color.
    pub fn add(&mut self, color: Rgb565) {
        self.colors.push(color);
    }

    /// Number of colors in the reduced palette.
    pub fn num_colors(&self) -> usize {
        self.boxes.len()
    }

    /// Nearest reduced color to the given color. Only valid after
    /// [`ColorReducer::reduce`] has run.
    pub fn nearest(&mut self, color: Rgb565) -> Rgb565 {
        assert!(
            self.reduced,
            "ColorReducer::nearest called before reduce()"
        );
        let v = color.value as usize;
        if self.inverse_stamps[v] != self.newest_stamp {
            self.update_inverse_lut(color);
        }
        self.box_median(self.boxes[self.inverse_lut[v] as usize])
    }

    /// Split the color pool until every observed color is within
    /// `max_mse` squared error of its nearest box median, or no box can
    /// be split any further.
    pub fn reduce(&mut self, max_mse: f64) {
        info!(
            "optimizing palette over {} color samples",
            self.colors.len()
        );
        self.reduced = true;

        if self.colors.is_empty() {
            return;
        }

        let root = ColorBox {
            begin: 0,
            end: self.colors.len(),
        };
        self.boxes.clear();
        self.boxes.push(root);
        self.box_queue.clear();
        self.box_queue.push_back(0);
        self.newest_stamp += 1;

        // Colors that still need to pass the error check. Error
        // measurement is much more expensive than splitting, so solved
        // colors are popped permanently and the check stops at the first
        // failure each round.
        let mut seen = vec![false; LUT_SIZE];
        for &c in &self.colors {
            seen[c.value as usize] = true;
        }
        let mut error_stack: Vec<Rgb565> = (0..LUT_SIZE)
            .filter(|&v| seen[v])
            .map(|v| Rgb565::from_value(v as u16))
            .collect();

        loop {
            while let Some(&color) = error_stack.last() {
                let mse = CieLab::from(self.nearest(color)).squared_error(CieLab::from(color));
                if mse <= max_mse {
                    error_stack.pop();
                } else {
                    break;
                }
            }

            if self.boxes.len() % 64 == 0 || error_stack.is_empty() {
                debug!("{} colors in palette", self.boxes.len());
            }

            if error_stack.is_empty() {
                break;
            }

            let Some(box_index) = self.box_queue.pop_front() else {
                break;
            };

            let b = self.boxes[box_index];
            let major = CieLab::find_major_axis(&self.colors[b.begin..b.end]);
            CieLab::sort_by_axis(&mut self.colors[b.begin..b.end], major);
            self.split_box(box_index);

            // The pool was reordered; all inverse LUT entries are stale.
            self.newest_stamp += 1;
        }

        info!("reduced to {} colors", self.boxes.len());
    }

    fn box_median(&self, b: ColorBox) -> Rgb565 {
        self.colors[(b.begin + b.end) >> 1]
    }

    /// Regenerate one entry in the lookup table which maps RGB565 colors
    /// onto the reduced palette.
    fn update_inverse_lut(&mut self, color: Rgb565) {
        let reference = CieLab::from(color);
        let mut best = 0usize;
        let mut distance = f64::MAX;

        for (i, &b) in self.boxes.iter().enumerate() {
            let err = reference.squared_error(CieLab::from(self.box_median(b)));
            if err < distance {
                distance = err;
                best = i;
            }
        }

        self.inverse_lut[color.value as usize] = best as u16;
        self.inverse_stamps[color.value as usize] = self.newest_stamp;
    }

    /// Split a box roughly in half. The split must land on a boundary
    /// between two different colors, so boxes never get smaller than one
    /// device color; search outward from the middle for the nearest such
    /// boundary. Returns false if the box is all one color.
    fn split_box(&mut self, box_index: usize) -> bool {
        let b = self.boxes[box_index];
        let max_steps = (b.end - b.begin + 1) >> 1;
        let middle = (b.begin + b.end) >> 1;

        for step in 0..max_steps {
            let split = middle + step;
            if split >= b.begin && split + 1 < b.end && self.colors[split] != self.colors[split + 1]
            {
                self.split_box_at(box_index, split);
                return true;
            }

            if middle >= step {
                let split = middle - step;
                if split >= b.begin
                    && split + 1 < b.end
                    && self.colors[split] != self.colors[split + 1]
                {
                    self.split_box_at(box_index, split);
                    return true;
                }
            }
        }

        false
    }

    /// Split a box between `at` and `at + 1`; both halves go back on the
    /// queue.
    fn split_box_at(&mut self, box_index: usize, at: usize) {
        let new_box = ColorBox {
            begin: at + 1,
            end: self.boxes[box_index].end,
        };
        self.boxes[box_index].end = new_box.begin;

        self.box_queue.push_back(box_index);
        self.box_queue.push_back(self.boxes.len());
        self.boxes.push(new_box);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rgb565_rounds_to_nearest() {
        assert_eq!(Rgb565::from_rgb(255, 0, 0).value, 0xf800);
        assert_eq!(Rgb565::from_rgb(0, 255, 0).value, 0x07e0);
        assert_eq!(Rgb565::from_rgb(0, 0, 255).value, 0x001f);
        assert_eq!(Rgb565::from_rgb(255, 255, 255).value, 0xffff);
        // 4 is closer to channel value 0 than to the next 5-bit step.
        assert_eq!(Rgb565::from_rgb(4, 0, 0).value, 0x0000);
    }

    #[test]
    fn rgb565_channel_round_trip() {
        for v in [0u16, 0x4f, 0x1234, 0xf800, 0xffff] {
            let c = Rgb565::from_value(v);
            assert_eq!(Rgb565::from_rgb(c.red(), c.green(), c.blue()), c);
        }
    }

    #[test]
    fn wiggle_changes_low_byte() {
        let c = Rgb565::from_value(0x004f);
        assert_eq!(c.wiggle().value, 0x004e);
        assert_ne!(c.wiggle().value & 0xff, 0x4f);
    }

    #[test]
    fn lab_error_is_symmetric_and_zero_on_self() {
        let a = CieLab::from(Rgb565::from_rgb(200, 30, 40));
        let b = CieLab::from(Rgb565::from_rgb(10, 90, 220));
        assert_eq!(a.squared_error(a), 0.0);
        assert_relative_eq!(a.squared_error(b), b.squared_error(a));
        assert!(a.squared_error(b) > 0.0);
    }

    #[test]
    fn major_axis_tracks_luminance_ramp() {
        // A pure gray ramp varies only along L.
        let colors: Vec<Rgb565> = (0..8)
            .map(|i| Rgb565::from_rgb(i * 32, i * 32, i * 32))
            .collect();
        assert_eq!(CieLab::find_major_axis(&colors), 0);
    }

    #[test]
    fn reducer_keeps_distant_colors_under_tight_budget() {
        let red = Rgb565::from_rgb(255, 0, 0);
        let blue = Rgb565::from_rgb(0, 0, 255);

        let mut reducer = ColorReducer::new();
        for _ in 0..100 {
            reducer.add(red);
            reducer.add(blue);
        }
        reducer.reduce(1.0);

        assert_eq!(reducer.num_colors(), 2);
        assert_eq!(reducer.nearest(red), red);
        assert_eq!(reducer.nearest(blue), blue);
    }

    #[test]
    fn reducer_merges_everything_under_huge_budget() {
        let mut reducer = ColorReducer::new();
        for v in 0..64u16 {
            reducer.add(Rgb565::from_value(v));
        }
        reducer.reduce(1e9);
        assert_eq!(reducer.num_colors(), 1);
    }

    #[test]
    #[should_panic(expected = "before reduce")]
    fn nearest_before_reduce_is_a_bug() {
        let mut reducer = ColorReducer::new();
        reducer.add(Rgb565::from_rgb(1, 2, 3));
        reducer.nearest(Rgb565::from_rgb(1, 2, 3));
    }
}
