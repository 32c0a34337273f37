use image::{Rgba, RgbaImage};
use rand::Rng;
use tracing::warn;

use crate::caption::encode_base64_png;

pub const DEFAULT_PADDING: u32 = 16;
pub const DEFAULT_WIGGLE: u32 = 50;

#[derive(Debug, Clone, Copy)]
pub struct MosaicOptions {
    /// Gap between columns and around the outer edge, in pixels.
    pub padding: u32,
    /// Maximum random offset applied per image. Also added to the canvas as
    /// a fixed allowance so jittered images never get cropped.
    pub wiggle: u32,
}

impl Default for MosaicOptions {
    fn default() -> Self {
        Self {
            padding: DEFAULT_PADDING,
            wiggle: DEFAULT_WIGGLE,
        }
    }
}

/// Placement for one image in the composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MosaicCell {
    pub index: usize,
    pub row: usize,
    pub col: usize,
    pub x: i64,
    pub y: i64,
}

/// Planned composite: canvas dimensions are fully determined by the input
/// sizes and options; cell positions carry the per-image jitter.
#[derive(Debug, Clone)]
pub struct MosaicLayout {
    pub columns: usize,
    pub width: u32,
    pub height: u32,
    pub cells: Vec<MosaicCell>,
}

/// Fixed heuristic: short strips stack vertically, longer ones use two
/// columns.
pub fn column_count(image_count: usize) -> usize {
    if image_count <= 3 {
        1
    } else {
        2
    }
}

/// Lays out images of the given `(width, height)` sizes into rows of
/// `column_count` cells, preserving input order. Row height is the tallest
/// image in the row; rows advance by `row_height + wiggle`. Jitter is drawn
/// uniformly from `[0, wiggle)` per image, so two calls with the same input
/// agree on dimensions but not on pixel placement.
pub fn plan_mosaic(
    sizes: &[(u32, u32)],
    options: MosaicOptions,
    rng: &mut impl Rng,
) -> Option<MosaicLayout> {
    if sizes.is_empty() {
        return None;
    }

    let columns = column_count(sizes.len());
    let rows: Vec<&[(u32, u32)]> = sizes.chunks(columns).collect();
    let base_width = sizes.iter().map(|&(w, _)| w).max().unwrap_or(0);

    let full_height: u32 = rows
        .iter()
        .map(|row| row.iter().map(|&(_, h)| h).max().unwrap_or(0))
        .sum();
    let width = base_width * columns as u32 + 2 * options.padding + columns as u32 * options.wiggle;
    let height = full_height + 2 * options.padding + rows.len() as u32 * options.wiggle;

    let mut cells = Vec::with_capacity(sizes.len());
    let mut index = 0;
    let mut row_top = i64::from(options.padding);
    for (row_number, row) in rows.iter().enumerate() {
        let row_height = row.iter().map(|&(_, h)| h).max().unwrap_or(0);
        for (col, _) in row.iter().enumerate() {
            cells.push(MosaicCell {
                index,
                row: row_number,
                col,
                x: col as i64 * i64::from(base_width + options.padding) + jitter(rng, options.wiggle),
                y: row_top + jitter(rng, options.wiggle),
            });
            index += 1;
        }
        row_top += i64::from(row_height + options.wiggle);
    }

    Some(MosaicLayout {
        columns,
        width,
        height,
        cells,
    })
}

fn jitter(rng: &mut impl Rng, wiggle: u32) -> i64 {
    // Mirrors `random() * wiggle`: empty range when wiggle is 0.
    (rng.gen::<f64>() * f64::from(wiggle)) as i64
}

/// Composites the images onto one white canvas and returns it as base64 PNG.
/// Soft-fails to `None` (empty input, unencodable canvas) rather than
/// erroring; callers treat that as "no composite produced".
pub fn compose_mosaic(
    images: &[RgbaImage],
    options: MosaicOptions,
    rng: &mut impl Rng,
) -> Option<String> {
    let sizes: Vec<(u32, u32)> = images.iter().map(|image| image.dimensions()).collect();
    let layout = plan_mosaic(&sizes, options, rng)?;

    let mut canvas = RgbaImage::from_pixel(layout.width, layout.height, Rgba([255, 255, 255, 255]));
    for cell in &layout.cells {
        image::imageops::overlay(&mut canvas, &images[cell.index], cell.x, cell.y);
    }

    match encode_base64_png(canvas) {
        Ok(encoded) => Some(encoded),
        Err(error) => {
            warn!(error = %error, "failed to encode mosaic canvas");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{column_count, compose_mosaic, plan_mosaic, MosaicOptions};
    use image::{Rgba, RgbaImage};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn options(padding: u32, wiggle: u32) -> MosaicOptions {
        MosaicOptions { padding, wiggle }
    }

    #[test]
    fn column_heuristic_is_one_up_to_three_then_two() {
        assert_eq!(column_count(1), 1);
        assert_eq!(column_count(2), 1);
        assert_eq!(column_count(3), 1);
        assert_eq!(column_count(4), 2);
        assert_eq!(column_count(7), 2);
    }

    #[test]
    fn canvas_dimensions_are_independent_of_jitter() {
        // Five images, two columns, three rows; heights vary per row.
        let sizes = vec![(100, 80), (100, 120), (100, 60), (100, 90), (100, 70)];
        let opts = options(16, 50);

        let mut rng_a = StdRng::seed_from_u64(1);
        let mut rng_b = StdRng::seed_from_u64(999);
        let a = plan_mosaic(&sizes, opts, &mut rng_a).expect("layout");
        let b = plan_mosaic(&sizes, opts, &mut rng_b).expect("layout");

        assert_eq!(a.columns, 2);
        // width = cols * base_width + 2 * padding + cols * wiggle
        assert_eq!(a.width, 2 * 100 + 32 + 2 * 50);
        // height = sum of row maxima (120 + 90 + 70) + 2 * padding + rows * wiggle
        assert_eq!(a.height, 280 + 32 + 3 * 50);
        assert_eq!((a.width, a.height), (b.width, b.height));
    }

    #[test]
    fn cells_pack_rows_left_to_right_top_to_bottom() {
        let sizes = vec![(64, 64); 5];
        let mut rng = StdRng::seed_from_u64(7);
        let layout = plan_mosaic(&sizes, options(10, 0), &mut rng).expect("layout");

        assert_eq!(layout.cells.len(), 5);
        let rows_cols: Vec<(usize, usize)> =
            layout.cells.iter().map(|c| (c.row, c.col)).collect();
        assert_eq!(rows_cols, vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 0)]);

        // With wiggle 0 the placement is exact.
        assert_eq!(layout.cells[1].x, 64 + 10);
        assert_eq!(layout.cells[0].y, 10);
        assert_eq!(layout.cells[2].y, 10 + 64);
    }

    #[test]
    fn jitter_stays_within_the_wiggle_allowance() {
        let sizes = vec![(32, 32); 6];
        let opts = options(0, 20);
        let mut rng = StdRng::seed_from_u64(42);
        let layout = plan_mosaic(&sizes, opts, &mut rng).expect("layout");

        for cell in &layout.cells {
            let base_x = cell.col as i64 * 32;
            assert!(cell.x >= base_x && cell.x < base_x + 20, "x out of range");
            let base_y = cell.row as i64 * (32 + 20);
            assert!(cell.y >= base_y && cell.y < base_y + 20, "y out of range");
        }
    }

    #[test]
    fn empty_input_soft_fails_to_none() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(plan_mosaic(&[], MosaicOptions::default(), &mut rng).is_none());
        assert!(compose_mosaic(&[], MosaicOptions::default(), &mut rng).is_none());
    }

    #[test]
    fn compose_produces_decodable_base64_of_planned_size() {
        let images = vec![
            RgbaImage::from_pixel(20, 10, Rgba([255, 0, 0, 255])),
            RgbaImage::from_pixel(20, 14, Rgba([0, 255, 0, 255])),
        ];
        let opts = options(4, 0);
        let mut rng = StdRng::seed_from_u64(3);
        let encoded = compose_mosaic(&images, opts, &mut rng).expect("composite");

        let decoded = crate::caption::decode_base64_image(&encoded).expect("decode");
        // 1 column: width = 20 + 8, height = 10 + 14 + 8.
        assert_eq!(decoded.dimensions(), (28, 32));
        // Background outside the images is white.
        assert_eq!(decoded.get_pixel(0, 0), &Rgba([255, 255, 255, 255]));
    }
}
