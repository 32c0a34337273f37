use std::collections::HashMap;
use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use fontdue::layout::{CoordinateSystem, GlyphRasterConfig, Layout, LayoutSettings, TextStyle};
use fontdue::Font;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

use crate::error::GenerateError;
use crate::schema::SpeechBubble;
use crate::wrap::wrap_text;

pub const CAPTION_FONT_SIZE: f32 = 48.0;
pub const CAPTION_LINE_HEIGHT: f32 = 48.0;
pub const CAPTION_LEFT_MARGIN: f32 = 10.0;
/// Deliberately narrow: produces many short lines, giving the caption a
/// vertical-block look under the panel.
pub const CAPTION_MAX_WIDTH: f32 = 210.0;
pub const CAPTION_MARGIN: u32 = 8;

const CAPTION_COLOR: [u8; 4] = [0, 0, 0, 255];

#[derive(Debug, Clone)]
struct GlyphBitmap {
    width: usize,
    height: usize,
    bitmap: Vec<u8>,
}

/// Measures and draws caption text with a cached fontdue font.
pub struct TextPainter {
    font: Font,
    font_size: f32,
    glyph_cache: HashMap<GlyphRasterConfig, GlyphBitmap>,
}

impl TextPainter {
    pub fn new(font_bytes: &[u8], font_size: f32) -> anyhow::Result<Self> {
        let font = Font::from_bytes(font_bytes, fontdue::FontSettings::default())
            .map_err(|error| anyhow::anyhow!("failed to parse caption font: {error}"))?;
        Ok(Self {
            font,
            font_size,
            glyph_cache: HashMap::new(),
        })
    }

    /// Rendered width of `text` at the painter's font size, taken from the
    /// same layout pass `draw_line` renders with, so measured and drawn
    /// widths agree.
    pub fn measure(&self, text: &str) -> f32 {
        let mut layout = Layout::new(CoordinateSystem::PositiveYDown);
        layout.reset(&LayoutSettings::default());
        layout.append(&[&self.font], &TextStyle::new(text, self.font_size, 0));
        layout
            .glyphs()
            .iter()
            .map(|glyph| glyph.x + glyph.width as f32)
            .fold(0.0_f32, f32::max)
    }

    /// Draws one line of text with its top edge at `(x, y)`.
    pub fn draw_line(&mut self, canvas: &mut RgbaImage, text: &str, x: f32, y: f32) {
        let mut layout = Layout::new(CoordinateSystem::PositiveYDown);
        layout.reset(&LayoutSettings {
            x,
            y,
            max_width: None,
            max_height: None,
            horizontal_align: fontdue::layout::HorizontalAlign::Left,
            vertical_align: fontdue::layout::VerticalAlign::Top,
            line_height: 1.0,
            wrap_style: fontdue::layout::WrapStyle::Letter,
            wrap_hard_breaks: true,
        });
        layout.append(&[&self.font], &TextStyle::new(text, self.font_size, 0));

        for glyph in layout.glyphs() {
            if glyph.width == 0 || glyph.height == 0 {
                continue;
            }
            let glyph_bitmap = self.glyph_cache.entry(glyph.key).or_insert_with(|| {
                let (_, bitmap) = self.font.rasterize_config(glyph.key);
                GlyphBitmap {
                    width: glyph.width,
                    height: glyph.height,
                    bitmap,
                }
            });
            blend_glyph(
                canvas,
                glyph.x.round() as i32,
                glyph.y.round() as i32,
                glyph_bitmap,
                CAPTION_COLOR,
            );
        }
    }
}

fn blend_glyph(canvas: &mut RgbaImage, x: i32, y: i32, glyph: &GlyphBitmap, color: [u8; 4]) {
    let (width, height) = canvas.dimensions();
    for row in 0..glyph.height {
        let py = y + row as i32;
        if py < 0 || py >= height as i32 {
            continue;
        }
        for col in 0..glyph.width {
            let px = x + col as i32;
            if px < 0 || px >= width as i32 {
                continue;
            }
            let mask = glyph.bitmap[row * glyph.width + col];
            if mask == 0 {
                continue;
            }
            let alpha = u16::from(mask) * u16::from(color[3]) / 255;
            let inv_alpha = 255 - alpha;
            let pixel = canvas.get_pixel_mut(px as u32, py as u32);
            for channel in 0..3 {
                let blended = (u16::from(color[channel]) * alpha
                    + u16::from(pixel.0[channel]) * inv_alpha)
                    / 255;
                pixel.0[channel] = blended as u8;
            }
            pixel.0[3] = 255;
        }
    }
}

/// Caption string for a bubble: `"Name: text"`, or the bare text when the
/// script gave no speaker name.
pub fn caption_string(bubble: &SpeechBubble) -> String {
    match &bubble.character_name {
        Some(name) => format!("{name}: {}", bubble.text),
        None => bubble.text.clone(),
    }
}

/// Pixel height of the extended canvas for a source image of `image_height`
/// carrying `line_count` caption lines.
pub fn caption_canvas_height(image_height: u32, line_count: usize) -> u32 {
    image_height + CAPTION_LINE_HEIGHT as u32 * line_count as u32 + 2 * CAPTION_MARGIN
}

/// Extends a base64 scene image downward and renders the wrapped speech
/// bubble beneath it. An absent bubble returns the input unchanged. Decode
/// failures are not retried here; they propagate to the orchestrator.
pub fn process_image(
    painter: &mut TextPainter,
    image_base64: &str,
    bubble: Option<&SpeechBubble>,
) -> Result<String, GenerateError> {
    let Some(bubble) = bubble else {
        return Ok(image_base64.to_owned());
    };

    let source = decode_base64_image(image_base64)?;
    let (width, height) = source.dimensions();

    let caption = caption_string(bubble);
    let lines = wrap_text(
        |text| painter.measure(text),
        &caption,
        CAPTION_LEFT_MARGIN,
        height as f32 + CAPTION_LINE_HEIGHT + CAPTION_MARGIN as f32,
        CAPTION_MAX_WIDTH,
        CAPTION_LINE_HEIGHT,
    );

    let mut canvas = RgbaImage::from_pixel(
        width,
        caption_canvas_height(height, lines.len()),
        Rgba([255, 255, 255, 255]),
    );
    image::imageops::overlay(&mut canvas, &source, 0, 0);

    for line in &lines {
        // Wrap positions are baselines; fontdue lays out from the top edge.
        painter.draw_line(&mut canvas, &line.text, line.x, line.y - CAPTION_LINE_HEIGHT);
    }

    encode_base64_png(canvas)
}

/// Decodes a base64 raster image, tolerating a `data:image/...;base64,`
/// prefix, into RGBA pixels.
pub fn decode_base64_image(data: &str) -> Result<RgbaImage, GenerateError> {
    let stripped = match data.find(";base64,") {
        Some(at) => &data[at + ";base64,".len()..],
        None => data,
    };
    let bytes = BASE64
        .decode(stripped.trim())
        .map_err(|error| GenerateError::Decode(format!("invalid base64: {error}")))?;
    let decoded = image::load_from_memory(&bytes)
        .map_err(|error| GenerateError::Decode(format!("unreadable image bytes: {error}")))?;
    Ok(decoded.to_rgba8())
}

/// Encodes RGBA pixels as a PNG and returns bare base64, no data-URI prefix.
pub fn encode_base64_png(canvas: RgbaImage) -> Result<String, GenerateError> {
    let mut buffer = Vec::new();
    DynamicImage::ImageRgba8(canvas)
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .map_err(|error| GenerateError::Decode(format!("failed to encode PNG: {error}")))?;
    Ok(BASE64.encode(buffer))
}

#[cfg(test)]
mod tests {
    use super::{
        caption_canvas_height, caption_string, decode_base64_image, encode_base64_png,
        process_image, TextPainter, CAPTION_FONT_SIZE, CAPTION_LEFT_MARGIN, CAPTION_LINE_HEIGHT,
        CAPTION_MARGIN, CAPTION_MAX_WIDTH,
    };
    use crate::error::GenerateError;
    use crate::schema::SpeechBubble;
    use crate::wrap::wrap_text;
    use image::{Rgba, RgbaImage};

    fn painter() -> TextPainter {
        let bytes = std::fs::read(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/assets/fonts/DejaVuSans.ttf"
        ))
        .expect("bundled font");
        TextPainter::new(&bytes, CAPTION_FONT_SIZE).expect("parse bundled font")
    }

    #[test]
    fn caption_prefixes_speaker_name_when_present() {
        let named = SpeechBubble {
            character_name: Some("Ada".to_owned()),
            text: "It works!".to_owned(),
        };
        assert_eq!(caption_string(&named), "Ada: It works!");

        let anonymous = SpeechBubble {
            character_name: None,
            text: "It works!".to_owned(),
        };
        assert_eq!(caption_string(&anonymous), "It works!");
    }

    #[test]
    fn canvas_height_adds_line_block_and_margins() {
        assert_eq!(caption_canvas_height(1024, 3), 1024 + 48 * 3 + 16);
        assert_eq!(caption_canvas_height(512, 1), 512 + 48 + 16);
    }

    #[test]
    fn decode_reads_dimensions_from_the_image_and_strips_data_uri() {
        let source = RgbaImage::from_pixel(3, 2, Rgba([10, 20, 30, 255]));
        let b64 = encode_base64_png(source).expect("encode");

        let plain = decode_base64_image(&b64).expect("decode bare base64");
        assert_eq!(plain.dimensions(), (3, 2));

        let prefixed = format!("data:image/png;base64,{b64}");
        let decoded = decode_base64_image(&prefixed).expect("decode data URI");
        assert_eq!(decoded.dimensions(), (3, 2));
        assert_eq!(decoded.get_pixel(0, 0), &Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn absent_bubble_passes_the_image_through_unchanged() {
        let mut painter = painter();
        let source =
            encode_base64_png(RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255]))).expect("encode");

        let out = process_image(&mut painter, &source, None).expect("pass-through");
        assert_eq!(out, source);
    }

    #[test]
    fn captioned_image_grows_by_the_wrapped_line_block() {
        let mut painter = painter();
        let source = RgbaImage::from_pixel(64, 48, Rgba([200, 40, 40, 255]));
        let b64 = encode_base64_png(source).expect("encode");
        let bubble = SpeechBubble {
            character_name: Some("Don".to_owned()),
            text: "The mill turns and the horse will not stay still".to_owned(),
        };

        let caption = caption_string(&bubble);
        let lines = wrap_text(
            |text| painter.measure(text),
            &caption,
            CAPTION_LEFT_MARGIN,
            48.0 + CAPTION_LINE_HEIGHT + CAPTION_MARGIN as f32,
            CAPTION_MAX_WIDTH,
            CAPTION_LINE_HEIGHT,
        );
        assert!(lines.len() > 1);

        let out = process_image(&mut painter, &b64, Some(&bubble)).expect("caption");
        let composed = decode_base64_image(&out).expect("decode output");
        assert_eq!(
            composed.dimensions(),
            (64, caption_canvas_height(48, lines.len()))
        );

        // The source survives the overlay and the band below it carries ink.
        assert_eq!(composed.get_pixel(0, 0), &Rgba([200, 40, 40, 255]));
        let band_has_ink = composed
            .enumerate_pixels()
            .any(|(_, y, pixel)| y >= 48 && pixel.0[0] < 128);
        assert!(band_has_ink);
    }

    #[test]
    fn wrapped_lines_render_inside_the_caption_width() {
        let mut painter = painter();
        let caption = "Don: The mill turns and the horse will not stay still for me";
        let lines = wrap_text(
            |text| painter.measure(text),
            caption,
            CAPTION_LEFT_MARGIN,
            CAPTION_LINE_HEIGHT,
            CAPTION_MAX_WIDTH,
            CAPTION_LINE_HEIGHT,
        );
        assert!(lines.len() > 1);

        let mut canvas = RgbaImage::from_pixel(600, 96, Rgba([255, 255, 255, 255]));
        for line in &lines {
            painter.draw_line(&mut canvas, line.text.trim_end(), CAPTION_LEFT_MARGIN, 8.0);
        }

        // One pixel of slack for glyph x rounding in the draw pass.
        let limit = (CAPTION_LEFT_MARGIN + CAPTION_MAX_WIDTH) as u32 + 1;
        let overrun = canvas
            .enumerate_pixels()
            .any(|(x, _, pixel)| x > limit && pixel.0[0] != 255);
        assert!(!overrun, "caption ink past the wrap width");
    }

    #[test]
    fn unreadable_bytes_surface_as_decode_errors() {
        let err = decode_base64_image("!!!not-base64!!!").expect_err("invalid base64");
        assert!(matches!(err, GenerateError::Decode(_)));

        let valid_b64_garbage = {
            use base64::{engine::general_purpose::STANDARD, Engine as _};
            STANDARD.encode(b"definitely not a png")
        };
        let err = decode_base64_image(&valid_b64_garbage).expect_err("invalid image bytes");
        assert!(matches!(err, GenerateError::Decode(_)));
    }
}
