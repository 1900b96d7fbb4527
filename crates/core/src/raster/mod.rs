//! Small raster helpers shared by the thumbnail drawing code and the renderer.

use image::{imageops, Rgb, RgbImage};

pub const BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
pub const WAVEFORM: Rgb<u8> = Rgb([0, 200, 0]);

/// Integer pixel rectangle inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Restricts the rectangle to the bounds of `image`.
    pub fn clipped_to(&self, image: &RgbImage) -> Self {
        let x = self.x.min(image.width());
        let y = self.y.min(image.height());
        Self {
            x,
            y,
            width: self.width.min(image.width() - x),
            height: self.height.min(image.height() - y),
        }
    }
}

/// Allocates an image filled with the background colour.
pub fn blank(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, BACKGROUND)
}

pub fn clear(image: &mut RgbImage) {
    for pixel in image.pixels_mut() {
        *pixel = BACKGROUND;
    }
}

/// Scales the first `src_width` columns of `src` into `dest_width` columns of
/// `dest` starting at `dest_x`, covering the full destination height.
pub fn composite_scaled(
    dest: &mut RgbImage,
    dest_x: u32,
    dest_width: u32,
    src: &RgbImage,
    src_width: u32,
) {
    let src_width = src_width.min(src.width());
    let dest_width = dest_width.min(dest.width().saturating_sub(dest_x));
    if src_width == 0 || dest_width == 0 || src.height() == 0 || dest.height() == 0 {
        return;
    }

    let section = imageops::crop_imm(src, 0, 0, src_width, src.height()).to_image();
    let scaled = imageops::resize(
        &section,
        dest_width,
        dest.height(),
        imageops::FilterType::Triangle,
    );
    imageops::replace(dest, &scaled, i64::from(dest_x), 0);
}

/// Copies out a column range of `image`. Out-of-range requests are clipped;
/// an empty range yields a zero-sized image.
pub fn crop_columns(image: &RgbImage, x: i64, width: i64) -> RgbImage {
    let start = x.clamp(0, i64::from(image.width()));
    let end = x.saturating_add(width).clamp(start, i64::from(image.width()));
    if end <= start {
        return RgbImage::new(0, 0);
    }

    imageops::crop_imm(image, start as u32, 0, (end - start) as u32, image.height()).to_image()
}

/// Draws a vertical line covering rows `top..=bottom` of column `x`.
pub(crate) fn vertical_line(image: &mut RgbImage, x: u32, top: u32, bottom: u32, colour: Rgb<u8>) {
    if x >= image.width() || image.height() == 0 {
        return;
    }
    let bottom = bottom.min(image.height() - 1);
    for y in top.min(bottom)..=bottom {
        image.put_pixel(x, y, colour);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_scales_into_the_requested_span() {
        let mut dest = blank(10, 4);
        let src = RgbImage::from_pixel(9, 4, WAVEFORM);

        composite_scaled(&mut dest, 2, 3, &src, 9);

        for x in 0..10 {
            let expected = if (2..5).contains(&x) { WAVEFORM } else { BACKGROUND };
            assert_eq!(*dest.get_pixel(x, 1), expected, "column {x}");
        }
    }

    #[test]
    fn composite_ignores_columns_past_src_width() {
        let mut dest = blank(4, 2);
        let mut src = blank(8, 2);
        for y in 0..2 {
            for x in 4..8 {
                src.put_pixel(x, y, WAVEFORM);
            }
        }

        composite_scaled(&mut dest, 0, 4, &src, 4);
        assert!(dest.pixels().all(|pixel| *pixel == BACKGROUND));
    }

    #[test]
    fn crop_columns_clips_and_handles_empty_ranges() {
        let image = blank(10, 3);

        assert_eq!(crop_columns(&image, 8, 5).dimensions(), (2, 3));
        assert_eq!(crop_columns(&image, -2, 4).dimensions(), (2, 3));
        assert_eq!(crop_columns(&image, 3, 0).dimensions(), (0, 0));
        assert_eq!(crop_columns(&image, 3, -4).dimensions(), (0, 0));
        assert_eq!(crop_columns(&image, 20, 4).dimensions(), (0, 0));
    }

    #[test]
    fn rect_clips_to_image() {
        let image = blank(10, 5);
        let rect = PixelRect::new(8, 0, 10, 10).clipped_to(&image);
        assert_eq!(rect, PixelRect::new(8, 0, 2, 5));
    }
}
