use crate::resource::TextureFormat;

pub const CHECKERBOARD_SIZE: u32 = 256;
pub const CHECKERBOARD_CELL: u32 = 32;

const BLACK: [u8; 4] = [0x00, 0x00, 0x00, 0xff];
const WHITE: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

/// Tightly packed pixel rows, as handed over by the content pipeline.
#[derive(Clone, Debug)]
pub struct TextureData {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn texel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.format.bytes_per_pixel() as usize;
        let start = (y as usize * self.width as usize + x as usize) * bpp;
        &self.pixels[start..start + bpp]
    }
}

/// Black where the cell row and column share parity, white elsewhere.
pub fn checkerboard(width: u32, height: u32, cell: u32) -> TextureData {
    let cell = cell.max(1);
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
    for y in 0..height {
        for x in 0..width {
            let (i, j) = (x / cell, y / cell);
            pixels.extend_from_slice(if i % 2 == j % 2 { &BLACK } else { &WHITE });
        }
    }
    TextureData {
        label: "checkerboard",
        width,
        height,
        format: TextureFormat::Rgba8Unorm,
        pixels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_cells() {
        let board = checkerboard(CHECKERBOARD_SIZE, CHECKERBOARD_SIZE, CHECKERBOARD_CELL);
        assert_eq!(board.pixels.len(), 256 * 256 * 4);
        assert_eq!(board.texel(0, 0), BLACK);
        assert_eq!(board.texel(31, 31), BLACK);
        assert_eq!(board.texel(32, 0), WHITE);
        assert_eq!(board.texel(32, 32), BLACK);
        assert_eq!(board.texel(255, 0), WHITE);
    }
}
