use super::colour::Colour;
use super::rect::Rect;

/// Owned RGBA8 pixel buffer, row-major, no padding.
#[derive(Clone, PartialEq, Eq)]
pub struct Surface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Surface({}x{})", self.width, self.height)
    }
}

impl Surface {
    pub fn new(width: u32, height: u32) -> Self {
        Surface {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    pub fn filled(width: u32, height: u32, c: Colour) -> Self {
        let mut s = Surface::new(width, height);
        s.clear(c);
        s
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width as i32, self.height as i32)
    }

    pub fn as_rgba(&self) -> &[u8] {
        &self.pixels
    }

    fn offset(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return None;
        }
        Some((y as usize * self.width as usize + x as usize) * 4)
    }

    pub fn get_pixel(&self, x: i32, y: i32) -> Option<Colour> {
        self.offset(x, y).map(|o| Colour::from_rgba(&self.pixels[o..o + 4]))
    }

    pub fn set_pixel(&mut self, x: i32, y: i32, c: Colour) -> bool {
        match self.offset(x, y) {
            Some(o) => {
                self.pixels[o..o + 4].copy_from_slice(&c.to_rgba());
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self, c: Colour) {
        let px = c.to_rgba();
        for chunk in self.pixels.chunks_exact_mut(4) {
            chunk.copy_from_slice(&px);
        }
    }

    pub fn fill(&mut self, area: Rect, c: Colour) {
        let area = self.bounds().clip(&area);
        let px = c.to_rgba();
        for y in area.y..area.bottom() {
            for x in area.x..area.right() {
                if let Some(o) = self.offset(x, y) {
                    self.pixels[o..o + 4].copy_from_slice(&px);
                }
            }
        }
    }

    /// Copies `src` with its top-left at (`x`, `y`); source pixels replace
    /// destination pixels, alpha included.
    pub fn blit(&mut self, src: &Surface, x: i32, y: i32) {
        let target = self
            .bounds()
            .clip(&Rect::new(x, y, src.width as i32, src.height as i32));
        let row_bytes = target.w as usize * 4;
        if row_bytes == 0 {
            return;
        }
        for ty in target.y..target.bottom() {
            let (Some(d), Some(s)) = (self.offset(target.x, ty), src.offset(target.x - x, ty - y)) else {
                continue;
            };
            self.pixels[d..d + row_bytes].copy_from_slice(&src.pixels[s..s + row_bytes]);
        }
    }

    pub fn rotated_180(&self) -> Surface {
        let mut out = Vec::with_capacity(self.pixels.len());
        for px in self.pixels.chunks_exact(4).rev() {
            out.extend_from_slice(px);
        }
        Surface {
            width: self.width,
            height: self.height,
            pixels: out,
        }
    }

    pub fn to_rgb(&self) -> Vec<u8> {
        self.pixels
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect()
    }

    /// Nearest-neighbour resample, used where a device wants a fixed size.
    pub fn resized(&self, width: u32, height: u32) -> Surface {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let mut out = Surface::new(width, height);
        if self.width == 0 || self.height == 0 {
            return out;
        }
        for y in 0..height {
            for x in 0..width {
                let sx = (x as u64 * self.width as u64 / width as u64) as i32;
                let sy = (y as u64 * self.height as u64 / height as u64) as i32;
                if let Some(c) = self.get_pixel(sx, sy) {
                    out.set_pixel(x as i32, y as i32, c);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_is_clipped() {
        let mut s = Surface::new(4, 4);
        s.fill(Rect::new(2, 2, 10, 10), Colour::WHITE);
        assert_eq!(s.get_pixel(3, 3), Some(Colour::WHITE));
        assert_eq!(s.get_pixel(1, 1), Some(Colour::rgba(0, 0, 0, 0)));
        assert_eq!(s.get_pixel(4, 0), None);
    }

    #[test]
    fn blit_handles_negative_offsets() {
        let mut dst = Surface::new(3, 3);
        let mut src = Surface::filled(2, 2, Colour::rgb(1, 2, 3));
        src.set_pixel(1, 1, Colour::rgb(9, 9, 9));
        dst.blit(&src, -1, -1);
        assert_eq!(dst.get_pixel(0, 0), Some(Colour::rgb(9, 9, 9)));
        assert_eq!(dst.get_pixel(1, 1), Some(Colour::rgba(0, 0, 0, 0)));
        dst.blit(&src, 2, 2);
        assert_eq!(dst.get_pixel(2, 2), Some(Colour::rgb(1, 2, 3)));
    }

    #[test]
    fn rotation_reverses_pixel_order() {
        let mut s = Surface::new(2, 1);
        s.set_pixel(0, 0, Colour::WHITE);
        let r = s.rotated_180();
        assert_eq!(r.get_pixel(1, 0), Some(Colour::WHITE));
        assert_eq!(r.get_pixel(0, 0), Some(Colour::rgba(0, 0, 0, 0)));
        assert_eq!(s.resized(4, 2).get_pixel(1, 1), Some(Colour::WHITE));
        assert_eq!(s.to_rgb().len(), 6);
    }
}
