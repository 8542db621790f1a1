use crate::color::{to_hex, Colormap, Rgb};
use crate::error::{EvoError, Result};
use log::{debug, info};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// 5x8 bitmap font used for every raster label
const FONT_5X8: [[u8; 8]; 128] = {
    let mut font = [[0u8; 8]; 128];
    font[b' ' as usize] = [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    font[b'!' as usize] = [0x20, 0x20, 0x20, 0x20, 0x20, 0x00, 0x20, 0x00];
    font[b'"' as usize] = [0x50, 0x50, 0x50, 0x00, 0x00, 0x00, 0x00, 0x00];
    font[b'#' as usize] = [0x50, 0x50, 0xF8, 0x50, 0xF8, 0x50, 0x50, 0x00];
    font[b'$' as usize] = [0x20, 0x78, 0xA0, 0x70, 0x28, 0xF0, 0x20, 0x00];
    font[b'%' as usize] = [0xC0, 0xC8, 0x10, 0x20, 0x40, 0x98, 0x18, 0x00];
    font[b'&' as usize] = [0x40, 0xA0, 0xA0, 0x40, 0xA8, 0x90, 0x68, 0x00];
    font[b'\'' as usize] = [0x20, 0x20, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00];
    font[b'(' as usize] = [0x10, 0x20, 0x40, 0x40, 0x40, 0x20, 0x10, 0x00];
    font[b')' as usize] = [0x40, 0x20, 0x10, 0x10, 0x10, 0x20, 0x40, 0x00];
    font[b'*' as usize] = [0x00, 0x20, 0xA8, 0x70, 0xA8, 0x20, 0x00, 0x00];
    font[b'+' as usize] = [0x00, 0x20, 0x20, 0xF8, 0x20, 0x20, 0x00, 0x00];
    font[b',' as usize] = [0x00, 0x00, 0x00, 0x00, 0x00, 0x20, 0x20, 0x40];
    font[b'-' as usize] = [0x00, 0x00, 0x00, 0xF8, 0x00, 0x00, 0x00, 0x00];
    font[b'.' as usize] = [0x00, 0x00, 0x00, 0x00, 0x00, 0x20, 0x20, 0x00];
    font[b'/' as usize] = [0x00, 0x08, 0x10, 0x20, 0x40, 0x80, 0x00, 0x00];
    font[b'0' as usize] = [0x70, 0x88, 0x98, 0xA8, 0xC8, 0x88, 0x70, 0x00];
    font[b'1' as usize] = [0x20, 0x60, 0x20, 0x20, 0x20, 0x20, 0x70, 0x00];
    font[b'2' as usize] = [0x70, 0x88, 0x08, 0x30, 0x40, 0x80, 0xF8, 0x00];
    font[b'3' as usize] = [0xF8, 0x10, 0x20, 0x10, 0x08, 0x88, 0x70, 0x00];
    font[b'4' as usize] = [0x10, 0x30, 0x50, 0x90, 0xF8, 0x10, 0x10, 0x00];
    font[b'5' as usize] = [0xF8, 0x80, 0xF0, 0x08, 0x08, 0x88, 0x70, 0x00];
    font[b'6' as usize] = [0x30, 0x40, 0x80, 0xF0, 0x88, 0x88, 0x70, 0x00];
    font[b'7' as usize] = [0xF8, 0x08, 0x10, 0x20, 0x40, 0x40, 0x40, 0x00];
    font[b'8' as usize] = [0x70, 0x88, 0x88, 0x70, 0x88, 0x88, 0x70, 0x00];
    font[b'9' as usize] = [0x70, 0x88, 0x88, 0x78, 0x08, 0x10, 0x60, 0x00];
    font[b':' as usize] = [0x00, 0x00, 0x20, 0x00, 0x00, 0x20, 0x00, 0x00];
    font[b';' as usize] = [0x00, 0x00, 0x20, 0x00, 0x00, 0x20, 0x20, 0x40];
    font[b'<' as usize] = [0x08, 0x10, 0x20, 0x40, 0x20, 0x10, 0x08, 0x00];
    font[b'=' as usize] = [0x00, 0x00, 0xF8, 0x00, 0xF8, 0x00, 0x00, 0x00];
    font[b'>' as usize] = [0x80, 0x40, 0x20, 0x10, 0x20, 0x40, 0x80, 0x00];
    font[b'?' as usize] = [0x70, 0x88, 0x08, 0x10, 0x20, 0x00, 0x20, 0x00];
    font[b'@' as usize] = [0x70, 0x88, 0xB8, 0xA8, 0xB8, 0x80, 0x70, 0x00];
    font[b'A' as usize] = [0x70, 0x88, 0x88, 0xF8, 0x88, 0x88, 0x88, 0x00];
    font[b'B' as usize] = [0xF0, 0x88, 0x88, 0xF0, 0x88, 0x88, 0xF0, 0x00];
    font[b'C' as usize] = [0x70, 0x88, 0x80, 0x80, 0x80, 0x88, 0x70, 0x00];
    font[b'D' as usize] = [0xE0, 0x90, 0x88, 0x88, 0x88, 0x90, 0xE0, 0x00];
    font[b'E' as usize] = [0xF8, 0x80, 0x80, 0xF0, 0x80, 0x80, 0xF8, 0x00];
    font[b'F' as usize] = [0xF8, 0x80, 0x80, 0xF0, 0x80, 0x80, 0x80, 0x00];
    font[b'G' as usize] = [0x70, 0x88, 0x80, 0xB8, 0x88, 0x88, 0x70, 0x00];
    font[b'H' as usize] = [0x88, 0x88, 0x88, 0xF8, 0x88, 0x88, 0x88, 0x00];
    font[b'I' as usize] = [0x70, 0x20, 0x20, 0x20, 0x20, 0x20, 0x70, 0x00];
    font[b'J' as usize] = [0x38, 0x10, 0x10, 0x10, 0x10, 0x90, 0x60, 0x00];
    font[b'K' as usize] = [0x88, 0x90, 0xA0, 0xC0, 0xA0, 0x90, 0x88, 0x00];
    font[b'L' as usize] = [0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0xF8, 0x00];
    font[b'M' as usize] = [0x88, 0xD8, 0xA8, 0xA8, 0x88, 0x88, 0x88, 0x00];
    font[b'N' as usize] = [0x88, 0xC8, 0xA8, 0x98, 0x88, 0x88, 0x88, 0x00];
    font[b'O' as usize] = [0x70, 0x88, 0x88, 0x88, 0x88, 0x88, 0x70, 0x00];
    font[b'P' as usize] = [0xF0, 0x88, 0x88, 0xF0, 0x80, 0x80, 0x80, 0x00];
    font[b'Q' as usize] = [0x70, 0x88, 0x88, 0x88, 0xA8, 0x90, 0x68, 0x00];
    font[b'R' as usize] = [0xF0, 0x88, 0x88, 0xF0, 0xA0, 0x90, 0x88, 0x00];
    font[b'S' as usize] = [0x70, 0x88, 0x80, 0x70, 0x08, 0x88, 0x70, 0x00];
    font[b'T' as usize] = [0xF8, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x00];
    font[b'U' as usize] = [0x88, 0x88, 0x88, 0x88, 0x88, 0x88, 0x70, 0x00];
    font[b'V' as usize] = [0x88, 0x88, 0x88, 0x88, 0x88, 0x50, 0x20, 0x00];
    font[b'W' as usize] = [0x88, 0x88, 0x88, 0xA8, 0xA8, 0xD8, 0x88, 0x00];
    font[b'X' as usize] = [0x88, 0x88, 0x50, 0x20, 0x50, 0x88, 0x88, 0x00];
    font[b'Y' as usize] = [0x88, 0x88, 0x50, 0x20, 0x20, 0x20, 0x20, 0x00];
    font[b'Z' as usize] = [0xF8, 0x08, 0x10, 0x20, 0x40, 0x80, 0xF8, 0x00];
    font[b'[' as usize] = [0x70, 0x40, 0x40, 0x40, 0x40, 0x40, 0x70, 0x00];
    font[b'\\' as usize] = [0x00, 0x80, 0x40, 0x20, 0x10, 0x08, 0x00, 0x00];
    font[b']' as usize] = [0x70, 0x10, 0x10, 0x10, 0x10, 0x10, 0x70, 0x00];
    font[b'^' as usize] = [0x20, 0x50, 0x88, 0x00, 0x00, 0x00, 0x00, 0x00];
    font[b'_' as usize] = [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xF8, 0x00];
    font[b'`' as usize] = [0x40, 0x20, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00];
    font[b'a' as usize] = [0x00, 0x00, 0x70, 0x08, 0x78, 0x88, 0x78, 0x00];
    font[b'b' as usize] = [0x80, 0x80, 0xB0, 0xC8, 0x88, 0x88, 0xF0, 0x00];
    font[b'c' as usize] = [0x00, 0x00, 0x70, 0x80, 0x80, 0x88, 0x70, 0x00];
    font[b'd' as usize] = [0x08, 0x08, 0x68, 0x98, 0x88, 0x88, 0x78, 0x00];
    font[b'e' as usize] = [0x00, 0x00, 0x70, 0x88, 0xF8, 0x80, 0x70, 0x00];
    font[b'f' as usize] = [0x30, 0x48, 0x40, 0xE0, 0x40, 0x40, 0x40, 0x00];
    font[b'g' as usize] = [0x00, 0x00, 0x78, 0x88, 0x78, 0x08, 0x70, 0x00];
    font[b'h' as usize] = [0x80, 0x80, 0xB0, 0xC8, 0x88, 0x88, 0x88, 0x00];
    font[b'i' as usize] = [0x20, 0x00, 0x60, 0x20, 0x20, 0x20, 0x70, 0x00];
    font[b'j' as usize] = [0x10, 0x00, 0x30, 0x10, 0x10, 0x90, 0x60, 0x00];
    font[b'k' as usize] = [0x80, 0x80, 0x90, 0xA0, 0xC0, 0xA0, 0x90, 0x00];
    font[b'l' as usize] = [0x60, 0x20, 0x20, 0x20, 0x20, 0x20, 0x70, 0x00];
    font[b'm' as usize] = [0x00, 0x00, 0xD0, 0xA8, 0xA8, 0xA8, 0xA8, 0x00];
    font[b'n' as usize] = [0x00, 0x00, 0xB0, 0xC8, 0x88, 0x88, 0x88, 0x00];
    font[b'o' as usize] = [0x00, 0x00, 0x70, 0x88, 0x88, 0x88, 0x70, 0x00];
    font[b'p' as usize] = [0x00, 0x00, 0xF0, 0x88, 0xF0, 0x80, 0x80, 0x00];
    font[b'q' as usize] = [0x00, 0x00, 0x78, 0x88, 0x78, 0x08, 0x08, 0x00];
    font[b'r' as usize] = [0x00, 0x00, 0xB0, 0xC8, 0x80, 0x80, 0x80, 0x00];
    font[b's' as usize] = [0x00, 0x00, 0x70, 0x80, 0x70, 0x08, 0xF0, 0x00];
    font[b't' as usize] = [0x40, 0x40, 0xE0, 0x40, 0x40, 0x48, 0x30, 0x00];
    font[b'u' as usize] = [0x00, 0x00, 0x88, 0x88, 0x88, 0x98, 0x68, 0x00];
    font[b'v' as usize] = [0x00, 0x00, 0x88, 0x88, 0x88, 0x50, 0x20, 0x00];
    font[b'w' as usize] = [0x00, 0x00, 0x88, 0x88, 0xA8, 0xA8, 0x50, 0x00];
    font[b'x' as usize] = [0x00, 0x00, 0x88, 0x50, 0x20, 0x50, 0x88, 0x00];
    font[b'y' as usize] = [0x00, 0x00, 0x88, 0x88, 0x78, 0x08, 0x70, 0x00];
    font[b'z' as usize] = [0x00, 0x00, 0xF8, 0x10, 0x20, 0x40, 0xF8, 0x00];
    font[b'{' as usize] = [0x10, 0x20, 0x20, 0x40, 0x20, 0x20, 0x10, 0x00];
    font[b'|' as usize] = [0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x00];
    font[b'}' as usize] = [0x40, 0x20, 0x20, 0x10, 0x20, 0x20, 0x40, 0x00];
    font[b'~' as usize] = [0x00, 0x00, 0x40, 0xA8, 0x10, 0x00, 0x00, 0x00];
    font
};

/// Pixel width of one glyph cell at scale 1
pub const GLYPH: f64 = 8.0;

/// Drawable primitives in data coordinates
#[derive(Debug, Clone)]
pub enum Shape {
    /// Directed line segment without an arrow head
    Segment {
        from: [f64; 2],
        to: [f64; 2],
        width: f64,
        color: Rgb,
        zorder: i32,
    },
    /// Scatter marker; `size` is the marker area in points squared
    Marker {
        at: [f64; 2],
        size: f64,
        fill: Rgb,
        edge: Option<Rgb>,
        zorder: i32,
    },
    /// Axis-aligned filled rectangle
    Cell {
        x0: f64,
        y0: f64,
        x1: f64,
        y1: f64,
        fill: Rgb,
        zorder: i32,
    },
}

impl Shape {
    fn zorder(&self) -> i32 {
        match self {
            Shape::Segment { zorder, .. }
            | Shape::Marker { zorder, .. }
            | Shape::Cell { zorder, .. } => *zorder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Start,
    Middle,
    End,
}

/// Text placed in pixel space; `y` is the vertical center of the line
#[derive(Debug, Clone)]
pub struct Label {
    pub text: String,
    pub x: f64,
    pub y: f64,
    pub anchor: Anchor,
    pub color: Rgb,
}

/// Rectangle of the image that data coordinates are mapped onto
#[derive(Debug, Clone, Copy)]
pub struct PlotArea {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// A drawing surface: one set of axes plus decorations, rendered on demand
/// to PNG or SVG.
#[derive(Debug, Clone)]
pub struct Figure {
    width: u32,
    height: u32,
    dpi: f64,
    area: PlotArea,
    x_range: (f64, f64),
    y_range: (f64, f64),
    /// Row 0 at the top, as in a matrix
    invert_y: bool,
    shapes: Vec<Shape>,
    labels: Vec<Label>,
    legend: Vec<(String, Rgb)>,
    colorbar: Option<(Colormap, f64, f64)>,
    title: Option<String>,
}

impl Figure {
    /// New figure of the given pixel size; margins leave room for labels.
    pub fn new(width: u32, height: u32, dpi: f64) -> Self {
        Self::with_margins(width, height, dpi, 40.0, 20.0, 30.0, 30.0)
    }

    pub fn with_margins(
        width: u32,
        height: u32,
        dpi: f64,
        left: f64,
        right: f64,
        top: f64,
        bottom: f64,
    ) -> Self {
        let area = PlotArea {
            left,
            top,
            width: (width as f64 - left - right).max(1.0),
            height: (height as f64 - top - bottom).max(1.0),
        };
        Figure {
            width,
            height,
            dpi,
            area,
            x_range: (0.0, 1.0),
            y_range: (0.0, 1.0),
            invert_y: false,
            shapes: Vec::new(),
            labels: Vec::new(),
            legend: Vec::new(),
            colorbar: None,
            title: None,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn area(&self) -> PlotArea {
        self.area
    }

    pub fn set_range(&mut self, x: (f64, f64), y: (f64, f64)) {
        self.x_range = x;
        self.y_range = y;
    }

    pub fn set_invert_y(&mut self, invert: bool) {
        self.invert_y = invert;
    }

    /// Fit the data range to the given points with a 5% pad on each side.
    pub fn fit(&mut self, points: &[[f64; 2]]) {
        if points.is_empty() {
            return;
        }
        let (mut x0, mut x1, mut y0, mut y1) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
        for p in points {
            x0 = x0.min(p[0]);
            x1 = x1.max(p[0]);
            y0 = y0.min(p[1]);
            y1 = y1.max(p[1]);
        }
        let pad = |lo: f64, hi: f64| {
            let span = hi - lo;
            if span > 0.0 {
                (lo - span * 0.05, hi + span * 0.05)
            } else {
                (lo - 0.5, hi + 0.5)
            }
        };
        self.x_range = pad(x0, x1);
        self.y_range = pad(y0, y1);
    }

    /// Grow the current range so that it also covers `points`.
    pub fn include(&mut self, points: &[[f64; 2]]) {
        if self.shapes.is_empty() {
            self.fit(points);
            return;
        }
        let (x, y) = (self.x_range, self.y_range);
        if points
            .iter()
            .all(|p| p[0] >= x.0 && p[0] <= x.1 && p[1] >= y.0 && p[1] <= y.1)
        {
            return;
        }
        let mut all = points.to_vec();
        all.push([x.0, y.0]);
        all.push([x.1, y.1]);
        self.fit(&all);
    }

    /// Map a data coordinate to pixel space.
    pub fn to_pixel(&self, p: [f64; 2]) -> (f64, f64) {
        let (x0, x1) = self.x_range;
        let (y0, y1) = self.y_range;
        let fx = if x1 > x0 { (p[0] - x0) / (x1 - x0) } else { 0.5 };
        let fy = if y1 > y0 { (p[1] - y0) / (y1 - y0) } else { 0.5 };
        let px = self.area.left + fx * self.area.width;
        let py = if self.invert_y {
            self.area.top + fy * self.area.height
        } else {
            self.area.top + (1.0 - fy) * self.area.height
        };
        (px, py)
    }

    /// Marker radius in pixels for an area given in points squared
    fn marker_radius(&self, size: f64) -> f64 {
        (size.max(0.0).sqrt() / 2.0 * self.dpi / 72.0).max(1.0)
    }

    pub fn push(&mut self, shape: Shape) {
        self.shapes.push(shape);
    }

    pub fn label(&mut self, text: impl Into<String>, x: f64, y: f64, anchor: Anchor) {
        self.labels.push(Label {
            text: text.into(),
            x,
            y,
            anchor,
            color: (0, 0, 0),
        });
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = Some(title.into());
    }

    pub fn add_legend_entry(&mut self, name: impl Into<String>, color: Rgb) {
        self.legend.push((name.into(), color));
    }

    pub fn set_colorbar(&mut self, cmap: Colormap, vmin: f64, vmax: f64) {
        self.colorbar = Some((cmap, vmin, vmax));
    }

    #[cfg(test)]
    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    #[cfg(test)]
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    #[cfg(test)]
    pub fn legend(&self) -> &[(String, Rgb)] {
        &self.legend
    }

    #[cfg(test)]
    pub fn segment_count(&self) -> usize {
        self.shapes
            .iter()
            .filter(|s| matches!(s, Shape::Segment { .. }))
            .count()
    }

    #[cfg(test)]
    pub fn marker_count(&self) -> usize {
        self.shapes
            .iter()
            .filter(|s| matches!(s, Shape::Marker { .. }))
            .count()
    }

    /// Shapes in paint order: ascending z-order, insertion order within a layer
    fn painted(&self) -> Vec<&Shape> {
        let mut shapes: Vec<&Shape> = self.shapes.iter().collect();
        shapes.sort_by_key(|s| s.zorder());
        shapes
    }

    /// Rasterize into a tightly packed RGBA buffer.
    pub fn render(&self) -> Vec<u8> {
        let mut canvas = Canvas::new(self.width, self.height);

        for shape in self.painted() {
            match *shape {
                Shape::Segment { from, to, width, color, .. } => {
                    let (ax, ay) = self.to_pixel(from);
                    let (bx, by) = self.to_pixel(to);
                    canvas.line(ax, ay, bx, by, width, color);
                }
                Shape::Marker { at, size, fill, edge, .. } => {
                    let (x, y) = self.to_pixel(at);
                    canvas.disc(x, y, self.marker_radius(size), fill, edge);
                }
                Shape::Cell { x0, y0, x1, y1, fill, .. } => {
                    let (ax, ay) = self.to_pixel([x0, y0]);
                    let (bx, by) = self.to_pixel([x1, y1]);
                    canvas.rect(ax.min(bx), ay.min(by), ax.max(bx), ay.max(by), fill);
                }
            }
        }

        // Axes frame
        let a = self.area;
        let (r, b) = (a.left + a.width, a.top + a.height);
        canvas.line(a.left, a.top, r, a.top, 1.0, (0, 0, 0));
        canvas.line(a.left, b, r, b, 1.0, (0, 0, 0));
        canvas.line(a.left, a.top, a.left, b, 1.0, (0, 0, 0));
        canvas.line(r, a.top, r, b, 1.0, (0, 0, 0));

        for label in self.decorations() {
            canvas.text(&label);
        }
        if let Some((cmap, vmin, vmax)) = &self.colorbar {
            let (x0, x1) = self.colorbar_x();
            let steps = a.height.max(1.0) as u32;
            for i in 0..steps {
                let t = 1.0 - i as f64 / steps as f64;
                let y = a.top + i as f64;
                let fill = cmap.sample_range(vmin + t * (vmax - vmin), *vmin, *vmax);
                canvas.rect(x0, y, x1, y + 1.0, fill);
            }
        }
        for (i, (_, color)) in self.legend.iter().enumerate() {
            let (x, y) = self.legend_slot(i);
            canvas.disc(x + 4.0, y, 4.0, *color, None);
        }

        canvas.buffer
    }

    fn colorbar_x(&self) -> (f64, f64) {
        let x0 = self.area.left + self.area.width + 12.0;
        (x0, x0 + 14.0)
    }

    fn legend_slot(&self, i: usize) -> (f64, f64) {
        (self.area.left + self.area.width + 10.0, self.area.top + 6.0 + i as f64 * 14.0)
    }

    /// User labels plus title, legend text and colorbar ticks
    fn decorations(&self) -> Vec<Label> {
        let mut labels = self.labels.clone();
        if let Some(title) = &self.title {
            labels.push(Label {
                text: title.clone(),
                x: self.area.left + self.area.width / 2.0,
                y: self.area.top / 2.0,
                anchor: Anchor::Middle,
                color: (0, 0, 0),
            });
        }
        for (i, (name, _)) in self.legend.iter().enumerate() {
            let (x, y) = self.legend_slot(i);
            labels.push(Label {
                text: name.clone(),
                x: x + 12.0,
                y,
                anchor: Anchor::Start,
                color: (0, 0, 0),
            });
        }
        if let Some((_, vmin, vmax)) = &self.colorbar {
            let (_, x1) = self.colorbar_x();
            let a = self.area;
            for (value, y) in [
                (*vmax, a.top + 4.0),
                ((vmin + vmax) / 2.0, a.top + a.height / 2.0),
                (*vmin, a.top + a.height - 4.0),
            ] {
                labels.push(Label {
                    text: format!("{:.1}", value),
                    x: x1 + 4.0,
                    y,
                    anchor: Anchor::Start,
                    color: (0, 0, 0),
                });
            }
        }
        labels
    }

    /// Serialize as an SVG document with vector shapes and text.
    pub fn render_svg(&self) -> String {
        let mut svg = String::new();
        svg.push_str(&format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{}" height="{}" viewBox="0 0 {} {}">"#,
            self.width, self.height, self.width, self.height
        ));
        svg.push('\n');
        svg.push_str(r#"<rect width="100%" height="100%" fill="white"/>"#);
        svg.push('\n');

        for shape in self.painted() {
            match *shape {
                Shape::Segment { from, to, width, color, .. } => {
                    let (ax, ay) = self.to_pixel(from);
                    let (bx, by) = self.to_pixel(to);
                    svg.push_str(&format!(
                        r#"<line x1="{:.2}" y1="{:.2}" x2="{:.2}" y2="{:.2}" stroke="{}" stroke-width="{:.2}" stroke-linecap="round"/>"#,
                        ax, ay, bx, by, to_hex(color), width
                    ));
                }
                Shape::Marker { at, size, fill, edge, .. } => {
                    let (x, y) = self.to_pixel(at);
                    let stroke = match edge {
                        Some(c) => format!(r#" stroke="{}" stroke-width="0.7""#, to_hex(c)),
                        None => String::new(),
                    };
                    svg.push_str(&format!(
                        r#"<circle cx="{:.2}" cy="{:.2}" r="{:.2}" fill="{}"{}/>"#,
                        x,
                        y,
                        self.marker_radius(size),
                        to_hex(fill),
                        stroke
                    ));
                }
                Shape::Cell { x0, y0, x1, y1, fill, .. } => {
                    let (ax, ay) = self.to_pixel([x0, y0]);
                    let (bx, by) = self.to_pixel([x1, y1]);
                    svg.push_str(&format!(
                        r#"<rect x="{:.2}" y="{:.2}" width="{:.2}" height="{:.2}" fill="{}"/>"#,
                        ax.min(bx),
                        ay.min(by),
                        (bx - ax).abs(),
                        (by - ay).abs(),
                        to_hex(fill)
                    ));
                }
            }
            svg.push('\n');
        }

        let a = self.area;
        svg.push_str(&format!(
            r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="none" stroke="black" stroke-width="1"/>"#,
            a.left, a.top, a.width, a.height
        ));
        svg.push('\n');

        if let Some((cmap, vmin, vmax)) = &self.colorbar {
            let (x0, x1) = self.colorbar_x();
            svg.push_str(r#"<defs><linearGradient id="cbar" x1="0" y1="1" x2="0" y2="0">"#);
            for i in 0..=10 {
                let t = i as f64 / 10.0;
                svg.push_str(&format!(
                    r#"<stop offset="{:.1}" stop-color="{}"/>"#,
                    t,
                    to_hex(cmap.sample_range(vmin + t * (vmax - vmin), *vmin, *vmax))
                ));
            }
            svg.push_str("</linearGradient></defs>\n");
            svg.push_str(&format!(
                r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="url(#cbar)"/>"#,
                x0,
                a.top,
                x1 - x0,
                a.height
            ));
            svg.push('\n');
        }
        for (i, (_, color)) in self.legend.iter().enumerate() {
            let (x, y) = self.legend_slot(i);
            svg.push_str(&format!(
                r#"<circle cx="{:.1}" cy="{:.1}" r="4" fill="{}"/>"#,
                x + 4.0,
                y,
                to_hex(*color)
            ));
            svg.push('\n');
        }

        for label in self.decorations() {
            let anchor = match label.anchor {
                Anchor::Start => "start",
                Anchor::Middle => "middle",
                Anchor::End => "end",
            };
            svg.push_str(&format!(
                r#"<text x="{:.1}" y="{:.1}" font-family="monospace" font-size="10" text-anchor="{}" dominant-baseline="middle" fill="{}">{}</text>"#,
                label.x,
                label.y,
                anchor,
                to_hex(label.color),
                escape_xml(&label.text)
            ));
            svg.push('\n');
        }

        svg.push_str("</svg>\n");
        svg
    }

    /// Write the figure, as SVG if the extension says so and PNG otherwise.
    pub fn save(&self, path: &Path) -> Result<()> {
        let is_svg = path
            .extension()
            .map(|ext| ext.to_ascii_lowercase() == "svg")
            .unwrap_or(false);

        info!("Saving to {:?}...", path);
        if is_svg {
            let mut file = File::create(path)?;
            file.write_all(self.render_svg().as_bytes())?;
        } else {
            let pixels = self.render();
            let mut rgb_pixels = Vec::with_capacity(buffer_len(self.width, self.height, 3));
            for chunk in pixels.chunks(4) {
                rgb_pixels.extend_from_slice(&chunk[..3]);
            }
            let img = image::RgbImage::from_raw(self.width, self.height, rgb_pixels).ok_or_else(|| {
                EvoError::ShapeMismatch(format!(
                    "pixel buffer does not match a {}x{} image",
                    self.width, self.height
                ))
            })?;
            img.save(path)?;
        }
        debug!("Wrote {} shapes and {} labels", self.shapes.len(), self.labels.len());
        Ok(())
    }
}

/// Where figures go and how big an inch is
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub figdir: PathBuf,
    pub dpi: f64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            figdir: PathBuf::from("figures"),
            dpi: 100.0,
        }
    }
}

impl OutputConfig {
    /// A blank 6.4 x 4.8 inch figure
    pub fn new_figure(&self) -> Figure {
        Figure::new(
            (6.4 * self.dpi).round() as u32,
            (4.8 * self.dpi).round() as u32,
            self.dpi,
        )
    }

    /// Path of `name` inside the figure directory, which is created if needed.
    pub fn figure_path(&self, name: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.figdir)?;
        Ok(self.figdir.join(name))
    }
}

/// Escape special XML characters
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Bytes in a `width` x `height` image with `channels` bytes per pixel
fn buffer_len(width: u32, height: u32, channels: usize) -> usize {
    width as usize * height as usize * channels
}

/// RGBA pixel buffer with the few primitives figures need
struct Canvas {
    width: u32,
    height: u32,
    buffer: Vec<u8>,
}

impl Canvas {
    fn new(width: u32, height: u32) -> Self {
        Canvas {
            width,
            height,
            buffer: vec![255u8; buffer_len(width, height, 4)],
        }
    }

    fn set(&mut self, x: i64, y: i64, (r, g, b): Rgb) {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        self.buffer[idx] = r;
        self.buffer[idx + 1] = g;
        self.buffer[idx + 2] = b;
        self.buffer[idx + 3] = 255;
    }

    fn rect(&mut self, x0: f64, y0: f64, x1: f64, y1: f64, color: Rgb) {
        let (xa, xb) = (x0.floor() as i64, (x1.ceil() as i64).max(x0.floor() as i64 + 1));
        let (ya, yb) = (y0.floor() as i64, (y1.ceil() as i64).max(y0.floor() as i64 + 1));
        for y in ya..yb {
            for x in xa..xb {
                self.set(x, y, color);
            }
        }
    }

    /// Filled circle with an optional one-pixel outline
    fn disc(&mut self, cx: f64, cy: f64, radius: f64, fill: Rgb, edge: Option<Rgb>) {
        let reach = radius.ceil() as i64 + 1;
        let (ix, iy) = (cx.round() as i64, cy.round() as i64);
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                let (x, y) = (ix + dx, iy + dy);
                let d = ((x as f64 - cx).powi(2) + (y as f64 - cy).powi(2)).sqrt();
                if d > radius {
                    continue;
                }
                match edge {
                    Some(e) if d > radius - 1.0 => self.set(x, y, e),
                    _ => self.set(x, y, fill),
                }
            }
        }
    }

    /// Straight line stamped with a square pen of the given pixel width
    fn line(&mut self, ax: f64, ay: f64, bx: f64, by: f64, width: f64, color: Rgb) {
        let len = ((bx - ax).powi(2) + (by - ay).powi(2)).sqrt();
        let steps = (len * 2.0).ceil().max(1.0) as usize;
        let half = ((width.max(1.0) - 1.0) / 2.0).round() as i64;
        for s in 0..=steps {
            let t = s as f64 / steps as f64;
            let x = (ax + (bx - ax) * t).round() as i64;
            let y = (ay + (by - ay) * t).round() as i64;
            for oy in -half..=half {
                for ox in -half..=half {
                    self.set(x + ox, y + oy, color);
                }
            }
        }
    }

    fn text(&mut self, label: &Label) {
        let text_width = label.text.chars().count() as f64 * GLYPH;
        let left = match label.anchor {
            Anchor::Start => label.x,
            Anchor::Middle => label.x - text_width / 2.0,
            Anchor::End => label.x - text_width,
        };
        let top = (label.y - GLYPH / 2.0).round() as i64;
        for (i, c) in label.text.chars().enumerate() {
            let c_byte = c as usize;
            let glyph = if c_byte < 128 {
                &FONT_5X8[c_byte]
            } else {
                &FONT_5X8[b'?' as usize]
            };
            let base_x = (left + i as f64 * GLYPH).round() as i64;
            self.write_char(base_x, top, glyph, label.color);
        }
    }

    fn write_char(&mut self, base_x: i64, base_y: i64, char_data: &[u8; 8], color: Rgb) {
        for j in 0..8i64 {
            let row = char_data[j as usize];
            for z in (0..8i64).rev() {
                if (row >> z) & 1 == 1 {
                    self.set(base_x + (7 - z), base_y + j, color);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(buf: &[u8], width: u32, x: u32, y: u32) -> Rgb {
        let idx = ((y * width + x) * 4) as usize;
        (buf[idx], buf[idx + 1], buf[idx + 2])
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn buffer_size_does_not_wrap() {
        assert_eq!(buffer_len(40_000, 40_000, 4), 6_400_000_000);
        assert_eq!(buffer_len(40_000, 40_000, 3), 4_800_000_000);
    }

    #[test]
    fn maps_data_to_pixels() {
        let mut fig = Figure::with_margins(110, 110, 100.0, 10.0, 0.0, 10.0, 0.0);
        fig.set_range((0.0, 10.0), (0.0, 10.0));
        assert_eq!(fig.to_pixel([0.0, 0.0]), (10.0, 110.0));
        assert_eq!(fig.to_pixel([10.0, 10.0]), (110.0, 10.0));
        fig.set_invert_y(true);
        assert_eq!(fig.to_pixel([0.0, 0.0]), (10.0, 10.0));
    }

    #[test]
    fn higher_zorder_paints_last() {
        let mut fig = Figure::with_margins(50, 50, 72.0, 0.0, 0.0, 0.0, 0.0);
        fig.set_range((0.0, 1.0), (0.0, 1.0));
        fig.push(Shape::Marker {
            at: [0.5, 0.5],
            size: 100.0,
            fill: (255, 0, 0),
            edge: None,
            zorder: 10,
        });
        fig.push(Shape::Segment {
            from: [0.0, 0.5],
            to: [1.0, 0.5],
            width: 1.0,
            color: (0, 0, 255),
            zorder: 5,
        });
        let buf = fig.render();
        assert_eq!(buf.len(), 50 * 50 * 4);
        assert_eq!(pixel(&buf, 50, 25, 25), (255, 0, 0));
        assert_eq!(pixel(&buf, 50, 5, 25), (0, 0, 255));
    }

    #[test]
    fn counts_segments_and_markers() {
        let mut fig = Figure::new(100, 100, 100.0);
        fig.push(Shape::Cell {
            x0: 0.0,
            y0: 0.0,
            x1: 1.0,
            y1: 1.0,
            fill: (1, 2, 3),
            zorder: 0,
        });
        assert_eq!(fig.segment_count(), 0);
        assert_eq!(fig.marker_count(), 0);
        assert_eq!(fig.shapes().len(), 1);
    }

    #[test]
    fn fit_pads_degenerate_ranges() {
        let mut fig = Figure::new(100, 100, 100.0);
        fig.fit(&[[1.0, 2.0], [1.0, 2.0]]);
        assert_eq!(fig.x_range, (0.5, 1.5));
        fig.fit(&[[0.0, 0.0], [10.0, 20.0]]);
        assert_eq!(fig.x_range, (-0.5, 10.5));
        assert_eq!(fig.y_range, (-1.0, 21.0));
    }

    #[test]
    fn svg_escapes_labels() {
        let mut fig = Figure::new(100, 100, 100.0);
        fig.label("a<b", 5.0, 5.0, Anchor::Start);
        fig.add_legend_entry("K&R", (0, 0, 0));
        let svg = fig.render_svg();
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("a&lt;b"));
        assert!(svg.contains("K&amp;R"));
        assert!(svg.trim_end().ends_with("</svg>"));
    }
}
