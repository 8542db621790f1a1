use crate::error::{EvoError, Result};
use sha2::{Digest, Sha256};

pub type Rgb = (u8, u8, u8);

/// ColorBrewer Set1 qualitative palette for categories
const CATEGORY_COLORS: [Rgb; 9] = [
    (228, 26, 28),   // red
    (55, 126, 184),  // blue
    (77, 175, 74),   // green
    (152, 78, 163),  // purple
    (255, 127, 0),   // orange
    (255, 255, 51),  // yellow
    (166, 86, 40),   // brown
    (247, 129, 191), // pink
    (153, 153, 153), // grey
];

/// Alignment gaps are always drawn in this light grey
pub const GAP_COLOR: Rgb = (211, 211, 211);

/// Parse `#rrggbb`, `r,g,b` or one of a handful of named colors.
pub fn parse_color(s: &str) -> Result<Rgb> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix('#') {
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(EvoError::UnknownColor(s.to_string()));
        }
        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| EvoError::UnknownColor(s.to_string()))
        };
        return Ok((channel(0)?, channel(2)?, channel(4)?));
    }
    if s.contains(',') {
        let parts: Vec<u8> = s
            .split(',')
            .map(|p| p.trim().parse::<u8>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| EvoError::UnknownColor(s.to_string()))?;
        if parts.len() == 3 {
            return Ok((parts[0], parts[1], parts[2]));
        }
        return Err(EvoError::UnknownColor(s.to_string()));
    }
    let rgb = match s.to_ascii_lowercase().as_str() {
        "white" | "w" => (255, 255, 255),
        "black" | "k" => (0, 0, 0),
        "red" | "r" => (255, 0, 0),
        "green" | "g" => (0, 128, 0),
        "blue" | "b" => (0, 0, 255),
        "grey" | "gray" => (128, 128, 128),
        "lightgrey" | "lightgray" => GAP_COLOR,
        "orange" => (255, 165, 0),
        "purple" => (128, 0, 128),
        _ => return Err(EvoError::UnknownColor(s.to_string())),
    };
    Ok(rgb)
}

pub fn to_hex(rgb: Rgb) -> String {
    format!("#{:02x}{:02x}{:02x}", rgb.0, rgb.1, rgb.2)
}

/// Color for a category, stable across images.
///
/// The first categories (in sorted order) take the qualitative palette;
/// anything beyond it gets a color derived from the SHA-256 of its name,
/// normalized and brightened so it never comes out too dark.
pub fn category_color(name: &str, rank: usize) -> Rgb {
    if name == "-" {
        return GAP_COLOR;
    }
    if rank < CATEGORY_COLORS.len() {
        return CATEGORY_COLORS[rank];
    }

    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let result = hasher.finalize();

    let mut r = result[24] as f32 / 255.0;
    let mut g = result[8] as f32 / 255.0;
    let mut b = result[16] as f32 / 255.0;
    let sum = r + g + b;
    if sum > 0.0 {
        r /= sum;
        g /= sum;
        b /= sum;
    }
    let max_component = r.max(g).max(b);
    let f = if max_component > 0.0 {
        1.5f32.min(1.0 / max_component)
    } else {
        1.0
    };
    (
        (255.0 * (r * f).min(1.0)).round() as u8,
        (255.0 * (g * f).min(1.0)).round() as u8,
        (255.0 * (b * f).min(1.0)).round() as u8,
    )
}

/// A colormap given by evenly spaced control points, linearly interpolated.
#[derive(Debug, Clone)]
pub struct Colormap {
    stops: Vec<Rgb>,
}

const RDBU: [Rgb; 11] = [
    (103, 0, 31),
    (178, 24, 43),
    (214, 96, 77),
    (244, 165, 130),
    (253, 219, 199),
    (247, 247, 247),
    (209, 229, 240),
    (146, 197, 222),
    (67, 147, 195),
    (33, 102, 172),
    (5, 48, 97),
];

const COOLWARM: [Rgb; 5] = [
    (59, 76, 192),
    (141, 176, 254),
    (221, 221, 221),
    (244, 154, 123),
    (180, 4, 38),
];

const BWR: [Rgb; 3] = [(0, 0, 255), (255, 255, 255), (255, 0, 0)];

const VIRIDIS: [Rgb; 9] = [
    (68, 1, 84),
    (71, 44, 122),
    (59, 81, 139),
    (44, 113, 142),
    (33, 144, 141),
    (39, 173, 129),
    (92, 200, 99),
    (170, 220, 50),
    (253, 231, 37),
];

const GREYS: [Rgb; 2] = [(255, 255, 255), (0, 0, 0)];

impl Colormap {
    /// Look up a colormap by name; a `_r` suffix reverses it.
    pub fn by_name(name: &str) -> Result<Self> {
        let (base, reversed) = match name.strip_suffix("_r") {
            Some(base) => (base, true),
            None => (name, false),
        };
        let stops: &[Rgb] = match base {
            "RdBu" => &RDBU,
            "coolwarm" => &COOLWARM,
            "bwr" => &BWR,
            "viridis" => &VIRIDIS,
            "Greys" => &GREYS,
            _ => return Err(EvoError::UnknownColormap(name.to_string())),
        };
        let mut stops = stops.to_vec();
        if reversed {
            stops.reverse();
        }
        Ok(Colormap { stops })
    }

    /// Sample at `t` in [0, 1]; values outside are clamped.
    pub fn sample(&self, t: f64) -> Rgb {
        let t = if t.is_nan() { 0.5 } else { t.clamp(0.0, 1.0) };
        let last = self.stops.len() - 1;
        let pos = t * last as f64;
        let i = (pos.floor() as usize).min(last);
        if i == last {
            return self.stops[last];
        }
        let frac = pos - i as f64;
        let (a, b) = (self.stops[i], self.stops[i + 1]);
        let mix = |x: u8, y: u8| (x as f64 + (y as f64 - x as f64) * frac).round() as u8;
        (mix(a.0, b.0), mix(a.1, b.1), mix(a.2, b.2))
    }

    /// Sample a value from [vmin, vmax].
    pub fn sample_range(&self, value: f64, vmin: f64, vmax: f64) -> Rgb {
        if vmax <= vmin {
            return self.sample(0.5);
        }
        self.sample((value - vmin) / (vmax - vmin))
    }
}
