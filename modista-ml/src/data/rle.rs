//! Run-length encoded segmentation masks.
//!
//! Annotations store each segment as whitespace-separated `start length`
//! pairs. Starts are 1-based and pixels are numbered column-major, i.e. down
//! the first column, then down the second, and so on.

use crate::error::MlError;

/// Binary mask stored row-major, one byte per pixel (0 or 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Mask {
    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        }
    }

    /// Wrap an existing row-major buffer; non-zero bytes count as foreground.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self, MlError> {
        if data.len() != width as usize * height as usize {
            return Err(MlError::invalid_input(format!(
                "mask buffer has {} bytes, expected {}x{}",
                data.len(),
                width,
                height
            )));
        }
        let data = data.into_iter().map(|v| u8::from(v != 0)).collect();
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        self.data[(y * self.width + x) as usize] != 0
    }

    pub fn set(&mut self, x: u32, y: u32, on: bool) {
        self.data[(y * self.width + x) as usize] = u8::from(on);
    }

    /// Number of foreground pixels.
    pub fn area(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&v| v == 0)
    }

    /// Nearest-neighbour resize.
    pub fn resize_nearest(&self, width: u32, height: u32) -> Mask {
        let mut out = Mask::zeros(width, height);
        if self.width == 0 || self.height == 0 {
            return out;
        }
        for y in 0..height {
            let sy = source_coord(y, height, self.height);
            for x in 0..width {
                let sx = source_coord(x, width, self.width);
                if self.get(sx, sy) {
                    out.set(x, y, true);
                }
            }
        }
        out
    }

    /// Tight bounding box `[x0, y0, x1, y1]` with exclusive max edges.
    pub fn bbox(&self) -> Option<[f32; 4]> {
        let mut x0 = u32::MAX;
        let mut y0 = u32::MAX;
        let mut x1 = 0;
        let mut y1 = 0;
        let mut any = false;
        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y) {
                    any = true;
                    x0 = x0.min(x);
                    y0 = y0.min(y);
                    x1 = x1.max(x + 1);
                    y1 = y1.max(y + 1);
                }
            }
        }
        any.then(|| [x0 as f32, y0 as f32, x1 as f32, y1 as f32])
    }

    /// Intersection over union with a mask of the same size.
    pub fn iou(&self, other: &Mask) -> f32 {
        if self.width != other.width || self.height != other.height {
            return 0.0;
        }
        let mut inter = 0usize;
        let mut union = 0usize;
        for (a, b) in self.data.iter().zip(&other.data) {
            let a = *a != 0;
            let b = *b != 0;
            if a && b {
                inter += 1;
            }
            if a || b {
                union += 1;
            }
        }
        if union == 0 {
            0.0
        } else {
            inter as f32 / union as f32
        }
    }
}

fn source_coord(dst: u32, dst_len: u32, src_len: u32) -> u32 {
    let pos = ((dst as f64 + 0.5) * src_len as f64 / dst_len as f64) as u32;
    pos.min(src_len - 1)
}

/// Decode an RLE string into a `width x height` mask.
pub fn decode(rle: &str, height: u32, width: u32) -> Result<Mask, MlError> {
    let total = height as u64 * width as u64;
    let tokens = rle
        .split_whitespace()
        .map(|t| {
            t.parse::<u64>()
                .map_err(|_| MlError::annotation(format!("invalid RLE token '{t}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if tokens.len() % 2 != 0 {
        return Err(MlError::annotation(format!(
            "RLE has an odd number of tokens ({})",
            tokens.len()
        )));
    }

    let mut mask = Mask::zeros(width, height);
    for pair in tokens.chunks_exact(2) {
        let (start, length) = (pair[0], pair[1]);
        if start == 0 {
            return Err(MlError::annotation("RLE starts are 1-based; found 0"));
        }
        let begin = start - 1;
        let end = match begin.checked_add(length) {
            Some(end) if end <= total => end,
            _ => {
                return Err(MlError::annotation(format!(
                    "RLE run {start}+{length} exceeds {width}x{height} image"
                )));
            }
        };
        for p in begin..end {
            let x = (p / height as u64) as u32;
            let y = (p % height as u64) as u32;
            mask.set(x, y, true);
        }
    }
    Ok(mask)
}

/// Encode a mask back into column-major RLE.
pub fn encode(mask: &Mask) -> String {
    let height = mask.height() as u64;
    let total = height * mask.width() as u64;
    let mut runs: Vec<(u64, u64)> = Vec::new();
    let mut current: Option<(u64, u64)> = None;
    for p in 0..total {
        let x = (p / height) as u32;
        let y = (p % height) as u32;
        if mask.get(x, y) {
            current = match current {
                Some((start, len)) => Some((start, len + 1)),
                None => Some((p + 1, 1)),
            };
        } else if let Some(run) = current.take() {
            runs.push(run);
        }
    }
    if let Some(run) = current {
        runs.push(run);
    }
    runs.iter()
        .map(|(start, len)| format!("{start} {len}"))
        .collect::<Vec<_>>()
        .join(" ")
}
