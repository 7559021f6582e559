//! Shared framebuffer written by every connection.
//!
//! Each cell is a single `AtomicU32` holding the color packed as
//! `0x00RRGGBB`, so writers to different cells never contend and a reader
//! always sees a whole color. There is no cross-cell consistency: pixels are
//! independent.

use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

/// Largest width or height a framebuffer may have (coordinates are `u16`).
pub const MAX_DIMENSION: u32 = u16::MAX as u32;

/// An RGB color with 8 bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color { r: 0, g: 0, b: 0 };

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    #[inline]
    fn pack(self) -> u32 {
        ((self.r as u32) << 16) | ((self.g as u32) << 8) | self.b as u32
    }

    #[inline]
    fn unpack(value: u32) -> Self {
        Self {
            r: (value >> 16) as u8,
            g: (value >> 8) as u8,
            b: value as u8,
        }
    }
}

/// Framebuffer construction errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramebufferError {
    /// Width or height is zero or larger than `MAX_DIMENSION`
    InvalidDimensions { width: u32, height: u32 },
    /// The grid could not be allocated
    Allocation { cells: usize },
}

impl std::fmt::Display for FramebufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramebufferError::InvalidDimensions { width, height } => write!(
                f,
                "Invalid framebuffer dimensions {}x{} (each must be 1..={})",
                width, height, MAX_DIMENSION
            ),
            FramebufferError::Allocation { cells } => write!(
                f,
                "Failed to allocate framebuffer of {} pixels ({} bytes)",
                cells,
                cells.saturating_mul(std::mem::size_of::<AtomicU32>())
            ),
        }
    }
}

impl std::error::Error for FramebufferError {}

/// Fixed-size grid of colors, row-major.
pub struct Framebuffer {
    cells: Box<[AtomicU32]>,
    width: u16,
    height: u16,
}

impl Framebuffer {
    /// Create a black framebuffer of the given size.
    ///
    /// Each pixel takes four bytes, so the largest grid needs about 16 GiB.
    /// A failed allocation is reported as `FramebufferError::Allocation`;
    /// with memory overcommit the kernel may still refuse the pages later.
    pub fn new(width: u32, height: u32) -> Result<Self, FramebufferError> {
        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(FramebufferError::InvalidDimensions { width, height });
        }

        info!(width, height, "Initializing framebuffer");

        let cells = allocate_cells(width as usize * height as usize)?;

        Ok(Self {
            cells,
            width: width as u16,
            height: height as u16,
        })
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    #[inline]
    fn index(&self, x: u16, y: u16) -> Option<usize> {
        if x >= self.width || y >= self.height {
            None
        } else {
            Some(y as usize * self.width as usize + x as usize)
        }
    }

    /// Store `color` at `(x, y)`. Out-of-range coordinates are dropped.
    #[inline]
    pub fn set(&self, x: u16, y: u16, color: Color) {
        if let Some(idx) = self.index(x, y) {
            self.cells[idx].store(color.pack(), Ordering::Relaxed);
        }
    }

    /// Read the color at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if the coordinates are outside the framebuffer. Use
    /// [`Framebuffer::try_get`] when the coordinates are not trusted.
    pub fn get(&self, x: u16, y: u16) -> Color {
        match self.try_get(x, y) {
            Some(color) => color,
            None => panic!(
                "pixel ({}, {}) out of bounds for {}x{} framebuffer",
                x, y, self.width, self.height
            ),
        }
    }

    pub fn try_get(&self, x: u16, y: u16) -> Option<Color> {
        self.index(x, y)
            .map(|idx| Color::unpack(self.cells[idx].load(Ordering::Relaxed)))
    }

    /// Copy the whole grid, row-major. Each cell is read atomically; the
    /// copy as a whole is not a consistent point-in-time image.
    pub fn snapshot(&self) -> Vec<Color> {
        self.cells
            .iter()
            .map(|cell| Color::unpack(cell.load(Ordering::Relaxed)))
            .collect()
    }
}

fn allocate_cells(len: usize) -> Result<Box<[AtomicU32]>, FramebufferError> {
    let mut cells = Vec::new();
    cells
        .try_reserve_exact(len)
        .map_err(|_| FramebufferError::Allocation { cells: len })?;
    cells.extend((0..len).map(|_| AtomicU32::new(Color::BLACK.pack())));
    Ok(cells.into_boxed_slice())
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}
