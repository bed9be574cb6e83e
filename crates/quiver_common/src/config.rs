use crate::progress_ui::ProgressMode;

/// Tile size used for every fixed-size tiled adverb unless a pass is given an explicit list.
pub const DEFAULT_REG_TILE_SIZE: i64 = 4;

// Loop bodies with more statements than this are never unrolled
pub const MAX_UNROLL_BODY_STMTS: usize = 50;

#[derive(Clone, Debug)]
pub struct PassOptions {
    pub unroll_factor: usize,
    // Consumed in order, one entry per fixed-size tiled adverb encountered.  Running past the end
    // of the list falls back to `DEFAULT_REG_TILE_SIZE`.
    pub fixed_tile_sizes: Vec<i64>,
    pub progress: ProgressMode,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            unroll_factor: 4,
            fixed_tile_sizes: Vec::new(),
            progress: ProgressMode::Hidden,
        }
    }
}

impl PassOptions {
    pub fn fixed_tile_size(&self, idx: usize) -> i64 {
        self.fixed_tile_sizes
            .get(idx)
            .copied()
            .unwrap_or(DEFAULT_REG_TILE_SIZE)
    }
}
