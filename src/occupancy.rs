// occupancy.rs — Spatial occupancy for minimum-separation feature extraction.
//
// The image is divided into square cells whose side equals the minimum
// feature distance. Each cell remembers the points placed in it, so a
// separation query only has to look at the 3×3 block of cells around
// the candidate. New features are admitted only where no existing or
// freshly extracted feature lies closer than `min_distance`.

/// Cell grid over the image holding occupied point positions.
pub struct OccupancyGrid {
    cells: Vec<Vec<(f32, f32)>>,
    cols: usize,
    rows: usize,
    cell_size: usize,
    min_distance_sq: f32,
    img_w: usize,
    img_h: usize,
}

impl OccupancyGrid {
    /// Grid for a `img_w`×`img_h` image enforcing `min_distance` pixels.
    pub fn new(img_w: usize, img_h: usize, min_distance: usize) -> Self {
        let cell_size = min_distance.max(1);
        let cols = img_w.div_ceil(cell_size).max(1);
        let rows = img_h.div_ceil(cell_size).max(1);
        OccupancyGrid {
            cells: vec![Vec::new(); cols * rows],
            cols,
            rows,
            cell_size,
            min_distance_sq: (min_distance * min_distance) as f32,
            img_w,
            img_h,
        }
    }

    /// Record a point. Points outside the image are ignored.
    pub fn mark(&mut self, x: f32, y: f32) {
        if let Some((col, row)) = self.cell_of(x, y) {
            self.cells[row * self.cols + col].push((x, y));
        }
    }

    /// True if (x, y) is inside the image and at least `min_distance`
    /// away from every marked point.
    pub fn is_free(&self, x: f32, y: f32) -> bool {
        let Some((col, row)) = self.cell_of(x, y) else {
            return false;
        };
        let r0 = row.saturating_sub(1);
        let r1 = (row + 1).min(self.rows - 1);
        let c0 = col.saturating_sub(1);
        let c1 = (col + 1).min(self.cols - 1);
        for r in r0..=r1 {
            for c in c0..=c1 {
                for &(px, py) in &self.cells[r * self.cols + c] {
                    let dx = px - x;
                    let dy = py - y;
                    if dx * dx + dy * dy < self.min_distance_sq {
                        return false;
                    }
                }
            }
        }
        true
    }

    pub fn clear(&mut self) {
        for cell in &mut self.cells {
            cell.clear();
        }
    }

    /// Number of marked points.
    pub fn len(&self) -> usize {
        self.cells.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(Vec::is_empty)
    }

    /// Grid dimensions (cols, rows).
    pub fn dims(&self) -> (usize, usize) {
        (self.cols, self.rows)
    }

    fn cell_of(&self, x: f32, y: f32) -> Option<(usize, usize)> {
        if !(x >= 0.0 && y >= 0.0 && x < self.img_w as f32 && y < self.img_h as f32) {
            return None;
        }
        let col = (x as usize / self.cell_size).min(self.cols - 1);
        let row = (y as usize / self.cell_size).min(self.rows - 1);
        Some((col, row))
    }
}
