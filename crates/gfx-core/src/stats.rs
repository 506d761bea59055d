//! Per-frame counters.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    pub draw_calls: u32,
    pub triangle_count: u64,
}

impl FrameStats {
    pub fn record_draw(&mut self, primitives: u32) {
        self.draw_calls += 1;
        self.triangle_count += u64::from(primitives);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
