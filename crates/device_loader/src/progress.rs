//! Nested progress tracking
//!
//! Level 0 counts every image the pass will touch, level 1 the current
//! phase, level 2 the current archive or stack, level 3 the current pull or
//! compose-up. Finer levels are folded into coarser ones when reporting.

pub const MAX_LEVEL: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressLevel {
    pub tick: u64,
    pub total: u64,
    pub action: Option<String>,
    pub output: Option<String>,
}

impl Default for ProgressLevel {
    fn default() -> Self {
        Self {
            tick: 0,
            total: 1,
            action: None,
            output: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    levels: [ProgressLevel; MAX_LEVEL],
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self, level: usize) -> &ProgressLevel {
        &self.levels[level]
    }

    pub fn levels(&self) -> &[ProgressLevel; MAX_LEVEL] {
        &self.levels
    }

    /// Start a new step at `level`: reset its tick, set its action, clear
    /// its output and everything below it
    pub fn set_status(&mut self, level: usize, action: impl Into<String>) {
        self.set_tick(level, 0);
        self.set_action(level, action);
        self.levels[level].output = None;
    }

    pub fn tick(&mut self, level: usize) {
        self.levels[level].tick += 1;
    }

    pub fn set_tick(&mut self, level: usize, tick: u64) {
        self.levels[level].tick = tick;
    }

    pub fn set_total(&mut self, level: usize, total: u64) {
        self.levels[level].total = total;
    }

    /// Set the action at `level`; finer levels lose their action and tick
    pub fn set_action(&mut self, level: usize, action: impl Into<String>) {
        for finer in &mut self.levels[level + 1..] {
            finer.action = None;
            finer.tick = 0;
        }
        self.levels[level].action = Some(action.into());
    }

    pub fn set_output(&mut self, level: usize, output: Option<String>) {
        self.levels[level].output = output;
    }

    pub fn append_output(&mut self, level: usize, line: &str) {
        let output = self.levels[level].output.get_or_insert_with(String::new);
        output.push('\n');
        output.push_str(line);
    }

    /// Mark every level as failed with the same message
    pub fn fail(&mut self, message: &str) {
        let action = format!("ERROR: {}", message);
        for level in 0..MAX_LEVEL {
            self.set_action(level, action.clone());
        }
    }

    /// Percentage per level, each including the share of its finer level
    pub fn percentages(&self) -> [u64; MAX_LEVEL] {
        let mut out = [0u64; MAX_LEVEL];
        for level in (0..MAX_LEVEL).rev() {
            let current = &self.levels[level];
            let base = percentage(current.tick, current.total);
            let finer = if level + 1 < MAX_LEVEL && current.total > 0 {
                out[level + 1] / current.total
            } else {
                0
            };
            out[level] = (base + finer).min(100);
        }
        out
    }
}

/// `partial` as a whole percentage of `total`; a zero total counts as one
pub fn percentage(partial: u64, total: u64) -> u64 {
    let total = total.max(1);
    partial.min(total) * 100 / total
}
