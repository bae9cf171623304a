use crate::config::QueueConfig;

/// Exponentially weighted moving average with a 30-sample age
/// (decay `2 / 31`). The first sample seeds the average.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleEwma {
    value: f64,
    seeded: bool,
}

const AVG_METRIC_AGE: f64 = 30.0;
const DECAY: f64 = 2.0 / (AVG_METRIC_AGE + 1.0);

impl SimpleEwma {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sample: f64) {
        if self.seeded {
            self.value = sample * DECAY + self.value * (1.0 - DECAY);
        } else {
            self.value = sample;
            self.seeded = true;
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Average of recently observed constrained-item counts, oldest first.
pub fn ewma_of(samples: &[i64]) -> f64 {
    let mut ewma = SimpleEwma::new();
    for s in samples {
        ewma.add(*s as f64);
    }
    ewma.value()
}

/// Next peek batch: `multiplier × ewma`, clamped to the configured range.
pub fn peek_size(samples: &[i64], config: &QueueConfig) -> i64 {
    if samples.is_empty() {
        return config.peek_min;
    }
    let size = (ewma_of(samples) * config.peek_curr_multiplier as f64).ceil() as i64;
    size.clamp(config.peek_min, config.peek_max)
}
