//! Accelerated virtual clock.
//!
//! Real elapsed time is scaled by the selected [`SpeedLevel`] and committed to
//! an absolute virtual timestamp in milliseconds. Sub-millisecond remainders
//! are carried between calls so the virtual clock does not drift when it is
//! driven at a high frame rate.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Visual pacing delay applied in CONNECT and SEND at low speeds.
pub const PACING_DELAY_MS: i64 = 500;
/// Above this multiplier the pacing delay is skipped.
const PACING_MAX_MULTIPLIER: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpeedLevel {
    Pause,
    #[default]
    X1,
    X60,
    X1H,
    Max,
}

impl SpeedLevel {
    pub const ALL: [SpeedLevel; 5] = [
        SpeedLevel::Pause,
        SpeedLevel::X1,
        SpeedLevel::X60,
        SpeedLevel::X1H,
        SpeedLevel::Max,
    ];

    pub fn multiplier(self) -> u32 {
        match self {
            SpeedLevel::Pause => 0,
            SpeedLevel::X1 => 1,
            SpeedLevel::X60 => 60,
            SpeedLevel::X1H => 3600,
            SpeedLevel::Max => 86400,
        }
    }

    /// Slider index as shown on the control panel (0 = PAUSE .. 4 = MAX).
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            SpeedLevel::Pause => "PAUSE",
            SpeedLevel::X1 => "x1",
            SpeedLevel::X60 => "x60",
            SpeedLevel::X1H => "x1H",
            SpeedLevel::Max => "MAX",
        }
    }
}

impl core::fmt::Display for SpeedLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone)]
pub struct VirtualClock {
    virtual_time_ms: i64,
    speed: SpeedLevel,
    last_real: Instant,
    // Scaled microseconds not yet committed as a whole virtual millisecond.
    carry_us: i64,
}

impl VirtualClock {
    pub fn new(start_ms: i64, speed: SpeedLevel) -> Self {
        Self {
            virtual_time_ms: start_ms,
            speed,
            last_real: Instant::now(),
            carry_us: 0,
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.virtual_time_ms
    }

    pub fn speed(&self) -> SpeedLevel {
        self.speed
    }

    pub fn multiplier(&self) -> u32 {
        self.speed.multiplier()
    }

    /// Switches speed and drops whatever real time elapsed since the last
    /// advance, so no backlog is replayed at the new multiplier.
    pub fn set_speed(&mut self, speed: SpeedLevel) {
        self.speed = speed;
        self.last_real = Instant::now();
        self.carry_us = 0;
    }

    /// Measures real time since the previous call and commits the scaled
    /// delta. Returns the virtual milliseconds elapsed (zero when paused).
    pub fn advance(&mut self) -> i64 {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_real);
        self.last_real = now;
        self.advance_by(elapsed)
    }

    /// Commits an explicit amount of real elapsed time. The wall clock is not
    /// consulted, which makes replays and tests deterministic.
    pub fn advance_by(&mut self, real_elapsed: Duration) -> i64 {
        let multiplier = i64::from(self.multiplier());
        if multiplier == 0 {
            return 0;
        }

        let elapsed_us = i64::try_from(real_elapsed.as_micros()).unwrap_or(i64::MAX);
        let scaled_us = elapsed_us
            .saturating_mul(multiplier)
            .saturating_add(self.carry_us);

        let delta_ms = scaled_us / 1000;
        self.carry_us = scaled_us % 1000;
        self.virtual_time_ms = self.virtual_time_ms.saturating_add(delta_ms);

        delta_ms
    }

    /// Delay the modem holds in CONNECT and SEND at the current speed.
    pub fn pacing_delay_ms(&self) -> i64 {
        if self.multiplier() <= PACING_MAX_MULTIPLIER {
            PACING_DELAY_MS
        } else {
            0
        }
    }
}
