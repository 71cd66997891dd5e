use serde::{Deserialize, Serialize};

pub const FREEZE_THRESHOLD_MS: i64 = 60_000;
pub const MAGNET_THRESHOLD_MS: i64 = 300_000;
pub const OVERLOAD_THRESHOLD_MS: i64 = 300_000;
pub const BACKFLOW_THRESHOLD_MS: i64 = 60_000;

/// Flow above this rate (L/h) counts toward the overload alarm.
pub const OVERLOAD_FLOW_LPH: f64 = 1600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmKind {
    Freeze,
    Magnet,
    Overload,
    Backflow,
}

impl AlarmKind {
    pub const ALL: [AlarmKind; 4] = [
        AlarmKind::Freeze,
        AlarmKind::Magnet,
        AlarmKind::Overload,
        AlarmKind::Backflow,
    ];

    pub fn threshold_ms(self) -> i64 {
        match self {
            AlarmKind::Freeze => FREEZE_THRESHOLD_MS,
            AlarmKind::Magnet => MAGNET_THRESHOLD_MS,
            AlarmKind::Overload => OVERLOAD_THRESHOLD_MS,
            AlarmKind::Backflow => BACKFLOW_THRESHOLD_MS,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AlarmKind::Freeze => "freeze",
            AlarmKind::Magnet => "magnet tamper",
            AlarmKind::Overload => "overload",
            AlarmKind::Backflow => "backflow",
        }
    }
}

impl core::fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

/// Level change observed by a single [`AlarmTimer::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmEdge {
    Unchanged,
    Entered,
    Cleared,
}

/// Accumulates virtual time while a fault condition holds.
///
/// The accumulator saturates at its threshold and drops straight back to zero
/// the moment the condition clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmTimer {
    elapsed_ms: i64,
    threshold_ms: i64,
}

impl AlarmTimer {
    pub fn new(threshold_ms: i64) -> Self {
        debug_assert!(threshold_ms > 0, "Alarm threshold must be positive");
        Self {
            elapsed_ms: 0,
            threshold_ms,
        }
    }

    pub fn for_kind(kind: AlarmKind) -> Self {
        Self::new(kind.threshold_ms())
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.elapsed_ms
    }

    pub fn threshold_ms(&self) -> i64 {
        self.threshold_ms
    }

    pub fn is_active(&self) -> bool {
        self.elapsed_ms >= self.threshold_ms
    }

    /// Fraction of the threshold reached, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        self.elapsed_ms as f64 / self.threshold_ms as f64
    }

    pub fn update(&mut self, condition: bool, dt_ms: i64) -> AlarmEdge {
        let was_active = self.is_active();

        if condition {
            self.elapsed_ms = self
                .elapsed_ms
                .saturating_add(dt_ms.max(0))
                .min(self.threshold_ms);
        } else {
            self.elapsed_ms = 0;
        }

        debug_assert!(
            self.elapsed_ms <= self.threshold_ms,
            "Alarm timer {} exceeds threshold {}",
            self.elapsed_ms,
            self.threshold_ms
        );

        match (was_active, self.is_active()) {
            (false, true) => AlarmEdge::Entered,
            (true, false) => AlarmEdge::Cleared,
            _ => AlarmEdge::Unchanged,
        }
    }

    pub fn reset(&mut self) {
        self.elapsed_ms = 0;
    }
}

/// The four timers tracked by the meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmTimers {
    pub freeze: AlarmTimer,
    pub magnet: AlarmTimer,
    pub overload: AlarmTimer,
    pub backflow: AlarmTimer,
}

impl AlarmTimers {
    pub fn new() -> Self {
        Self {
            freeze: AlarmTimer::for_kind(AlarmKind::Freeze),
            magnet: AlarmTimer::for_kind(AlarmKind::Magnet),
            overload: AlarmTimer::for_kind(AlarmKind::Overload),
            backflow: AlarmTimer::for_kind(AlarmKind::Backflow),
        }
    }

    pub fn get(&self, kind: AlarmKind) -> &AlarmTimer {
        match kind {
            AlarmKind::Freeze => &self.freeze,
            AlarmKind::Magnet => &self.magnet,
            AlarmKind::Overload => &self.overload,
            AlarmKind::Backflow => &self.backflow,
        }
    }

    pub fn get_mut(&mut self, kind: AlarmKind) -> &mut AlarmTimer {
        match kind {
            AlarmKind::Freeze => &mut self.freeze,
            AlarmKind::Magnet => &mut self.magnet,
            AlarmKind::Overload => &mut self.overload,
            AlarmKind::Backflow => &mut self.backflow,
        }
    }

    pub fn is_active(&self, kind: AlarmKind) -> bool {
        self.get(kind).is_active()
    }
}

impl Default for AlarmTimers {
    fn default() -> Self {
        Self::new()
    }
}
