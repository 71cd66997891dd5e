pub mod alarm;
pub mod meter;
pub mod modem;

pub use alarm::{AlarmEdge, AlarmKind, AlarmTimer, AlarmTimers};
pub use meter::{MeterInput, MeterModel, MeterState};
pub use modem::{
    ModemController, ModemEvent, ModemInput, ModemMode, ModemStatus, ReadingRecord, Schedule,
    TickInput,
};
