use nbmeter::device::alarm::*;
use nbmeter::device::meter::*;

#[cfg(test)]
mod alarm_timer_tests {
    use super::*;

    #[test]
    fn test_timer_accumulates_while_condition_holds() {
        let mut timer = AlarmTimer::for_kind(AlarmKind::Freeze);

        assert_eq!(timer.update(true, 30_000), AlarmEdge::Unchanged);
        assert_eq!(timer.elapsed_ms(), 30_000);
        assert!(!timer.is_active());
        assert!((timer.progress() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_timer_saturates_at_threshold() {
        let mut timer = AlarmTimer::for_kind(AlarmKind::Magnet);

        assert_eq!(timer.update(true, 10 * MAGNET_THRESHOLD_MS), AlarmEdge::Entered);
        assert_eq!(timer.elapsed_ms(), MAGNET_THRESHOLD_MS);

        assert_eq!(timer.update(true, 1_000), AlarmEdge::Unchanged);
        assert_eq!(timer.elapsed_ms(), MAGNET_THRESHOLD_MS);
        assert!(timer.is_active());
    }

    #[test]
    fn test_timer_snaps_to_zero() {
        let mut timer = AlarmTimer::for_kind(AlarmKind::Backflow);
        timer.update(true, BACKFLOW_THRESHOLD_MS);
        assert!(timer.is_active());

        assert_eq!(timer.update(false, 1), AlarmEdge::Cleared);
        assert_eq!(timer.elapsed_ms(), 0);

        // A partial run is discarded as well.
        timer.update(true, 59_000);
        assert_eq!(timer.update(false, 1), AlarmEdge::Unchanged);
        assert_eq!(timer.elapsed_ms(), 0);
    }

    #[test]
    fn test_thresholds() {
        assert_eq!(AlarmKind::Freeze.threshold_ms(), 60_000);
        assert_eq!(AlarmKind::Magnet.threshold_ms(), 300_000);
        assert_eq!(AlarmKind::Overload.threshold_ms(), 300_000);
        assert_eq!(AlarmKind::Backflow.threshold_ms(), 60_000);
    }
}

#[cfg(test)]
mod meter_model_tests {
    use super::*;

    #[test]
    fn test_default_state() {
        let meter = MeterModel::new();
        let state = meter.state();

        assert_eq!(state.usage_m3, DEFAULT_USAGE_M3);
        assert_eq!(state.flow_lph, 0.0);
        assert_eq!(state.temp_c, DEFAULT_TEMPERATURE_C);
        assert_eq!(state.voltage_v, DEFAULT_VOLTAGE_V);
        for kind in AlarmKind::ALL {
            assert_eq!(state.alarms.get(kind).elapsed_ms(), 0);
        }
    }

    #[test]
    fn test_usage_integration() {
        let mut meter = MeterModel::new();
        meter.apply(MeterInput::Flow(3600.0));

        meter.advance(3_600_000);
        assert!((meter.state().usage_m3 - (DEFAULT_USAGE_M3 + 3.6)).abs() < 1e-9);
    }

    #[test]
    fn test_backflow_decreases_usage() {
        let mut meter = MeterModel::new();
        meter.apply(MeterInput::Flow(-360.0));

        meter.advance(600_000);
        assert!((meter.state().usage_m3 - (DEFAULT_USAGE_M3 - 0.06)).abs() < 1e-9);
        assert!(meter.state().is_alarm_active(AlarmKind::Backflow));
    }

    #[test]
    fn test_quiet_meter_keeps_timers_at_zero() {
        let mut meter = MeterModel::new();

        let transitions = meter.advance(86_400_000);
        assert!(transitions.is_empty());
        for kind in AlarmKind::ALL {
            assert_eq!(meter.state().alarms.get(kind).elapsed_ms(), 0);
        }
        assert_eq!(meter.state().usage_m3, DEFAULT_USAGE_M3);
    }

    #[test]
    fn test_freeze_alarm_after_one_minute() {
        let mut meter = MeterModel::new();
        meter.apply(MeterInput::Temperature(0.0));

        assert!(meter.advance(59_999).is_empty());
        assert!(!meter.state().is_alarm_active(AlarmKind::Freeze));

        let transitions = meter.advance(1);
        assert_eq!(transitions.as_slice(), &[(AlarmKind::Freeze, AlarmEdge::Entered)]);
        assert!(meter.state().is_alarm_active(AlarmKind::Freeze));

        meter.apply(MeterInput::Temperature(4.0));
        let transitions = meter.advance(1);
        assert_eq!(transitions.as_slice(), &[(AlarmKind::Freeze, AlarmEdge::Cleared)]);
        assert_eq!(meter.state().alarms.freeze.elapsed_ms(), 0);
    }

    #[test]
    fn test_overload_needs_flow_above_limit() {
        let mut meter = MeterModel::new();

        meter.apply(MeterInput::Flow(OVERLOAD_FLOW_LPH));
        meter.advance(OVERLOAD_THRESHOLD_MS);
        assert_eq!(meter.state().alarms.overload.elapsed_ms(), 0);

        meter.apply(MeterInput::Flow(OVERLOAD_FLOW_LPH + 0.1));
        meter.advance(OVERLOAD_THRESHOLD_MS);
        assert!(meter.state().is_alarm_active(AlarmKind::Overload));
    }

    #[test]
    fn test_magnet_alarm() {
        let mut meter = MeterModel::new();
        meter.apply(MeterInput::Magnet(true));

        meter.advance(299_000);
        assert!(!meter.state().is_alarm_active(AlarmKind::Magnet));
        meter.advance(1_000);
        assert!(meter.state().is_alarm_active(AlarmKind::Magnet));
    }

    #[test]
    fn test_non_positive_delta_is_ignored() {
        let mut meter = MeterModel::new();
        meter.apply(MeterInput::Flow(1000.0));
        meter.apply(MeterInput::Temperature(-3.0));

        meter.advance(0);
        meter.advance(-500);
        assert_eq!(meter.state().usage_m3, DEFAULT_USAGE_M3);
        assert_eq!(meter.state().alarms.freeze.elapsed_ms(), 0);
    }
}

#[cfg(test)]
mod status_byte_tests {
    use super::*;

    #[test]
    fn test_default_status_bytes() {
        let state = MeterState::default();

        // 3.6 V is two steps below full charge.
        assert_eq!(state.status1(), 0x02);
        assert_eq!(state.status2(), 0x0B);
        assert_eq!(state.packet_status(), 0x00);
    }

    #[test]
    fn test_status_bits_follow_alarms() {
        let mut meter = MeterModel::new();
        meter.apply(MeterInput::Voltage(3.7));
        meter.apply(MeterInput::Flow(2000.0));
        meter.apply(MeterInput::Leak(true));
        meter.apply(MeterInput::Magnet(true));
        meter.apply(MeterInput::Temperature(-1.0));
        meter.advance(300_000);

        let state = meter.state();
        assert_eq!(state.status1(), 0x80 | 0x20);
        assert_eq!(state.status2(), 0x80 | 0x40 | 0x0B);
        assert_eq!(state.packet_status(), 0x80 | 0x20 | 0x10 | 0x08);
    }

    #[test]
    fn test_leak_is_reported_without_timer() {
        let mut meter = MeterModel::new();
        meter.apply(MeterInput::Leak(true));

        assert_eq!(meter.state().status1() & 0x20, 0x20);
        assert_eq!(meter.state().packet_status(), 0x20);
    }
}
