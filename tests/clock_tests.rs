use nbmeter::clock::*;
use std::time::Duration;

const START_MS: i64 = 1_767_225_600_000;

#[test]
fn test_speed_multipliers() {
    assert_eq!(SpeedLevel::Pause.multiplier(), 0);
    assert_eq!(SpeedLevel::X1.multiplier(), 1);
    assert_eq!(SpeedLevel::X60.multiplier(), 60);
    assert_eq!(SpeedLevel::X1H.multiplier(), 3600);
    assert_eq!(SpeedLevel::Max.multiplier(), 86400);
}

#[test]
fn test_speed_from_index() {
    assert_eq!(SpeedLevel::from_index(0), Some(SpeedLevel::Pause));
    assert_eq!(SpeedLevel::from_index(4), Some(SpeedLevel::Max));
    assert_eq!(SpeedLevel::from_index(5), None);
    assert_eq!(SpeedLevel::default(), SpeedLevel::X1);
}

#[test]
fn test_paused_clock_does_not_move() {
    let mut clock = VirtualClock::new(START_MS, SpeedLevel::Pause);

    assert_eq!(clock.advance_by(Duration::from_secs(10)), 0);
    assert_eq!(clock.now_ms(), START_MS);
}

#[test]
fn test_scaled_advance() {
    let mut clock = VirtualClock::new(START_MS, SpeedLevel::X1H);

    // 100 ms of real time is six virtual minutes.
    assert_eq!(clock.advance_by(Duration::from_millis(100)), 360_000);
    assert_eq!(clock.now_ms(), START_MS + 360_000);

    clock.set_speed(SpeedLevel::Max);
    assert_eq!(clock.advance_by(Duration::from_secs(1)), 86_400_000);
}

#[test]
fn test_virtual_time_is_monotonic() {
    let mut clock = VirtualClock::new(START_MS, SpeedLevel::X60);
    let mut previous = clock.now_ms();

    for level in SpeedLevel::ALL {
        clock.set_speed(level);
        for _ in 0..10 {
            let dt = clock.advance_by(Duration::from_micros(16_667));
            assert!(dt >= 0);
            assert!(clock.now_ms() >= previous);
            previous = clock.now_ms();
        }
    }
}

#[test]
fn test_wall_clock_advance_never_negative() {
    let mut clock = VirtualClock::new(START_MS, SpeedLevel::X1);
    assert!(clock.advance() >= 0);
    assert!(clock.now_ms() >= START_MS);
}

#[test]
fn test_pacing_delay_by_speed() {
    assert_eq!(VirtualClock::new(0, SpeedLevel::X1).pacing_delay_ms(), PACING_DELAY_MS);
    assert_eq!(VirtualClock::new(0, SpeedLevel::X60).pacing_delay_ms(), PACING_DELAY_MS);
    assert_eq!(VirtualClock::new(0, SpeedLevel::X1H).pacing_delay_ms(), 0);
    assert_eq!(VirtualClock::new(0, SpeedLevel::Max).pacing_delay_ms(), 0);
}
