use nbmeter::config::ConfigError;
use nbmeter::device::meter::{MeterInput, DEFAULT_USAGE_M3};
use nbmeter::device::modem::{ModemInput, ModemMode};
use nbmeter::events::{EventCategory, EventSink, LogEvent, PacketRecord, LOG_HISTORY_SIZE};
use nbmeter::protocol::CommandType;
use nbmeter::simulation::*;
use nbmeter::{SimulationConfig, SpeedLevel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const T0: i64 = 1_767_225_600_000;
// One tick at x1H: six virtual minutes.
const FRAME: Duration = Duration::from_millis(100);

fn config(speed: SpeedLevel) -> SimulationConfig {
    SimulationConfig {
        start_time_ms: Some(T0),
        speed,
        ..SimulationConfig::default()
    }
}

/// A context whose startup event has already gone out.
fn started(speed: SpeedLevel) -> SimulationContext {
    let mut sim = SimulationContext::new(&config(speed)).unwrap();
    sim.tick_with(Duration::ZERO);
    sim
}

fn run(sim: &mut SimulationContext, ticks: usize) -> Vec<TickReport> {
    (0..ticks).map(|_| sim.tick_with(FRAME)).collect()
}

#[derive(Clone, Default)]
struct CountingSink {
    counts: Arc<Mutex<(usize, usize)>>,
}

impl EventSink for CountingSink {
    fn on_log(&mut self, _event: &LogEvent) {
        self.counts.lock().unwrap().0 += 1;
    }

    fn on_packet(&mut self, _record: &PacketRecord) {
        self.counts.lock().unwrap().1 += 1;
    }
}

#[cfg(test)]
mod input_tests {
    use super::*;

    #[test]
    fn test_startup_event() {
        let mut sim = SimulationContext::new(&config(SpeedLevel::X1)).unwrap();

        assert_eq!(sim.now_ms(), T0);
        assert_eq!(sim.history().log_count(), 0);
        assert_eq!(sim.modem().schedule().next_read_at, T0);
        assert_eq!(sim.modem().schedule().next_report_at, T0 + 6 * 3_600_000);

        let report = sim.tick_with(Duration::ZERO);
        assert_eq!(report.logs.len(), 1);
        assert_eq!(report.logs[0].message, "System initialized");
        assert_eq!(report.logs[0].timestamp_ms, T0);
        assert_eq!(sim.history().log_count(), 1);

        // Announced once only.
        assert!(sim.tick_with(FRAME).logs.iter().all(|e| e.message != "System initialized"));
    }

    #[test]
    fn test_startup_event_reaches_sinks() {
        let mut sim = SimulationContext::new(&config(SpeedLevel::X1)).unwrap();
        let sink = CountingSink::default();
        sim.add_sink(Box::new(sink.clone()));

        sim.tick_with(Duration::ZERO);
        assert_eq!(*sink.counts.lock().unwrap(), (1, 0));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut bad = config(SpeedLevel::X1);
        bad.read_period_hours = 0;
        assert!(matches!(SimulationContext::new(&bad), Err(ConfigError::ZeroReadPeriod)));
    }

    #[test]
    fn test_inputs_apply_on_next_tick() {
        let mut sim = SimulationContext::new(&config(SpeedLevel::X1H)).unwrap();

        sim.submit(SimulationInput::Meter(MeterInput::Flow(3600.0))).unwrap();
        sim.submit(SimulationInput::Modem(ModemInput::Rsrp(-105))).unwrap();
        assert_eq!(sim.pending_inputs(), 2);
        assert_eq!(sim.meter().state().flow_lph, 0.0);
        assert_eq!(sim.modem().rsrp_dbm(), -90);

        let report = sim.tick_with(Duration::ZERO);
        assert_eq!(report.dt_ms, 0);
        assert_eq!(sim.pending_inputs(), 0);
        assert_eq!(sim.meter().state().flow_lph, 3600.0);
        assert_eq!(sim.modem().rsrp_dbm(), -105);
        assert_eq!(sim.meter().state().usage_m3, DEFAULT_USAGE_M3);

        sim.tick_with(FRAME);
        assert!((sim.meter().state().usage_m3 - (DEFAULT_USAGE_M3 + 0.36)).abs() < 1e-9);
    }

    #[test]
    fn test_bad_periods_rejected_synchronously() {
        let mut sim = SimulationContext::new(&config(SpeedLevel::X1)).unwrap();

        let result = sim.submit(SimulationInput::SetPeriods {
            read_hours: 2,
            report_hours: 1,
        });
        assert!(matches!(
            result,
            Err(SimulationError::Config(ConfigError::ReportShorterThanRead { .. }))
        ));
        assert_eq!(sim.pending_inputs(), 0);
        assert_eq!(sim.modem().schedule().read_period_hours(), 1);
    }

    #[test]
    fn test_period_change_emits_config_event() {
        let mut sim = started(SpeedLevel::X1);

        sim.submit(SimulationInput::SetPeriods {
            read_hours: 2,
            report_hours: 12,
        })
        .unwrap();
        let report = sim.tick_with(Duration::ZERO);

        assert_eq!(report.logs.len(), 1);
        assert_eq!(report.logs[0].category, EventCategory::Info);
        assert_eq!(report.logs[0].message, "[CONFIG] Read 2h / report 12h");
        assert_eq!(sim.modem().schedule().report_period_hours(), 12);
    }

    #[test]
    fn test_forced_report_event_in_tick_report() {
        let mut sim = started(SpeedLevel::X1);
        assert_eq!(sim.modem().mode(), ModemMode::Sleep);

        sim.submit(SimulationInput::ForceReport).unwrap();
        let report = sim.tick_with(FRAME);

        assert_eq!(report.logs[0].category, EventCategory::Info);
        assert_eq!(report.logs[0].message, "[USER] Forced report requested");
        assert_eq!(report.logs[0].timestamp_ms, T0);
        assert!(sim.modem().is_report_forced());
    }

    #[test]
    fn test_input_events_come_before_tick_events() {
        let mut sim = started(SpeedLevel::X1H);

        sim.submit(SimulationInput::SetPeriods {
            read_hours: 1,
            report_hours: 1,
        })
        .unwrap();
        let report = sim.tick_with(FRAME);

        assert_eq!(report.dt_ms, 360_000);
        assert_eq!(report.virtual_time_ms, T0 + 360_000);
        assert_eq!(report.logs[0].message, "[CONFIG] Read 1h / report 1h");
    }

    #[test]
    fn test_commands_map_to_inputs() {
        let mut sim = SimulationContext::new(&config(SpeedLevel::X1)).unwrap();

        sim.submit_command(&CommandType::SetLeak { detected: true }).unwrap();
        assert!(matches!(
            sim.submit_command(&CommandType::Ping),
            Err(SimulationError::NotAnInput(_))
        ));

        sim.tick_with(Duration::ZERO);
        assert!(sim.meter().state().leak_detected);
    }

    #[test]
    fn test_input_queue_is_bounded() {
        let mut sim = SimulationContext::new(&config(SpeedLevel::X1)).unwrap();

        let mut accepted = 0;
        let mut full = false;
        for _ in 0..100 {
            match sim.submit(SimulationInput::ForceReport) {
                Ok(()) => accepted += 1,
                Err(SimulationError::InputQueueFull) => {
                    full = true;
                    break;
                }
                Err(e) => panic!("Unexpected error {:?}", e),
            }
        }
        assert!(full);
        assert_eq!(sim.pending_inputs(), accepted);
    }
}

#[cfg(test)]
mod timing_tests {
    use super::*;

    #[test]
    fn test_pause_freezes_everything() {
        let mut sim = started(SpeedLevel::Pause);
        sim.submit(SimulationInput::Meter(MeterInput::Temperature(-10.0))).unwrap();

        for report in run(&mut sim, 50) {
            assert_eq!(report.dt_ms, 0);
            assert!(report.logs.is_empty());
        }
        assert_eq!(sim.now_ms(), T0);
        assert_eq!(sim.meter().state().alarms.freeze.elapsed_ms(), 0);
        assert_eq!(sim.stats().ticks, 0);
    }

    #[test]
    fn test_speed_change_applies_next_tick() {
        let mut sim = SimulationContext::new(&config(SpeedLevel::X1)).unwrap();
        sim.submit(SimulationInput::SetSpeed(SpeedLevel::Max)).unwrap();

        let report = sim.tick_with(Duration::from_secs(1));
        assert_eq!(report.dt_ms, 86_400_000);
        assert_eq!(sim.clock().speed(), SpeedLevel::Max);
    }
}

#[cfg(test)]
mod cycle_tests {
    use super::*;

    #[test]
    fn test_regular_report_cycle() {
        let mut sim = SimulationContext::new(&config(SpeedLevel::X1H)).unwrap();

        let reports = run(&mut sim, 80);
        let packets: Vec<_> = reports.iter().flat_map(|r| r.packets.iter()).collect();

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].readings, 7);
        let decoded = packets[0].packet.decode().unwrap();
        assert_eq!(decoded.reading_count, 7);
        assert!(decoded.readings_raw.iter().all(|&raw| raw == 123_456));
        assert_eq!(packets[0].hex, packets[0].packet.to_hex());

        let stats = sim.stats();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.acks_received, 1);
        assert_eq!(stats.readings_taken, 8);
        assert_eq!(sim.modem().buffered_readings(), 1);

        let messages: Vec<String> = sim.history().recent_logs().into_iter().map(|e| e.message).collect();
        assert!(messages.contains(&"[TX] 1 packet sent (7 readings)".to_string()));
        assert!(messages.contains(&"[RX] ACK received (RSRP -90dBm)".to_string()));
        assert_eq!(sim.history().packet_count(), 1);
    }

    #[test]
    fn test_failed_acks_keep_readings() {
        let mut sim = SimulationContext::new(&config(SpeedLevel::X1H)).unwrap();
        sim.submit(SimulationInput::Modem(ModemInput::AckFail(true))).unwrap();

        // Seventh reading at tick 62, third failure at tick 71.
        run(&mut sim, 71);

        let stats = sim.stats();
        assert_eq!(stats.packets_sent, 3);
        assert_eq!(stats.ack_failures, 3);
        assert_eq!(stats.reports_abandoned, 1);
        assert_eq!(sim.modem().retry_count(), 0);
        assert_eq!(sim.modem().buffered_readings(), 7);
    }

    #[test]
    fn test_freeze_triggers_emergency_report() {
        let mut sim = SimulationContext::new(&config(SpeedLevel::X1H)).unwrap();
        sim.submit(SimulationInput::Meter(MeterInput::Temperature(-1.0))).unwrap();

        let reports = run(&mut sim, 10);
        let messages: Vec<&str> = reports
            .iter()
            .flat_map(|r| r.logs.iter())
            .map(|e| e.message.as_str())
            .collect();

        assert!(messages.contains(&"[METER] freeze alarm raised"));
        assert!(messages.contains(&"[MODEM] Emergency event -> immediate report"));
        assert_eq!(sim.stats().emergency_reports, 1);
        assert_eq!(sim.stats().packets_sent, 1);
    }

    #[test]
    fn test_sinks_observe_events() {
        let mut sim = SimulationContext::new(&config(SpeedLevel::X1H)).unwrap();
        let sink = CountingSink::default();
        sim.add_sink(Box::new(sink.clone()));

        let reports = run(&mut sim, 80);
        let logs: usize = reports.iter().map(|r| r.logs.len()).sum();
        let packets: usize = reports.iter().map(|r| r.packets.len()).sum();

        let counts = *sink.counts.lock().unwrap();
        assert_eq!(counts, (logs, packets));
        assert_eq!(packets, 1);
    }
}

#[cfg(test)]
mod buffer_tests {
    use super::*;
    use nbmeter::device::modem::MAX_BUFFERED_READINGS;

    #[test]
    fn test_full_buffer_reports_lost_reading() {
        // Hourly ticks, a long report period and failing acks keep every reading buffered.
        let mut sim = SimulationContext::new(&SimulationConfig {
            start_time_ms: Some(T0),
            speed: SpeedLevel::X1H,
            read_period_hours: 1,
            report_period_hours: 255,
            ..SimulationConfig::default()
        })
        .unwrap();
        sim.submit(SimulationInput::Modem(ModemInput::AckFail(true))).unwrap();

        let mut lost = Vec::new();
        for _ in 0..2000 {
            let report = sim.tick_with(Duration::from_secs(1));
            lost.extend(
                report
                    .logs
                    .into_iter()
                    .filter(|e| e.message.contains("oldest reading lost")),
            );
        }

        assert!(!lost.is_empty());
        assert_eq!(lost[0].category, EventCategory::MeterRead);
        assert_eq!(
            lost[0].message,
            format!("[METER] Reading stored (buffer: {}, oldest reading lost)", MAX_BUFFERED_READINGS)
        );
        assert_eq!(sim.modem().buffered_readings(), MAX_BUFFERED_READINGS);
    }
}

#[cfg(test)]
mod history_tests {
    use super::*;

    #[test]
    fn test_log_history_is_bounded() {
        let mut sim = SimulationContext::new(&config(SpeedLevel::X1)).unwrap();

        for i in 0..120u8 {
            let report_hours = 1 + i % 24;
            sim.submit(SimulationInput::SetPeriods {
                read_hours: 1,
                report_hours,
            })
            .unwrap();
            sim.tick_with(Duration::ZERO);
        }

        assert_eq!(sim.history().log_count(), LOG_HISTORY_SIZE);
        let newest = &sim.history().recent_logs()[0];
        assert_eq!(newest.message, "[CONFIG] Read 1h / report 24h");
    }

    #[test]
    fn test_clear_history() {
        let mut sim = SimulationContext::new(&config(SpeedLevel::X1H)).unwrap();
        run(&mut sim, 80);
        assert!(sim.history().log_count() > 0);

        sim.clear_history();
        assert_eq!(sim.history().log_count(), 0);
        assert_eq!(sim.history().packet_count(), 0);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut sim = SimulationContext::new(&config(SpeedLevel::X60)).unwrap();
        sim.submit(SimulationInput::Meter(MeterInput::Magnet(true))).unwrap();
        sim.tick_with(Duration::ZERO);

        let snapshot = sim.snapshot();
        assert_eq!(snapshot.virtual_time, "2026-01-01 00:00:00");
        assert_eq!(snapshot.speed, SpeedLevel::X60);
        assert!(snapshot.meter.magnet_detected);

        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: SimulationSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.virtual_time_ms, T0);
        assert_eq!(parsed.modem.mode, snapshot.modem.mode);
        assert_eq!(parsed.modem.buffer_size, 0);
    }
}
