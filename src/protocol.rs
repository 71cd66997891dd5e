use crate::clock::SpeedLevel;
use crate::config::ConfigError;
use crate::device::meter::MAX_VOLTAGE_V;
use crate::device::modem;
use crate::events::{LogEvent, PacketRecord};
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_COMMAND_SIZE: usize = 512;
pub const MAX_RESPONSE_SIZE: usize = 4096;

pub type CommandBuffer = ArrayString<MAX_COMMAND_SIZE>;
pub type ResponseBuffer = ArrayString<MAX_RESPONSE_SIZE>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: u32,
    pub timestamp: u64,
    pub command_type: CommandType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandType {
    Ping,
    Status,
    SetFlow { lph: f64 },
    SetTemperature { celsius: f64 },
    SetVoltage { volts: f64 },
    SetMagnet { detected: bool },
    SetLeak { detected: bool },
    SetRsrp { dbm: i32 },
    SetAckFail { fail: bool },
    SetPeriods { read_hours: u8, report_hours: u8 },
    ForceReport,
    SetSpeed { level: SpeedLevel },
    ClearLogs,
}

impl CommandType {
    /// Commands that change simulation state and are therefore deferred to
    /// the start of the next tick.
    pub fn is_deferred(&self) -> bool {
        !matches!(self, CommandType::Ping | CommandType::Status | CommandType::ClearLogs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: u32,
    pub timestamp: u64,
    pub status: ResponseStatus,
    pub message: Option<alloc::string::String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    /// Validated and queued; applied on the next tick.
    Accepted,
    Rejected,
    Error,
}

/// Unsolicited line pushed to every connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Log(LogEvent),
    Packet(PacketRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON format")]
    InvalidJson,
    #[error("message exceeds buffer size")]
    MessageTooLarge,
    #[error("serialization failed")]
    SerializationError,
    #[error("invalid command")]
    InvalidCommand,
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug)]
pub struct ProtocolHandler {
    command_counter: u32,
    command_buffer: CommandBuffer,
    response_buffer: ResponseBuffer,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self {
            command_counter: 0,
            command_buffer: ArrayString::new(),
            response_buffer: ArrayString::new(),
        }
    }

    pub fn parse_command(&mut self, json_str: &str) -> Result<Command, ProtocolError> {
        self.command_buffer.clear();
        self.command_buffer
            .try_push_str(json_str)
            .map_err(|_| ProtocolError::MessageTooLarge)?;

        serde_json::from_str::<Command>(&self.command_buffer).map_err(|_| ProtocolError::InvalidJson)
    }

    pub fn serialize_response(&mut self, response: &CommandResponse) -> Result<&str, ProtocolError> {
        self.response_buffer.clear();

        let json_str = serde_json::to_string(response).map_err(|_| ProtocolError::SerializationError)?;
        self.response_buffer
            .try_push_str(&json_str)
            .map_err(|_| ProtocolError::MessageTooLarge)?;

        Ok(&self.response_buffer)
    }

    pub fn validate_command(&self, command: &Command) -> Result<(), ProtocolError> {
        if command.id == 0 {
            return Err(ProtocolError::InvalidCommand);
        }

        match &command.command_type {
            CommandType::SetFlow { lph } => {
                if !lph.is_finite() {
                    return Err(ProtocolError::InvalidParameter("flow must be finite"));
                }
            }
            CommandType::SetTemperature { celsius } => {
                if !celsius.is_finite() {
                    return Err(ProtocolError::InvalidParameter("temperature must be finite"));
                }
            }
            CommandType::SetVoltage { volts } => {
                if !(0.0..=MAX_VOLTAGE_V).contains(volts) {
                    return Err(ProtocolError::InvalidParameter("voltage must be within 0.0..=3.7 V"));
                }
            }
            CommandType::SetRsrp { dbm } => {
                if *dbm > 0 {
                    return Err(ProtocolError::InvalidParameter("RSRP must not be positive"));
                }
            }
            CommandType::SetPeriods { read_hours, report_hours } => {
                modem::validate_periods(*read_hours, *report_hours)?;
            }
            _ => {}
        }

        Ok(())
    }

    pub fn create_response(
        &mut self,
        command_id: u32,
        timestamp: u64,
        status: ResponseStatus,
        message: Option<&str>,
    ) -> CommandResponse {
        CommandResponse {
            id: command_id,
            timestamp,
            status,
            message: message.map(alloc::string::ToString::to_string),
        }
    }

    pub fn next_command_id(&mut self) -> u32 {
        self.command_counter = self.command_counter.wrapping_add(1);
        if self.command_counter == 0 {
            self.command_counter = 1;
        }
        self.command_counter
    }
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}
