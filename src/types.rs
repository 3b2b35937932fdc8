//! Printer domain types carried in handshake replies and state
//! notifications.
//!
//! The printer is loose about which fields it includes in any given
//! notification, so everything defaults: a metadata payload carrying only
//! `machine_name` and `bot_type` still decodes.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Firmware version quad reported by the printer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareVersion {
    pub major: i64,
    pub minor: i64,
    pub bugfix: i64,
    pub build: i64,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.bugfix, self.build
        )
    }
}

/// Printer descriptor returned by the `handshake` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Printer {
    /// Codename for this machine type.
    pub machine_type: String,
    /// Vendor ID.
    pub vid: i64,
    /// Local IP of the printer.
    pub ip: String,
    /// Product ID.
    pub pid: i64,
    pub api_version: String,
    /// Serial number.
    #[serde(rename = "iserial")]
    pub serial: String,
    /// Port of the printer's HTTPS server.
    pub ssl_port: String,
    /// User-defined printer name.
    pub machine_name: String,
    pub motor_driver_version: String,
    /// Codename for the bot type, e.g. `mk13`.
    pub bot_type: String,
    /// JSON-RPC port (usually 9999).
    pub port: String,
    pub firmware_version: FirmwareVersion,
}

/// Periodic state payload sent in `system_notification` and
/// `state_notification` messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterMetadata {
    pub auto_unload: String,
    pub disabled_errors: Vec<Value>,
    pub bot_type: String,
    pub sound: bool,
    pub machine_name: String,
    pub current_process: Option<PrinterProcess>,
    pub api_version: String,
    pub has_been_connected_to: bool,
    pub ip: String,
    /// Toolheads keyed by kind (e.g. `"extruder"`).
    pub toolheads: HashMap<String, Vec<Toolhead>>,
    pub machine_type: String,
    pub firmware_version: FirmwareVersion,
}

/// The printer's current task, if any.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterProcess {
    pub id: i64,
    pub filename: Option<String>,
    pub complete: bool,
    pub filament_extruded: f32,
    pub print_temperatures: HashMap<String, f32>,
    pub name: String,
    pub filepath: Option<String>,
    pub methods: Vec<String>,
    pub username: Option<String>,
    pub can_print_again: Option<bool>,
    /// Percentage complete, when the step reports one.
    pub progress: Option<i64>,
    pub cancellable: bool,
    pub step: PrintProcessStep,
    pub start_time: Option<EpochTime>,
    pub elapsed_time: Option<EpochTime>,
    pub cancelled: bool,
    pub thing_id: Option<i64>,
    pub reason: Option<String>,
    pub tool_index: Option<i64>,
    pub temperature_settings: Option<Vec<i64>>,
}

/// A toolhead connected to the printer (e.g. a Smart Extruder+).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toolhead {
    pub preheating: bool,
    pub filament_presence: bool,
    pub target_temperature: f32,
    pub error: i64,
    pub index: i64,
    pub tool_present: bool,
    pub tool_id: i64,
    pub current_temperature: f32,
}

/// A step a [`PrinterProcess`] can be in, as named on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrintProcessStep {
    Initializing,
    InitialHeating,
    FinalHeating,
    Cooling,
    Homing,
    PositionFound,
    PreheatingResuming,
    Calibrating,
    Printing,
    EndSequence,
    Cancelling,
    Suspending,
    Suspended,
    Unsuspending,
    PreheatingLoading,
    PreheatingUnloading,
    LoadingFilament,
    UnloadingFilament,
    StoppingFilament,
    CleaningUp,
    ClearBuildPlate,
    Error,
    LoadingPrintTool,
    WaitingForFile,
    Transfer,
    Failed,
    Completed,
    HandlingRecoverableFilamentJam,
    Running,
    /// A step this crate does not know about.
    #[default]
    Unknown,
}

impl PrintProcessStep {
    /// The step's name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::InitialHeating => "initial_heating",
            Self::FinalHeating => "final_heating",
            Self::Cooling => "cooling",
            Self::Homing => "homing",
            Self::PositionFound => "position_found",
            Self::PreheatingResuming => "preheating_resuming",
            Self::Calibrating => "calibrating",
            Self::Printing => "printing",
            Self::EndSequence => "end_sequence",
            Self::Cancelling => "cancelling",
            Self::Suspending => "suspending",
            Self::Suspended => "suspended",
            Self::Unsuspending => "unsuspending",
            Self::PreheatingLoading => "preheating_loading",
            Self::PreheatingUnloading => "preheating_unloading",
            Self::LoadingFilament => "loading_filament",
            Self::UnloadingFilament => "unloading_filament",
            Self::StoppingFilament => "stopping_filament",
            Self::CleaningUp => "cleaning_up",
            Self::ClearBuildPlate => "clear_build_plate",
            Self::Error => "error_step",
            Self::LoadingPrintTool => "loading_print_tool",
            Self::WaitingForFile => "waiting_for_file",
            Self::Transfer => "transfer",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::HandlingRecoverableFilamentJam => "handling_recoverable_filament_jam",
            Self::Running => "running",
            Self::Unknown => "unknown",
        }
    }

    fn from_wire(name: &str) -> Self {
        match name {
            "initializing" => Self::Initializing,
            "initial_heating" => Self::InitialHeating,
            "final_heating" => Self::FinalHeating,
            "cooling" => Self::Cooling,
            "homing" => Self::Homing,
            "position_found" => Self::PositionFound,
            "preheating_resuming" => Self::PreheatingResuming,
            "calibrating" => Self::Calibrating,
            "printing" => Self::Printing,
            "end_sequence" => Self::EndSequence,
            "cancelling" => Self::Cancelling,
            "suspending" => Self::Suspending,
            "suspended" => Self::Suspended,
            "unsuspending" => Self::Unsuspending,
            "preheating_loading" => Self::PreheatingLoading,
            "preheating_unloading" => Self::PreheatingUnloading,
            "loading_filament" => Self::LoadingFilament,
            "unloading_filament" => Self::UnloadingFilament,
            "stopping_filament" => Self::StoppingFilament,
            "cleaning_up" => Self::CleaningUp,
            "clear_build_plate" => Self::ClearBuildPlate,
            "error_step" => Self::Error,
            "loading_print_tool" => Self::LoadingPrintTool,
            "waiting_for_file" => Self::WaitingForFile,
            "transfer" => Self::Transfer,
            "failed" => Self::Failed,
            "completed" => Self::Completed,
            "handling_recoverable_filament_jam" => Self::HandlingRecoverableFilamentJam,
            "running" => Self::Running,
            _ => Self::Unknown,
        }
    }

    /// Human-readable label for the step.
    pub fn humanize(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::InitialHeating => "Initial Heating",
            Self::FinalHeating => "Final Heating",
            Self::Cooling => "Cooling",
            Self::Homing => "Finding Position",
            Self::PositionFound => "Position Found",
            Self::PreheatingResuming => "Resuming Pre-Heating",
            Self::Calibrating => "Calibrating",
            Self::Printing => "Printing",
            Self::EndSequence => "Cleaning Up",
            Self::Cancelling => "Cancelling",
            Self::Suspending => "Suspending",
            Self::Suspended => "Suspended",
            Self::Unsuspending => "Unsuspending",
            Self::PreheatingLoading => "Preparing For Filament Loading",
            Self::PreheatingUnloading => "Preparing For Filament Unloading",
            Self::LoadingFilament => "Loading Filament",
            Self::UnloadingFilament => "Unloading Filament",
            Self::StoppingFilament => "Stopping Filament Loading/Unloading",
            Self::CleaningUp => "Cleaning up",
            Self::ClearBuildPlate => "Waiting For Clear Build Plate",
            Self::Error => "Error",
            Self::LoadingPrintTool => "Loading Print Tool",
            Self::WaitingForFile => "Waiting For File",
            Self::Transfer => "Transferring File",
            Self::Failed => "Failed",
            Self::Completed => "Completed",
            Self::HandlingRecoverableFilamentJam => "Attempting Filament Jam Recovery",
            Self::Running => "Running",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for PrintProcessStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PrintProcessStep {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PrintProcessStep {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&name))
    }
}

/// Seconds since the Unix epoch.
///
/// The printer writes these as epoch milliseconds, sometimes quoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EpochTime(pub i64);

impl Serialize for EpochTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for EpochTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Text(String),
        }

        let millis = match Raw::deserialize(deserializer)? {
            Raw::Number(n) => n,
            Raw::Text(s) => s.parse::<i64>().map_err(serde::de::Error::custom)?,
        };
        Ok(Self(millis / 1000))
    }
}
