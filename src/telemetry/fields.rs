//! Telemetry field registry and preset configurations.
//!
//! Field ids and names mirror the provider's `vehicle_data.proto` Field
//! enum. Presets group commonly-used fields with polling intervals suited
//! to a use case. Excluded from the registry: the Unknown (0) and
//! deprecated/experimental ids.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Field id → canonical name, straight from the proto enum.
#[rustfmt::skip]
static FIELD_TABLE: &[(u32, &str)] = &[
    // Drive / Motion
    (1, "DriveRail"), (4, "VehicleSpeed"), (5, "Odometer"), (10, "Gear"),
    (12, "PedalPosition"), (13, "BrakePedal"), (21, "Location"), (22, "GpsState"),
    (23, "GpsHeading"), (98, "LateralAcceleration"), (99, "LongitudinalAcceleration"),
    (101, "CruiseSetSpeed"), (106, "BrakePedalPos"), (126, "CruiseFollowDistance"),
    (129, "SpeedLimitWarning"),
    // Battery / Energy
    (6, "PackVoltage"), (7, "PackCurrent"), (8, "Soc"), (9, "DCDCEnable"),
    (11, "IsolationResistance"), (24, "NumBrickVoltageMax"), (25, "BrickVoltageMax"),
    (26, "NumBrickVoltageMin"), (27, "BrickVoltageMin"), (28, "NumModuleTempMax"),
    (29, "ModuleTempMax"), (30, "NumModuleTempMin"), (31, "ModuleTempMin"),
    (32, "RatedRange"), (33, "Hvil"), (40, "EstBatteryRange"), (41, "IdealBatteryRange"),
    (42, "BatteryLevel"), (55, "BatteryHeaterOn"), (56, "NotEnoughPowerToHeat"),
    (102, "LifetimeEnergyUsed"), (103, "LifetimeEnergyUsedDrive"),
    (134, "LifetimeEnergyGainedRegen"), (158, "EnergyRemaining"), (160, "BMSState"),
    // Charging
    (2, "ChargeState"), (3, "BmsFullchargecomplete"), (34, "DCChargingEnergyIn"),
    (35, "DCChargingPower"), (36, "ACChargingEnergyIn"), (37, "ACChargingPower"),
    (38, "ChargeLimitSoc"), (39, "FastChargerPresent"), (43, "TimeToFullCharge"),
    (44, "ScheduledChargingStartTime"), (45, "ScheduledChargingPending"),
    (46, "ScheduledDepartureTime"), (47, "PreconditioningEnabled"),
    (48, "ScheduledChargingMode"), (49, "ChargeAmps"), (50, "ChargeEnableRequest"),
    (51, "ChargerPhases"), (52, "ChargePortColdWeatherMode"), (53, "ChargeCurrentRequest"),
    (54, "ChargeCurrentRequestMax"), (57, "SuperchargerSessionTripPlanner"),
    (117, "ChargePort"), (118, "ChargePortLatch"), (179, "DetailedChargeState"),
    (183, "ChargePortDoorOpen"), (184, "ChargerVoltage"), (185, "ChargingCableType"),
    (190, "EstimatedHoursToChargeTermination"), (193, "FastChargerType"),
    (256, "ChargeRateMilePerHour"),
    // Climate / HVAC
    (85, "InsideTemp"), (86, "OutsideTemp"), (87, "SeatHeaterLeft"), (88, "SeatHeaterRight"),
    (89, "SeatHeaterRearLeft"), (90, "SeatHeaterRearRight"), (91, "SeatHeaterRearCenter"),
    (92, "AutoSeatClimateLeft"), (93, "AutoSeatClimateRight"), (186, "ClimateKeeperMode"),
    (187, "DefrostForPreconditioning"), (188, "DefrostMode"), (196, "HvacACEnabled"),
    (197, "HvacAutoMode"), (198, "HvacFanSpeed"), (199, "HvacFanStatus"),
    (200, "HvacLeftTemperatureRequest"), (201, "HvacPower"),
    (202, "HvacRightTemperatureRequest"), (203, "HvacSteeringWheelHeatAuto"),
    (204, "HvacSteeringWheelHeatLevel"), (211, "RearDisplayHvacEnabled"),
    (237, "ClimateSeatCoolingFrontLeft"), (238, "ClimateSeatCoolingFrontRight"),
    (254, "SeatVentEnabled"), (255, "RearDefrostEnabled"),
    (180, "CabinOverheatProtectionMode"), (181, "CabinOverheatProtectionTemperatureLimit"),
    // Security / Doors / Windows
    (58, "DoorState"), (59, "Locked"), (60, "FdWindow"), (61, "FpWindow"),
    (62, "RdWindow"), (63, "RpWindow"), (64, "VehicleName"), (65, "SentryMode"),
    (66, "SpeedLimitMode"), (67, "CurrentLimitMph"), (68, "Version"),
    (94, "DriverSeatBelt"), (95, "PassengerSeatBelt"), (96, "DriverSeatOccupied"),
    (123, "GuestModeEnabled"), (124, "PinToDriveEnabled"),
    (125, "PairedPhoneKeyAndKeyFobQty"), (159, "ServiceMode"),
    (161, "GuestModeMobileAccessState"), (182, "CenterDisplay"),
    (213, "RemoteStartEnabled"), (226, "ValetModeEnabled"),
    // Tires
    (69, "TpmsPressureFl"), (70, "TpmsPressureFr"), (71, "TpmsPressureRl"),
    (72, "TpmsPressureRr"), (81, "TpmsLastSeenPressureTimeFl"),
    (82, "TpmsLastSeenPressureTimeFr"), (83, "TpmsLastSeenPressureTimeRl"),
    (84, "TpmsLastSeenPressureTimeRr"), (224, "TpmsHardWarnings"), (225, "TpmsSoftWarnings"),
    // Drive inverter diagnostics
    (14, "DiStateR"), (15, "DiHeatsinkTR"), (16, "DiAxleSpeedR"), (17, "DiTorquemotor"),
    (18, "DiStatorTempR"), (19, "DiVBatR"), (20, "DiMotorCurrentR"), (135, "DiStateF"),
    (136, "DiStateREL"), (137, "DiStateRER"), (138, "DiHeatsinkTF"), (139, "DiHeatsinkTREL"),
    (140, "DiHeatsinkTRER"), (141, "DiAxleSpeedF"), (142, "DiAxleSpeedREL"),
    (143, "DiAxleSpeedRER"), (144, "DiSlaveTorqueCmd"), (145, "DiTorqueActualR"),
    (146, "DiTorqueActualF"), (147, "DiTorqueActualREL"), (148, "DiTorqueActualRER"),
    (149, "DiStatorTempF"), (150, "DiStatorTempREL"), (151, "DiStatorTempRER"),
    (152, "DiVBatF"), (153, "DiVBatREL"), (154, "DiVBatRER"), (155, "DiMotorCurrentF"),
    (156, "DiMotorCurrentREL"), (157, "DiMotorCurrentRER"), (164, "DiInverterTR"),
    (165, "DiInverterTF"), (166, "DiInverterTREL"), (167, "DiInverterTRER"),
    // Navigation / Route
    (107, "RouteLastUpdated"), (108, "RouteLine"), (109, "MilesToArrival"),
    (110, "MinutesToArrival"), (111, "OriginLocation"), (112, "DestinationLocation"),
    (163, "DestinationName"), (215, "RouteTrafficMinutesDelay"),
    (192, "ExpectedEnergyPercentAtTripArrival"),
    // Vehicle info / Config
    (113, "CarType"), (114, "Trim"), (115, "ExteriorColor"), (116, "RoofColor"),
    (189, "EfficiencyPackage"), (191, "EuropeVehicle"), (214, "RightHandDrive"),
    (227, "WheelType"), (228, "WiperHeatEnabled"),
    // Safety / ADAS
    (127, "AutomaticBlindSpotCamera"), (128, "BlindSpotCollisionWarningChime"),
    (130, "ForwardCollisionWarning"), (131, "LaneDepartureAvoidance"),
    (132, "EmergencyLaneDepartureAvoidance"), (133, "AutomaticEmergencyBrakingOff"),
    // Powershare
    (206, "PowershareHoursLeft"), (207, "PowershareInstantaneousPowerKW"),
    (208, "PowershareStatus"), (209, "PowershareStopReason"), (210, "PowershareType"),
    // Homelink
    (194, "HomelinkDeviceCount"), (195, "HomelinkNearby"),
    // Software updates
    (216, "SoftwareUpdateDownloadPercentComplete"),
    (217, "SoftwareUpdateExpectedDurationMinutes"),
    (218, "SoftwareUpdateInstallationPercentComplete"),
    (219, "SoftwareUpdateScheduledStartTime"), (220, "SoftwareUpdateVersion"),
    // Tonneau
    (221, "TonneauOpenPercent"), (222, "TonneauPosition"), (223, "TonneauTentMode"),
    // Location context
    (229, "LocatedAtHome"), (230, "LocatedAtWork"), (231, "LocatedAtFavorite"),
    // Settings
    (232, "SettingDistanceUnit"), (233, "SettingTemperatureUnit"),
    (234, "Setting24HourTime"), (235, "SettingTirePressureUnit"), (236, "SettingChargeUnit"),
    // Lights
    (239, "LightsHazardsActive"), (240, "LightsTurnSignal"), (241, "LightsHighBeams"),
    // Media
    (242, "MediaPlaybackStatus"), (243, "MediaPlaybackSource"), (244, "MediaAudioVolume"),
    (245, "MediaNowPlayingDuration"), (246, "MediaNowPlayingElapsed"),
    (247, "MediaNowPlayingArtist"), (248, "MediaNowPlayingTitle"),
    (249, "MediaNowPlayingAlbum"), (250, "MediaNowPlayingStation"),
    (251, "MediaAudioVolumeIncrement"), (252, "MediaAudioVolumeMax"),
    // Misc
    (205, "OffroadLightbarPresent"), (212, "RearSeatHeaters"), (253, "SunroofInstalled"),
    (258, "MilesSinceReset"), (259, "SelfDrivingMilesSinceReset"),
    // Semi-truck (excluded from presets — consumer vehicles reject them)
    (73, "SemitruckTpmsPressureRe1L0"), (74, "SemitruckTpmsPressureRe1L1"),
    (75, "SemitruckTpmsPressureRe1R0"), (76, "SemitruckTpmsPressureRe1R1"),
    (77, "SemitruckTpmsPressureRe2L0"), (78, "SemitruckTpmsPressureRe2L1"),
    (79, "SemitruckTpmsPressureRe2R0"), (80, "SemitruckTpmsPressureRe2R1"),
    (97, "SemitruckPassengerSeatFoldPosition"), (104, "SemitruckTractorParkBrakeStatus"),
    (105, "SemitruckTrailerParkBrakeStatus"),
];

fn id_to_name() -> &'static HashMap<u32, &'static str> {
    static MAP: OnceLock<HashMap<u32, &'static str>> = OnceLock::new();
    MAP.get_or_init(|| FIELD_TABLE.iter().copied().collect())
}

fn name_to_id() -> &'static HashMap<&'static str, u32> {
    static MAP: OnceLock<HashMap<&'static str, u32>> = OnceLock::new();
    MAP.get_or_init(|| FIELD_TABLE.iter().map(|(id, name)| (*name, *id)).collect())
}

/// Resolve a field id to its canonical name; unknown ids render as
/// `Unknown(<id>)`.
pub fn field_name(id: u32) -> String {
    id_to_name()
        .get(&id)
        .map(|name| (*name).to_string())
        .unwrap_or_else(|| format!("Unknown({id})"))
}

/// Whether `name` is a known field.
pub fn is_known_field(name: &str) -> bool {
    name_to_id().contains_key(name)
}

/// Streaming interval for one field in a fleet-telemetry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub interval_seconds: u32,
}

/// Resolved field configuration: field name → streaming interval.
pub type FieldConfig = BTreeMap<String, FieldSpec>;

/// Fields excluded from the `all` preset: semi-truck fields are rejected
/// by consumer vehicles, and a few need minimum-delta configs instead of
/// intervals.
fn non_streamable(name: &str) -> bool {
    name.starts_with("Semitruck")
        || matches!(
            name,
            "LifetimeEnergyGainedRegen" | "MilesSinceReset" | "SelfDrivingMilesSinceReset"
        )
}

#[rustfmt::skip]
static DEFAULT_PRESET: &[(&str, u32)] = &[
    ("Soc", 10), ("VehicleSpeed", 1), ("Location", 5), ("ChargeState", 10),
    ("InsideTemp", 30), ("OutsideTemp", 60), ("Odometer", 60), ("BatteryLevel", 10),
    ("Gear", 1), ("PackVoltage", 10), ("PackCurrent", 10),
];

#[rustfmt::skip]
static DRIVING_PRESET: &[(&str, u32)] = &[
    ("VehicleSpeed", 1), ("Location", 1), ("Gear", 1), ("GpsHeading", 1),
    ("Odometer", 10), ("BatteryLevel", 10), ("Soc", 10), ("PackCurrent", 5),
    ("PackVoltage", 5), ("CruiseSetSpeed", 5), ("LateralAcceleration", 5),
    ("LongitudinalAcceleration", 5), ("BrakePedalPos", 5), ("PedalPosition", 5),
];

#[rustfmt::skip]
static CHARGING_PRESET: &[(&str, u32)] = &[
    ("Soc", 5), ("BatteryLevel", 5), ("PackVoltage", 5), ("PackCurrent", 5),
    ("ChargeState", 5), ("ChargeAmps", 5), ("ChargerVoltage", 5), ("ChargerPhases", 30),
    ("ACChargingPower", 5), ("DCChargingPower", 5), ("TimeToFullCharge", 30),
    ("ChargeLimitSoc", 60), ("ChargePortDoorOpen", 60), ("BatteryHeaterOn", 30),
    ("InsideTemp", 60),
];

#[rustfmt::skip]
static CLIMATE_PRESET: &[(&str, u32)] = &[
    ("InsideTemp", 10), ("OutsideTemp", 30), ("HvacLeftTemperatureRequest", 30),
    ("HvacRightTemperatureRequest", 30), ("HvacPower", 10), ("HvacFanStatus", 10),
    ("SeatHeaterLeft", 30), ("SeatHeaterRight", 30), ("HvacSteeringWheelHeatLevel", 30),
    ("CabinOverheatProtectionMode", 60), ("DefrostMode", 30), ("PreconditioningEnabled", 30),
];

/// Preset names accepted by `--fields`.
pub const PRESET_NAMES: &[&str] = &["default", "driving", "charging", "climate", "all"];

/// Interval assigned to individually-named fields without an override.
const NAMED_FIELD_DEFAULT_INTERVAL: u32 = 10;

fn preset(name: &str) -> Option<FieldConfig> {
    let entries: &[(&str, u32)] = match name {
        "default" => DEFAULT_PRESET,
        "driving" => DRIVING_PRESET,
        "charging" => CHARGING_PRESET,
        "climate" => CLIMATE_PRESET,
        "all" => {
            return Some(
                FIELD_TABLE
                    .iter()
                    .filter(|(_, name)| !non_streamable(name))
                    .map(|(_, name)| ((*name).to_string(), FieldSpec { interval_seconds: 30 }))
                    .collect(),
            );
        }
        _ => return None,
    };
    Some(
        entries
            .iter()
            .map(|(name, interval)| {
                (
                    (*name).to_string(),
                    FieldSpec {
                        interval_seconds: *interval,
                    },
                )
            })
            .collect(),
    )
}

/// Resolve a `--fields` argument into a field configuration.
///
/// `spec` is either a preset name or a comma-separated list of field
/// names. `interval_override`, when set, replaces every interval.
pub fn resolve_fields(
    spec: &str,
    interval_override: Option<u32>,
) -> Result<FieldConfig, ConfigError> {
    let mut fields = match preset(spec) {
        Some(fields) => fields,
        None => {
            let mut fields = FieldConfig::new();
            for name in spec.split(',') {
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }
                if !is_known_field(name) {
                    return Err(ConfigError::new(format!(
                        "unknown telemetry field '{name}'; available presets: {}",
                        PRESET_NAMES.join(", ")
                    )));
                }
                fields.insert(
                    name.to_string(),
                    FieldSpec {
                        interval_seconds: NAMED_FIELD_DEFAULT_INTERVAL,
                    },
                );
            }
            fields
        }
    };

    if let Some(interval) = interval_override {
        for spec in fields.values_mut() {
            spec.interval_seconds = interval;
        }
    }

    Ok(fields)
}
