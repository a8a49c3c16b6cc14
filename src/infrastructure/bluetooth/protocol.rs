//! Peripheral Protocol
//!
//! GATT identifiers for the supported device families, plus UUID
//! normalization for comparing what the transport reports against them.

use crate::domain::models::TargetConfig;

/// Suffix of the Bluetooth base UUID that 16-bit short ids expand into
pub const BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

/// MTU requested once the notify characteristic is found
pub const DEFAULT_MTU: u16 = 23;

/// Ball camera
pub mod ball_camera {
    pub const NAME: &str = "TTHost2";
    pub const SERVICE_NOTIFY: &str = "fff0";
    pub const SERVICE_WRITE: &str = "fff0";
    pub const CHAR_NOTIFY: &str = "fff1";
    pub const CHAR_WRITE: &str = "fff2";
}

/// Ball machine (advertises as "Robot<suffix>")
pub mod ball_machine {
    pub const NAME: &str = "Robot";
    pub const SERVICE_NOTIFY: &str = "fff0";
    pub const SERVICE_WRITE: &str = "fff0";
    pub const CHAR_NOTIFY: &str = "fff1";
    pub const CHAR_WRITE: &str = "fff2";
}

/// Target camera
pub mod target_camera {
    pub const NAME: &str = "Tennis_2";
    pub const SERVICE_NOTIFY: &str = "ffe0";
    pub const SERVICE_WRITE: &str = "ffe5";
    pub const CHAR_NOTIFY: &str = "ffe4";
    pub const CHAR_WRITE: &str = "ffe9";
}

/// Speed sensor, notify only
pub mod speed_sensor {
    pub const NAME: &str = "Myspeedz";
    pub const SECONDARY_NAME: &str = "Myspeedz_2";
    pub const SERVICE_NOTIFY: &str = "ffe0";
    pub const CHAR_NOTIFY: &str = "ffe4";
}

/// Known peripheral families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    BallCamera,
    BallMachine,
    TargetCamera,
    SpeedSensor,
}

impl DeviceFamily {
    /// Default advertised-name pattern for this family
    pub fn name_pattern(&self) -> &'static str {
        match self {
            Self::BallCamera => ball_camera::NAME,
            Self::BallMachine => ball_machine::NAME,
            Self::TargetCamera => target_camera::NAME,
            Self::SpeedSensor => speed_sensor::NAME,
        }
    }

    /// Registration record using the family's default name
    pub fn target_config(&self) -> TargetConfig {
        self.named(self.name_pattern())
    }

    /// Registration record for a specific unit of this family
    pub fn named(&self, name: &str) -> TargetConfig {
        match self {
            Self::BallCamera => TargetConfig::new(
                name,
                ball_camera::SERVICE_NOTIFY,
                ball_camera::SERVICE_WRITE,
                ball_camera::CHAR_NOTIFY,
                ball_camera::CHAR_WRITE,
            ),
            Self::BallMachine => TargetConfig::new(
                name,
                ball_machine::SERVICE_NOTIFY,
                ball_machine::SERVICE_WRITE,
                ball_machine::CHAR_NOTIFY,
                ball_machine::CHAR_WRITE,
            ),
            Self::TargetCamera => TargetConfig::new(
                name,
                target_camera::SERVICE_NOTIFY,
                target_camera::SERVICE_WRITE,
                target_camera::CHAR_NOTIFY,
                target_camera::CHAR_WRITE,
            ),
            Self::SpeedSensor => TargetConfig::notify_only(
                name,
                speed_sensor::SERVICE_NOTIFY,
                speed_sensor::CHAR_NOTIFY,
            ),
        }
    }
}

/// Expand a 16-bit short id ("fff1") to its full 128-bit form.
/// Anything else is returned trimmed and unchanged.
pub fn full_uuid(uuid: &str) -> String {
    let uuid = uuid.trim();
    if uuid.len() == 4 {
        format!("0000{}{}", uuid, BASE_UUID_SUFFIX)
    } else {
        uuid.to_string()
    }
}

/// Case-insensitive UUID comparison after short-id expansion
pub fn uuid_eq(a: &str, b: &str) -> bool {
    full_uuid(a).eq_ignore_ascii_case(&full_uuid(b))
}
