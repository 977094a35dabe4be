//! Intake progress — which of the tracked dialogue steps a session is on.
//!
//! The service walks a longer flow (vehicle detail branches, "add another
//! vehicle", ...). Only the eight steps below count toward progress; any
//! other token reports 0%.

use serde::{Deserialize, Serialize};

/// The tracked intake steps, in dialogue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeStep {
    ZipCode,
    FullName,
    Email,
    VehicleInfo,
    VehicleUse,
    BlindSpot,
    LicenseType,
    LicenseStatus,
}

impl IntakeStep {
    pub const ALL: [IntakeStep; 8] = [
        Self::ZipCode,
        Self::FullName,
        Self::Email,
        Self::VehicleInfo,
        Self::VehicleUse,
        Self::BlindSpot,
        Self::LicenseType,
        Self::LicenseStatus,
    ];

    /// Look up a step by the token the service uses.
    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|step| step.as_str() == token)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ZipCode => "zip_code",
            Self::FullName => "full_name",
            Self::Email => "email",
            Self::VehicleInfo => "vehicle_info",
            Self::VehicleUse => "vehicle_use",
            Self::BlindSpot => "blind_spot",
            Self::LicenseType => "license_type",
            Self::LicenseStatus => "license_status",
        }
    }

    /// Zero-based position in [`IntakeStep::ALL`].
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// `round(100 * (index + 1) / 8)`.
    pub fn percent(&self) -> u8 {
        let total = Self::ALL.len() as f64;
        ((self.index() as f64 + 1.0) / total * 100.0).round() as u8
    }
}

impl std::fmt::Display for IntakeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress for a raw step token; unrecognized tokens yield 0.
pub fn progress_percent(token: &str) -> u8 {
    IntakeStep::from_token(token).map_or(0, |step| step.percent())
}
