use serde::{Deserialize, Serialize};

/// Kind of device behind a connection
///
/// Elements check the kind before issuing commands: exposures only go to
/// cameras, integrations only to photometers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Camera,
    Photometer,
    Telescope,
    #[default]
    Other,
}

impl DeviceKind {
    /// Whether this kind of device runs observation scripts
    pub fn runs_scripts(self) -> bool {
        matches!(self, DeviceKind::Camera | DeviceKind::Photometer)
    }
}
