pub mod loader;
pub mod resource;
pub mod settings;
pub mod validation;

pub use loader::{LoadedTargets, TargetLoader};
pub use resource::{
    AnyManifest, Manifest, ManifestKind, ManifestWithPath, SettingsManifest, TargetManifest,
    TargetSpec, API_VERSION,
};
pub use settings::ControllerSettings;
pub use validation::TargetValidator;
