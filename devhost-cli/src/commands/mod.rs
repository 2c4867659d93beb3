pub mod external;
pub mod integrity;
pub mod mode;
pub mod reset;
pub mod route;
pub mod tunnel;

use devhost_core::Settings;
use devhost_store::{RouteStore, StateStore};

pub(crate) fn route_store(settings: &Settings) -> RouteStore {
    RouteStore::new(settings.route_file())
}

pub(crate) fn state_store(settings: &Settings) -> StateStore {
    StateStore::new(settings.state_file(), settings.backups_dir())
}
