pub mod alerts;
pub mod catalog;
pub mod change_detector;
pub mod prices;
pub mod sources;

pub mod epic {
    pub mod provider;
}
pub mod steam {
    pub mod provider;
}
