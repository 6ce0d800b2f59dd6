//! Pure consent logic: record model, service catalog and prompt fatigue.

pub mod fatigue;
pub mod record;
pub mod registry;
