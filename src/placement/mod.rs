//! Placement Planner
//!
//! - **Planner** (`planner.rs`) - tier selection and block placement
//! - **Reservations** (`reservation.rs`) - per-node space accounting

pub mod planner;
pub mod reservation;

pub use planner::{MirrorStatus, PlacementPlanner, PoolStatus, TierStatus};
pub use reservation::ReservationTable;
