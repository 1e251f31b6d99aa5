//! Container (CAR) fetch pipeline.

mod car_model;
mod car_reader;
mod car_service;
mod car_traits;

pub use car_model::*;
pub use car_reader::*;
pub use car_service::*;
pub use car_traits::*;
