//! imgqc - real-time image quality control for a telescope camera
//!
//! - `camera` - readout events, image acquisition, source extraction
//! - `pipeline` - reduction, persistence, dispatch, rolling aggregation

pub mod camera;
pub mod pipeline;
pub mod sqlite_pragma;
