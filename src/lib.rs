//! Weight normalization for candle layers: reparameterizes a wrapped
//! layer's kernel into a direction tensor and a learned per-channel scale,
//! optionally initialized from the statistics of a sample batch.

pub mod config;
pub mod layers;
pub mod weight_norm;
