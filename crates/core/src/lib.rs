//! Core types for the Meridian geospatial database.
//!
//! This crate carries everything the higher layers agree on:
//! - the unified [`Error`] taxonomy,
//! - the geometry kernel ([`geometry`]) and the tagged [`Object`] variant,
//! - GeoJSON parsing and serialization ([`geojson`]),
//! - geohash, map-tile and quadkey conversions,
//! - glob matching with scan-range derivation,
//! - geodetic distance math ([`dist`]),
//! - JSON dot-path helpers for the JSET/JGET/JDEL commands.
//!
//! Nothing in here performs I/O or holds locks.

#![warn(clippy::all)]

pub mod clip;
pub mod dist;
pub mod error;
pub mod geohash;
pub mod geojson;
pub mod geometry;
pub mod glob;
pub mod json;
pub mod object;
pub mod tiles;

pub use error::{Error, Result};
pub use geometry::{Point, Rect};
pub use object::Object;
