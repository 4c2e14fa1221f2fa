//! Metadata persistence for a local 3D-print asset library.
//!
//! modelvault keeps the catalog of a model library in one SQLite file:
//! asset rows with an open JSON metadata document and tags, named container
//! versions, customization records and the lineage edges between base
//! models and their generated derivatives. On top of the store sit a
//! hash-keyed preview cache, the container folder reconciliation scan and
//! reciprocal links between containers.
//!
//! Every operation is synchronous and opens its own database connection;
//! there are no cross-call transactions and no internal threading, so one
//! [`AssetService`] can back both a UI thread and short-lived workers.

pub mod cache;
pub mod config;
pub mod containers;
pub mod db;
pub mod error;
pub mod gcode;
pub mod import;
pub mod logging;
pub mod metadata;
pub mod scan;
pub mod service;

pub use config::Config;
pub use containers::ContainerService;
pub use db::{
    Asset, AssetRelationship, AssetRepository, AssetUpdate, ContainerVersion, Customization,
    StorageEngine,
};
pub use error::{Error, Result};
pub use service::AssetService;
