pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod inject;
pub mod output;
pub mod redash;
pub mod registry;
pub mod report;
pub mod transform;
pub mod workbook;
