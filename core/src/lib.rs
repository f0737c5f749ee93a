pub mod cms_import;
pub mod db;
pub mod document;
pub mod error;
pub mod filter;
pub mod framer_import;
pub mod import;
pub mod models;
pub mod service;
