pub mod common;
mod crawl_tests;
mod recovery_tests;
