//! HTTP layer of the edge node.
//!
//! Validates inbound image paths, serves cached images, fetches misses from
//! the assigned origin while streaming them to the client, and exposes the
//! request counters for scraping.

pub mod handler;
pub mod image_path;
pub mod origin;
