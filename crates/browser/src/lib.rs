//! storysnap browser bridge
//!
//! Implements the discovery bridge on top of Playwright:
//! - Spawns a Node.js driver process and talks JSON lines to it
//! - Fetches the preview document, waiting for the catalog to come up
//! - Serves a built catalog directory on a loopback port
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  PlaywrightBridge (DiscoveryBridge)          │
//! │    ├── fetch_preview_document(url)           │
//! │    └── page(options) -> PlaywrightPage       │
//! │          ├── goto(url)                       │
//! │          ├── eval(script)                    │
//! │          └── close()                         │
//! ├──────────────────────────────────────────────┤
//! │  Driver: node storysnap-driver.js <browser>  │
//! │    stdin  <- {id, method, params}            │
//! │    stdout -> {id, result} | {id, error}      │
//! └──────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod playwright;
pub mod preview;
pub mod server;

pub use error::{BrowserError, BrowserResult};
pub use playwright::{Browser, PlaywrightBridge, PlaywrightConfig, PlaywrightPage};
pub use preview::{fetch_preview_document, PreviewWait};
pub use server::StaticServer;
