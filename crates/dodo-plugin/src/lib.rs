//! Out-of-process stage plugins
//!
//! Stage types dodo does not build in are provided by plugin executables. The
//! host finds one with [`find_plugin`], launches it, and talks to it through
//! [`PluginStage`], which implements [`dodo_stage::Stage`] like any built-in.
//!
//! ```text
//!  dodo (host)                               plugin-<type>_<os>_<arch>
//!  ───────────                               ─────────────────────────
//!  launch  ── env DODO_STAGE_PLUGIN=<type> ──▶ serve()
//!          ◀── "1|1|stdio|mux" ─────────────
//!  PluginStage::create ── {"id":1,"body":{"method":"Create"}} ──▶ Stage::create
//!          ◀── {"id":1,"body":{"result":null}} ──
//!  cleanup ── kill ──▶
//! ```

pub mod client;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod server;

pub use client::{PluginProcess, PluginStage, launch};
pub use codec::{Connection, Request, Response};
pub use discovery::{find_plugin, plugin_file_name};
pub use error::{PluginError, Result};
pub use handshake::{Handshake, Protocol};
pub use server::{serve, serve_io};
