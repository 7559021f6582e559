//! pixelflood: a pixel flood server
//!
//! Clients connect over TCP and send one command per line:
//!
//! ```text
//! PX <x> <y> <RRGGBB>
//! ```
//!
//! Each valid command sets one pixel of a shared in-memory framebuffer.
//! Nothing is ever written back to the client. Consumers read the
//! framebuffer through [`Framebuffer::get`] or [`Framebuffer::snapshot`].

pub mod config;
pub mod framebuffer;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod state;

pub use framebuffer::{Color, Framebuffer};
pub use server::{Server, ServerHandle};
