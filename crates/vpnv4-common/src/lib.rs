//! Common infrastructure for the vpnv4 agent.
//!
//! - [`shell`]: Safe shell command execution with quoting and bounded timeouts
//! - [`error`]: The agent-wide error taxonomy
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use vpnv4_common::{
//!     shell::{self, IP_CMD, shellquote},
//!     AgentResult,
//! };
//!
//! async fn vrf_up(vrf: &str) -> AgentResult<()> {
//!     let cmd = format!("{} link set {} up", IP_CMD, shellquote(vrf));
//!     shell::exec_or_throw(&cmd, Duration::from_secs(30)).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod shell;

pub use error::{AgentError, AgentResult};
