//! Fair, lock-free admission control and transmit scheduling.
//!
//! Many producers feed one arbiter thread that drains them round-robin,
//! enforces a byte-rate limit and forwards packets to a transmit sink,
//! optionally through a batching dispatcher thread.
//!
//! ```text
//! Client ─► own Mailbox ─► PerCpuQueue ─► Arbiter ─► forward Mailbox ─► Dispatcher ─► TransmitSink
//!                          (mailbox refs)   (round-robin,                 (batch mode)
//!                                            rate limit)
//! ```
//!
//! # Example
//!
//! ```
//! use txarb::{SchedulerConfig, SchedulerHandle, TransmitMode};
//! use txarb::runtime::arbiter::Arbiter;
//!
//! let handle = SchedulerHandle::<Vec<u8>>::new();
//! let config = SchedulerConfig {
//!     queues: 1,
//!     mode: TransmitMode::ImmediateSend,
//!     ..SchedulerConfig::default()
//! };
//! let (mut arbiter, _) = Arbiter::new(&handle, &config, |packet: Vec<u8>| {
//!     assert_eq!(packet, b"hello");
//! })
//! .unwrap();
//!
//! let mut client = handle.client(0);
//! client.send(b"hello".to_vec()).unwrap();
//! assert_eq!(arbiter.run_round().transmitted, 1);
//! arbiter.shutdown();
//! ```

pub mod client;
pub mod config;
pub mod handle;
pub mod mailbox;
pub mod packet;
pub mod runtime;
pub mod scheduler;
mod trace;

pub use client::{Client, DropReason, SendError};
pub use config::{ConfigError, MailboxConfig, SchedulerConfig, TransmitMode};
pub use handle::SchedulerHandle;
pub use packet::{Packet, TransmitSink};
pub use runtime::stats::{SchedulerStats, StatsSnapshot};
pub use scheduler::{Scheduler, SchedulerError};
pub use trace::init_tracing;
