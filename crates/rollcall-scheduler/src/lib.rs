//! Due-time scheduler daemons with durable publishing and dead-letter
//! recovery.
//!
//! Each scheduler daemon watches one schedule table. It keeps exactly one
//! database session open for queries and one for `LISTEN`, sleeps until the
//! earliest pending row is due or the table changes, and then publishes the
//! row's event and flips the row's flag in a single unit of work.
//!
//! # Architecture
//!
//! 1. **Select** - Read the single earliest unprocessed row
//! 2. **Wait** - Block on the change notifier until due, bounded by the idle
//!    interval
//! 3. **Process** - Lock the row, build its event, publish with broker
//!    confirms, mark it done, commit
//! 4. **Recover** - Drain dead-letter queues back onto the primary exchange
//!
//! The loop is generic over [`ScheduleStore`] and [`EventBuilder`], so the
//! reminder and status-transition daemons share all of it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rollcall_core::{storage::schema::NOTIFICATION_CHANNEL, RealClock};
//! use rollcall_scheduler::{
//!     AmqpBroker, DaemonConfig, PgChangeNotifier, ReminderPolicy, ReminderStore,
//!     SchedulerConfig, SchedulerDaemon,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = SchedulerConfig::load()?;
//! let options = config.database_connect_options()?;
//!
//! let daemon = SchedulerDaemon::new(
//!     ReminderStore::new(options.clone()),
//!     ReminderPolicy,
//!     Box::new(PgChangeNotifier::new(options)),
//!     Box::new(AmqpBroker::new(config.amqp_url.clone(), config.topology()?)),
//!     DaemonConfig::new(NOTIFICATION_CHANNEL),
//!     Arc::new(RealClock::new()),
//!     CancellationToken::new(),
//! );
//! daemon.run().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod builder;
pub mod config;
pub mod daemon;
pub mod dead_letter;
pub mod error;
pub mod health;
pub mod notifier;
pub mod postgres;
pub mod retry_daemon;
pub mod store;

pub use broker::{AmqpBroker, BrokerTopology, DeadLetterSource, MessageBroker, Publisher};
pub use builder::{BuiltEvent, EventBuilder, ReminderPolicy, StatusTransitionPolicy};
pub use config::SchedulerConfig;
pub use daemon::{DaemonConfig, DaemonStats, IterationOutcome, SchedulerDaemon};
pub use dead_letter::{DeadLetterDrainer, DeadLetterStats, DrainPolicy, DrainReport};
pub use error::{Result, SchedulerError};
pub use notifier::{ChangeNotifier, PgChangeNotifier};
pub use postgres::{ReminderStore, StatusStore};
pub use retry_daemon::DeadLetterRetryDaemon;
pub use store::{Disposition, ScheduleRow, ScheduleStore};
